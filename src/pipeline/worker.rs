//! The frame-relay loop tying device session, control channel, and sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::control::{ControlCommand, ControlDrain};
use crate::device::session::{DeviceSession, PullError, PushError};
use crate::frame::Frame;
use crate::sink::{LoopbackSink, SinkError};

/// Frame producer half of a device session.
///
/// A trait seam so the relay loop runs against fakes in tests; the
/// production implementation is [`DeviceSession`].
pub trait FrameSource: Send {
    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError>;
    fn push_control(&mut self, cmd: ControlCommand) -> Result<(), PushError>;
    fn close(&mut self);
}

/// Frame consumer half of the virtual sink.
pub trait FrameSink: Send {
    fn submit(&mut self, frame: &Frame) -> Result<(), SinkError>;
    fn pace(&mut self);
    fn close(&mut self);
}

impl FrameSource for DeviceSession {
    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
        DeviceSession::pull_frame(self, timeout)
    }

    fn push_control(&mut self, cmd: ControlCommand) -> Result<(), PushError> {
        DeviceSession::push_control(self, cmd)
    }

    fn close(&mut self) {
        DeviceSession::close(self)
    }
}

impl FrameSink for LoopbackSink {
    fn submit(&mut self, frame: &Frame) -> Result<(), SinkError> {
        LoopbackSink::submit(self, frame)
    }

    fn pace(&mut self) {
        LoopbackSink::pace(self)
    }

    fn close(&mut self) {
        LoopbackSink::close(self)
    }
}

/// Why the relay loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cooperative stop via the stop flag
    Stopped,
    /// The frame stream went away mid-run
    SourceClosed,
    /// The virtual sink rejected a frame write
    SinkFailed,
}

/// The single long-lived relay task.
///
/// Owns the session and sink for the duration of the run and hands both
/// back on exit; teardown belongs to the supervisor, never to the worker.
pub struct PipelineWorker<S, K> {
    source: S,
    sink: K,
    controls: ControlDrain,
    stop: Arc<AtomicBool>,
    pull_timeout: Duration,
}

impl<S: FrameSource, K: FrameSink> PipelineWorker<S, K> {
    pub fn new(
        source: S,
        sink: K,
        controls: ControlDrain,
        stop: Arc<AtomicBool>,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            controls,
            stop,
            pull_timeout,
        }
    }

    /// Run the relay until stopped or the session dies.
    ///
    /// Per paced tick: pull one frame (a timeout skips submission and the
    /// loop continues), forward it to the sink, apply whatever control
    /// commands queued since the last tick in FIFO order, then wait for the
    /// next presentation slot.
    pub fn run(mut self) -> (WorkerExit, S, K) {
        info!("pipeline worker started");

        let exit = loop {
            if self.stop.load(Ordering::Acquire) {
                break WorkerExit::Stopped;
            }

            match self.source.pull_frame(self.pull_timeout) {
                Ok(frame) => {
                    if let Err(e) = self.sink.submit(&frame) {
                        warn!("sink rejected frame: {e}");
                        break WorkerExit::SinkFailed;
                    }
                }
                Err(PullError::Timeout) => debug!("no frame this tick"),
                Err(PullError::Closed) => {
                    info!("frame stream closed");
                    break WorkerExit::SourceClosed;
                }
            }

            for cmd in self.controls.try_drain() {
                if self.source.push_control(cmd) == Err(PushError::Closed) {
                    // Session gone; the rest of this tick's commands die with it
                    warn!(?cmd, "control push failed, discarding remainder");
                    break;
                }
            }

            self.sink.pace();
        };

        info!(?exit, "pipeline worker exiting");
        (exit, self.source, self.sink)
    }
}
