//! Connection supervisor
//!
//! The async task that owns the connection state machine: it consumes panel
//! requests and worker fault events, performs session/sink bring-up and
//! teardown, spawns and joins the pipeline worker, and emits status events
//! back to the panel. All teardown lives here; the worker only hands its
//! resources back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{self, ControlCommand, ControlSender};
use crate::device::{self, DeviceRef, GraphSpec};
use crate::pipeline::{FrameSink, FrameSource, PipelineWorker, WorkerExit};
use crate::sink::LoopbackSink;
use crate::state::{ConnectionState, SharedState};
use crate::Config;

/// Requests from the panel into the supervisor
#[derive(Debug, Clone, Copy)]
pub enum UiRequest {
    Connect,
    Disconnect,
    Control(ControlCommand),
    Shutdown,
}

/// Notifications from the supervisor back to the panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Text for the status line
    Status(String),
    /// Enable the sensor controls
    DeviceConnected,
    /// Disable the sensor controls
    DeviceDisconnected,
}

/// Why a connect attempt could not produce a running pipeline
#[derive(Debug, Error)]
pub enum OpenFailure {
    #[error("no device found")]
    NotFound,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("virtual sink unavailable: {0}")]
    Sink(String),
}

/// Produces the session/sink pair a pipeline run needs.
///
/// The seam that lets supervisor tests run against fakes; production uses
/// [`V4l2Factory`].
pub trait PipelineFactory: Send + Sync + 'static {
    type Source: FrameSource + 'static;
    type Sink: FrameSink + 'static;

    fn open(&self, config: &Config) -> Result<(Self::Source, Self::Sink), OpenFailure>;
}

/// The production factory: V4L2 capture device plus v4l2loopback sink.
pub struct V4l2Factory;

impl PipelineFactory for V4l2Factory {
    type Source = device::DeviceSession;
    type Sink = LoopbackSink;

    fn open(&self, config: &Config) -> Result<(Self::Source, Self::Sink), OpenFailure> {
        let dev = if config.device.path.is_empty() {
            device::discover().map_err(|_| OpenFailure::NotFound)?
        } else {
            DeviceRef {
                path: config.device.path.clone(),
                card: String::new(),
            }
        };

        let graph = GraphSpec::rgb_interleaved(
            config.device.width,
            config.device.height,
            config.device.fps,
        );
        let session = device::DeviceSession::open(&dev, graph)
            .map_err(|e| OpenFailure::Connect(e.to_string()))?;
        let sink =
            LoopbackSink::open(&config.sink).map_err(|e| OpenFailure::Sink(e.to_string()))?;
        Ok((session, sink))
    }
}

enum WorkerEvent {
    Fault(WorkerExit),
}

struct ActivePipeline<S, K> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<(WorkerExit, S, K)>,
    controls: ControlSender,
}

pub struct Supervisor<F: PipelineFactory> {
    factory: Arc<F>,
    config: Config,
    state: Arc<SharedState>,
    requests: Receiver<UiRequest>,
    status: Sender<StatusEvent>,
    worker_tx: Sender<WorkerEvent>,
    worker_rx: Receiver<WorkerEvent>,
    active: Option<ActivePipeline<F::Source, F::Sink>>,
}

impl<F: PipelineFactory> Supervisor<F> {
    pub fn new(
        config: Config,
        factory: F,
        state: Arc<SharedState>,
        requests: Receiver<UiRequest>,
        status: Sender<StatusEvent>,
    ) -> Self {
        let (worker_tx, worker_rx) = flume::unbounded();
        Self {
            factory: Arc::new(factory),
            config,
            state,
            requests,
            status,
            worker_tx,
            worker_rx,
            active: None,
        }
    }

    pub async fn run(mut self) {
        // local clones so the select futures don't hold a borrow of self
        let requests = self.requests.clone();
        let worker_events = self.worker_rx.clone();
        loop {
            tokio::select! {
                request = requests.recv_async() => match request {
                    Ok(UiRequest::Connect) => self.connect().await,
                    Ok(UiRequest::Disconnect) => self.disconnect().await,
                    Ok(UiRequest::Control(cmd)) => self.forward_control(cmd),
                    Ok(UiRequest::Shutdown) | Err(_) => {
                        self.disconnect().await;
                        break;
                    }
                },
                event = worker_events.recv_async() => {
                    if let Ok(WorkerEvent::Fault(exit)) = event {
                        warn!(?exit, "pipeline fault");
                        self.disconnect().await;
                    }
                }
            }
        }
        info!("supervisor exiting");
    }

    async fn connect(&mut self) {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            warn!(state = ?self.state.get(), "connect rejected");
            return;
        }
        self.emit_status("Connecting...");

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || factory.open(&config)).await;

        let (source, sink) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("connect failed: {e}");
                self.state.set(ConnectionState::Disconnected);
                self.emit_status("Connection Failed");
                return;
            }
            Err(e) => {
                warn!("connect task failed: {e}");
                self.state.set(ConnectionState::Disconnected);
                self.emit_status("Connection Failed");
                return;
            }
        };

        // Fresh channel per session: nothing queues across a disconnect
        let (controls, drain) = control::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let pull_timeout = Duration::from_millis(self.config.pipeline.pull_timeout_ms);
        let worker = PipelineWorker::new(source, sink, drain, Arc::clone(&stop), pull_timeout);

        let events = self.worker_tx.clone();
        let stop_seen_by_worker = Arc::clone(&stop);
        let handle = tokio::task::spawn_blocking(move || {
            let (exit, source, sink) = worker.run();
            // A stop-requested exit is the normal path; anything else is a
            // fault the supervisor has to react to.
            if exit != WorkerExit::Stopped && !stop_seen_by_worker.load(Ordering::Acquire) {
                let _ = events.send(WorkerEvent::Fault(exit));
            }
            (exit, source, sink)
        });

        self.active = Some(ActivePipeline {
            stop,
            handle,
            controls,
        });
        self.state.set(ConnectionState::Connected);
        self.emit_status("Connected");
        let _ = self.status.send(StatusEvent::DeviceConnected);
        info!("pipeline connected");
    }

    async fn disconnect(&mut self) {
        if !self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            debug!(state = ?self.state.get(), "nothing to disconnect");
            return;
        }

        let Some(active) = self.active.take() else {
            self.state.set(ConnectionState::Disconnected);
            return;
        };

        active.stop.store(true, Ordering::Release);
        let bound = Duration::from_millis(self.config.pipeline.stop_timeout_ms);
        match tokio::time::timeout(bound, active.handle).await {
            Ok(Ok((exit, mut source, mut sink))) => {
                debug!(?exit, "worker joined");
                source.close();
                sink.close();
            }
            Ok(Err(e)) => warn!("worker task failed: {e}"),
            Err(_) => {
                // Force-release: the handles drop whenever the straggler
                // thread finally returns; we do not wait for it.
                warn!("worker did not stop within {bound:?}, abandoning its handles");
            }
        }

        self.state.set(ConnectionState::Disconnected);
        self.emit_status("Disconnected");
        let _ = self.status.send(StatusEvent::DeviceDisconnected);
        info!("pipeline disconnected");
    }

    /// Commands are deliberately dropped when no open session exists;
    /// nothing queues across a disconnect boundary.
    fn forward_control(&mut self, cmd: ControlCommand) {
        if self.state.get() != ConnectionState::Connected {
            debug!(?cmd, "dropping control while disconnected");
            return;
        }
        if let Some(active) = &self.active {
            if !active.controls.push(cmd) {
                debug!(?cmd, "control channel gone");
            }
        }
    }

    fn emit_status(&self, text: &str) {
        let _ = self.status.send(StatusEvent::Status(text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use crate::device::{PullError, PushError};
    use crate::frame::{Frame, FrameMetadata, PixelLayout};
    use crate::sink::SinkError;

    fn test_frame(sequence: u64) -> Frame {
        Frame::new(
            Bytes::from_static(&[9, 8, 7]),
            FrameMetadata {
                sequence,
                width: 1,
                height: 1,
                stride: 3,
                layout: PixelLayout::Rgb24,
                device_timestamp: None,
            },
        )
    }

    /// Shared inspection handles surviving the move into the worker thread
    #[derive(Clone, Default)]
    struct Probes {
        pulls: Arc<AtomicUsize>,
        pushed: Arc<Mutex<Vec<ControlCommand>>>,
        source_closed: Arc<AtomicUsize>,
        submitted: Arc<AtomicUsize>,
        sink_closed: Arc<AtomicUsize>,
    }

    struct FakeSource {
        script: VecDeque<Result<Frame, PullError>>,
        probes: Probes,
    }

    impl FrameSource for FakeSource {
        fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
            self.probes.pulls.fetch_add(1, Ordering::SeqCst);
            if let Some(result) = self.script.pop_front() {
                return result;
            }
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
            Err(PullError::Timeout)
        }

        fn push_control(&mut self, cmd: ControlCommand) -> Result<(), PushError> {
            self.probes.pushed.lock().unwrap().push(cmd);
            Ok(())
        }

        fn close(&mut self) {
            self.probes.source_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeSink {
        probes: Probes,
    }

    impl FrameSink for FakeSink {
        fn submit(&mut self, _frame: &Frame) -> Result<(), SinkError> {
            self.probes.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pace(&mut self) {}

        fn close(&mut self) {
            self.probes.sink_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        fail: Option<fn() -> OpenFailure>,
        script: Mutex<VecDeque<Result<Frame, PullError>>>,
        probes: Probes,
    }

    impl FakeFactory {
        fn failing(fail: fn() -> OpenFailure) -> Self {
            Self {
                fail: Some(fail),
                script: Mutex::new(VecDeque::new()),
                probes: Probes::default(),
            }
        }

        fn with_script(script: Vec<Result<Frame, PullError>>) -> Self {
            Self {
                fail: None,
                script: Mutex::new(script.into()),
                probes: Probes::default(),
            }
        }
    }

    impl PipelineFactory for FakeFactory {
        type Source = FakeSource;
        type Sink = FakeSink;

        fn open(&self, _config: &Config) -> Result<(FakeSource, FakeSink), OpenFailure> {
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            Ok((
                FakeSource {
                    script: std::mem::take(&mut *self.script.lock().unwrap()),
                    probes: self.probes.clone(),
                },
                FakeSink {
                    probes: self.probes.clone(),
                },
            ))
        }
    }

    struct Harness {
        requests: Sender<UiRequest>,
        status: Receiver<StatusEvent>,
        state: Arc<SharedState>,
        probes: Probes,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(factory: FakeFactory) -> Harness {
        let probes = factory.probes.clone();
        let state = Arc::new(SharedState::new());
        let (req_tx, req_rx) = flume::unbounded();
        let (status_tx, status_rx) = flume::unbounded();
        let mut config = Config::default();
        config.pipeline.pull_timeout_ms = 5;
        let supervisor = Supervisor::new(config, factory, Arc::clone(&state), req_rx, status_tx);
        let task = tokio::spawn(supervisor.run());
        Harness {
            requests: req_tx,
            status: status_rx,
            state,
            probes,
            task,
        }
    }

    async fn next_status(harness: &Harness) -> StatusEvent {
        tokio::time::timeout(Duration::from_secs(2), harness.status.recv_async())
            .await
            .expect("status event within bound")
            .expect("status channel alive")
    }

    async fn shutdown(harness: Harness) {
        let _ = harness.requests.send(UiRequest::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(2), harness.task).await;
    }

    #[tokio::test]
    async fn discover_failure_reverts_to_disconnected() {
        let harness = start(FakeFactory::failing(|| OpenFailure::NotFound));
        harness.requests.send(UiRequest::Connect).unwrap();

        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connecting...".into())
        );
        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connection Failed".into())
        );
        assert_eq!(harness.state.get(), ConnectionState::Disconnected);
        // the worker was never started
        assert_eq!(harness.probes.pulls.load(Ordering::SeqCst), 0);
        shutdown(harness).await;
    }

    #[tokio::test]
    async fn sink_failure_reverts_to_disconnected() {
        let harness = start(FakeFactory::failing(|| {
            OpenFailure::Sink("no loopback device".into())
        }));
        harness.requests.send(UiRequest::Connect).unwrap();

        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connecting...".into())
        );
        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connection Failed".into())
        );
        assert_eq!(harness.state.get(), ConnectionState::Disconnected);
        shutdown(harness).await;
    }

    #[tokio::test]
    async fn connect_then_disconnect_closes_everything_once() {
        let harness = start(FakeFactory::with_script(vec![]));
        harness.requests.send(UiRequest::Connect).unwrap();

        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connecting...".into())
        );
        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Connected".into())
        );
        assert_eq!(next_status(&harness).await, StatusEvent::DeviceConnected);
        assert_eq!(harness.state.get(), ConnectionState::Connected);

        harness.requests.send(UiRequest::Disconnect).unwrap();
        assert_eq!(
            next_status(&harness).await,
            StatusEvent::Status("Disconnected".into())
        );
        assert_eq!(next_status(&harness).await, StatusEvent::DeviceDisconnected);
        assert_eq!(harness.state.get(), ConnectionState::Disconnected);
        assert_eq!(harness.probes.source_closed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.probes.sink_closed.load(Ordering::SeqCst), 1);

        // race-free teardown: the old session sees no further pulls
        let pulls = harness.probes.pulls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.probes.pulls.load(Ordering::SeqCst), pulls);
        shutdown(harness).await;
    }

    #[tokio::test]
    async fn worker_fault_tears_the_pipeline_down() {
        let harness = start(FakeFactory::with_script(vec![
            Ok(test_frame(1)),
            Ok(test_frame(2)),
            Ok(test_frame(3)),
            Err(PullError::Closed),
        ]));
        harness.requests.send(UiRequest::Connect).unwrap();

        // walk to Disconnected without any user request
        loop {
            if next_status(&harness).await == StatusEvent::Status("Disconnected".into()) {
                break;
            }
        }
        assert_eq!(harness.state.get(), ConnectionState::Disconnected);
        assert_eq!(harness.probes.submitted.load(Ordering::SeqCst), 3);
        assert_eq!(harness.probes.sink_closed.load(Ordering::SeqCst), 1);
        shutdown(harness).await;
    }

    #[tokio::test]
    async fn commands_do_not_queue_across_a_disconnect_boundary() {
        let harness = start(FakeFactory::with_script(vec![]));

        // no session: dropped, no crash
        harness
            .requests
            .send(UiRequest::Control(ControlCommand::SetManualFocus(128)))
            .unwrap();

        harness.requests.send(UiRequest::Connect).unwrap();
        loop {
            if next_status(&harness).await == StatusEvent::DeviceConnected {
                break;
            }
        }
        // give the worker a few ticks to drain whatever it can see
        tokio::time::sleep(Duration::from_millis(40)).await;
        harness.requests.send(UiRequest::Disconnect).unwrap();
        loop {
            if next_status(&harness).await == StatusEvent::DeviceDisconnected {
                break;
            }
        }

        assert!(harness.probes.pushed.lock().unwrap().is_empty());
        shutdown(harness).await;
    }

    #[tokio::test]
    async fn commands_reach_the_session_while_connected() {
        let harness = start(FakeFactory::with_script(vec![]));
        harness.requests.send(UiRequest::Connect).unwrap();
        loop {
            if next_status(&harness).await == StatusEvent::DeviceConnected {
                break;
            }
        }

        harness
            .requests
            .send(UiRequest::Control(ControlCommand::SetManualFocus(10)))
            .unwrap();
        harness
            .requests
            .send(UiRequest::Control(ControlCommand::SetManualFocus(20)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            *harness.probes.pushed.lock().unwrap(),
            vec![
                ControlCommand::SetManualFocus(10),
                ControlCommand::SetManualFocus(20),
            ]
        );
        shutdown(harness).await;
    }
}
