//! Device session: discovery, capture graph bring-up, frame pull, control push

use std::os::unix::io::BorrowedFd;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::control::ControlCommand;
use crate::device::controls::{self, ControlTranslator};
use crate::device::graph::{GraphSpec, CONTROL_STREAM, FRAME_STREAM};
use crate::frame::{Frame, FrameMetadata, PixelLayout};

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("no capture device found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} does not support video capture")]
    NotCapture { path: String },
    #[error("driver rejected the capture graph: {0}")]
    Negotiate(String),
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PullError {
    /// No frame arrived within the bound; a normal empty-tick outcome
    #[error("no frame within the pull timeout")]
    Timeout,
    /// The session has been torn down (or the stream died underneath us)
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("session closed")]
    Closed,
}

/// A discovered capture device
#[derive(Debug, Clone)]
pub struct DeviceRef {
    pub path: String,
    pub card: String,
}

/// Enumerate /dev/video* and return the first capture-capable node.
///
/// Output-capable nodes are skipped so a loaded v4l2loopback sink is never
/// mistaken for the camera.
pub fn discover() -> Result<DeviceRef, DiscoverError> {
    info!("scanning for capture devices");

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE)
            || caps.capabilities.contains(CapFlags::VIDEO_OUTPUT)
        {
            continue;
        }

        info!("found capture device: {} - {}", path, caps.card);
        return Ok(DeviceRef {
            path,
            card: caps.card,
        });
    }

    Err(DiscoverError::NotFound)
}

/// One open connection to the physical capture device.
///
/// Bundles the outbound frame stream and the inbound control stream over a
/// single exclusively-owned device handle. At most one session exists at a
/// time; it is created on a successful connect and destroyed on disconnect
/// or fatal I/O failure.
pub struct DeviceSession {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    translator: ControlTranslator,
    graph: GraphSpec,
    path: String,
    sequence: u64,
}

impl DeviceSession {
    /// Bring up the capture graph on `dev` and start streaming.
    pub fn open(dev: &DeviceRef, graph: GraphSpec) -> Result<Self, ConnectError> {
        info!(path = %dev.path, card = %dev.card, "opening device session");

        let device = Device::with_path(&dev.path).map_err(|source| ConnectError::Open {
            path: dev.path.clone(),
            source,
        })?;

        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(ConnectError::NotCapture {
                path: dev.path.clone(),
            });
        }

        // Negotiate the graph: interleaved RGB at the fixed geometry
        let mut fmt = device.format()?;
        fmt.width = graph.width;
        fmt.height = graph.height;
        fmt.fourcc = FourCC::new(b"RGB3");
        let actual = device.set_format(&fmt)?;
        if actual.width != graph.width || actual.height != graph.height {
            return Err(ConnectError::Negotiate(format!(
                "wanted {}x{}, driver offered {}x{}",
                graph.width, graph.height, actual.width, actual.height
            )));
        }
        if actual.fourcc != fmt.fourcc {
            return Err(ConnectError::Negotiate(format!(
                "wanted {}, driver offered {}",
                fmt.fourcc, actual.fourcc
            )));
        }

        // Target rate is advisory; pacing happens at the sink
        match device.set_params(&Parameters::with_fps(graph.fps)) {
            Ok(params) => debug!(?params, "capture parameters set"),
            Err(e) => warn!("could not set frame interval: {e}"),
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, graph.buffer_count)?;
        info!(
            "capture streaming on \"{}\" with {} buffers, controls on \"{}\"",
            FRAME_STREAM, graph.buffer_count, CONTROL_STREAM
        );

        Ok(Self {
            device: Box::new(device),
            stream: Some(stream),
            translator: ControlTranslator::new(),
            graph,
            path: dev.path.clone(),
            sequence: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Pull the next frame with a bounded wait.
    ///
    /// Polls the capture descriptor for readability before dequeuing so the
    /// wait never exceeds `timeout`.
    pub fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
        if self.stream.is_none() {
            return Err(PullError::Closed);
        }

        let raw = self.device.handle().fd();
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Err(PullError::Timeout),
            Ok(_) => {}
            Err(Errno::EINTR) => return Err(PullError::Timeout),
            Err(e) => {
                warn!("poll on capture descriptor failed: {e}");
                return Err(PullError::Closed);
            }
        }

        let stream = self.stream.as_mut().ok_or(PullError::Closed)?;
        let (buf, meta) = match stream.next() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("frame dequeue failed: {e}");
                return Err(PullError::Closed);
            }
        };

        let take = buf.len().min(self.graph.max_frame_size);
        let data = Bytes::copy_from_slice(&buf[..take]);
        let device_timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        self.sequence += 1;
        let frame_meta = FrameMetadata {
            sequence: self.sequence,
            width: self.graph.width,
            height: self.graph.height,
            stride: self.graph.width * self.graph.layout.bytes_per_pixel(),
            layout: self.graph.layout,
            device_timestamp: Some(device_timestamp),
        };

        Ok(Frame {
            data,
            meta: Arc::new(frame_meta),
            timestamp: Instant::now(),
        })
    }

    /// Translate and send a control command on the inbound control stream.
    ///
    /// Enqueue-and-return from the caller's perspective: control writes do
    /// not wait for the sensor to converge. Controls a given sensor lacks
    /// are skipped rather than treated as fatal.
    pub fn push_control(&mut self, cmd: ControlCommand) -> Result<(), PushError> {
        if self.stream.is_none() {
            return Err(PushError::Closed);
        }

        let fd = self.device.handle().fd();
        for write in self.translator.encode(cmd) {
            if let Err(e) = controls::apply(fd, write) {
                warn!(id = write.id, "control write rejected: {e}");
            }
        }
        debug!(?cmd, stream = CONTROL_STREAM, "control applied");
        Ok(())
    }

    /// Stop streaming and release the device; idempotent.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(path = %self.path, frames = self.sequence, "device session closed");
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
