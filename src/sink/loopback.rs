//! Virtual webcam output via a v4l2loopback device
//!
//! Frames written here appear to other applications as a standard camera
//! source. Requires the `v4l2loopback` kernel module, e.g.:
//!
//! ```bash
//! sudo modprobe v4l2loopback devices=1 card_label="oakcam"
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::video::Output;
use v4l::{Device, FourCC};

use crate::frame::{Frame, PixelLayout};
use crate::SinkConfig;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no virtual camera device available: {0}")]
    Unavailable(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("frame has {got} bytes, sink expects {expected}")]
    Geometry { expected: usize, got: usize },
    #[error("frame write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// The open virtual output device: fixed geometry, fixed rate, BGR order.
///
/// `submit` is the single point where the capture side's RGB byte order
/// becomes the BGR order the sink expects. `pace` is the pipeline's sole
/// rate limiter.
pub struct LoopbackSink {
    path: String,
    file: Option<File>,
    width: u32,
    height: u32,
    scratch: Vec<u8>,
    pacer: Pacer,
    frames_written: u64,
}

impl LoopbackSink {
    /// Locate and configure the loopback node, then open it for writing.
    pub fn open(config: &SinkConfig) -> Result<Self, SinkError> {
        let path = if config.path.is_empty() {
            find_output_device()?
        } else {
            config.path.clone()
        };

        info!(
            "opening virtual sink {} ({}x{} @ {} fps, BGR)",
            path, config.width, config.height, config.fps
        );

        let device = Device::with_path(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let caps = device.query_caps().map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        if !caps.capabilities.contains(CapFlags::VIDEO_OUTPUT) {
            return Err(SinkError::Unavailable(format!(
                "{path} is not an output device"
            )));
        }

        let fmt = v4l::Format::new(config.width, config.height, FourCC::new(b"BGR3"));
        // v4l2loopback often negotiates on first write; a refusal here is
        // not necessarily fatal
        if let Err(e) = Output::set_format(&device, &fmt) {
            warn!("could not set sink format (may still work): {e}");
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;

        let frame_len = PixelLayout::Bgr24.frame_len(config.width, config.height);
        Ok(Self {
            path,
            file: Some(file),
            width: config.width,
            height: config.height,
            scratch: Vec::with_capacity(frame_len),
            pacer: Pacer::new(config.fps),
            frames_written: 0,
        })
    }

    /// Reorder into the sink's byte order and write one full frame.
    pub fn submit(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Unavailable("sink closed".into()))?;

        let expected = PixelLayout::Bgr24.frame_len(self.width, self.height);
        if frame.data.len() != expected {
            return Err(SinkError::Geometry {
                expected,
                got: frame.data.len(),
            });
        }

        let bytes = match frame.meta.layout {
            PixelLayout::Rgb24 => {
                rgb_to_bgr(&frame.data, &mut self.scratch);
                &self.scratch[..]
            }
            PixelLayout::Bgr24 => &frame.data[..],
        };
        file.write_all(bytes).map_err(SinkError::Write)?;

        self.frames_written += 1;
        debug!(sequence = frame.meta.sequence, "frame submitted");
        Ok(())
    }

    /// Block until the next presentation slot at the configured rate.
    pub fn pace(&mut self) {
        self.pacer.wait();
    }

    /// Release the device; idempotent.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            info!(path = %self.path, frames = self.frames_written, "virtual sink closed");
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for LoopbackSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scan /dev/video* for an output-capable node (the loopback device).
fn find_output_device() -> Result<String, SinkError> {
    for i in 0..64 {
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
        if caps.capabilities.contains(CapFlags::VIDEO_OUTPUT) {
            info!("found virtual camera device: {} - {}", path, caps.card);
            return Ok(path);
        }
    }
    Err(SinkError::Unavailable(
        "no v4l2loopback output device found; is the module loaded?".into(),
    ))
}

/// Swap the R and B channels of an interleaved 3-byte pixel buffer.
fn rgb_to_bgr(src: &[u8], dst: &mut Vec<u8>) {
    dst.resize(src.len(), 0);
    for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
        d[0] = s[2];
        d[1] = s[1];
        d[2] = s[0];
    }
}

/// Deadline arithmetic for the fixed output rate.
///
/// A tick that overran a full period re-anchors instead of bursting to
/// catch up.
struct Pacer {
    period: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / fps.max(1),
            next_due: None,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now + self.period);
        if due > now {
            std::thread::sleep(due - now);
        }
        let after = Instant::now();
        self.next_due = Some(if after > due + self.period {
            after + self.period
        } else {
            due + self.period
        });
    }
}
