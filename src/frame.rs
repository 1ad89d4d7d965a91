use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub layout: PixelLayout,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Interleaved pixel byte orders crossing the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelLayout {
    Rgb24,
    Bgr24,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> u32 {
        3
    }

    /// Byte length of one full interleaved frame
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        (width * height * self.bytes_per_pixel()) as usize
    }
}
