//! Capture graph description negotiated with the device at open time

use serde::{Deserialize, Serialize};

use crate::frame::PixelLayout;

/// Name of the outbound frame stream
pub const FRAME_STREAM: &str = "rgb";
/// Name of the inbound control stream
pub const CONTROL_STREAM: &str = "control";

/// What the capture graph must deliver: sensor configured for the target
/// geometry with interleaved RGB output, capped at `max_frame_size` bytes
/// per frame, wired to the named frame stream, with sensor controls accepted
/// on the named control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub layout: PixelLayout,
    pub interleaved: bool,
    pub max_frame_size: usize,
    /// Driver-side buffer circulation; not app-visible frame history
    pub buffer_count: u32,
}

impl GraphSpec {
    /// An interleaved RGB graph for the given geometry
    pub fn rgb_interleaved(width: u32, height: u32, fps: u32) -> Self {
        let layout = PixelLayout::Rgb24;
        Self {
            width,
            height,
            fps,
            layout,
            interleaved: true,
            max_frame_size: layout.frame_len(width, height),
            buffer_count: 4,
        }
    }

    /// The fixed 1080p RGB graph the relay runs with
    pub fn hd_1080(fps: u32) -> Self {
        Self::rgb_interleaved(1920, 1080, fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hd_graph_caps_frame_size() {
        let graph = GraphSpec::hd_1080(30);
        assert_eq!(graph.max_frame_size, 1920 * 1080 * 3);
        assert_eq!(graph.max_frame_size, 6_220_800);
        assert!(graph.interleaved);
        assert_eq!(graph.layout, PixelLayout::Rgb24);
    }
}
