#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_reader;
pub mod memory;
pub mod preview;

use crate::error::Result;
use crate::pipeline::types::Frame;
use serde::Serialize;

/// Container-level metadata reported by the decoder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerMetadata {
    /// Raw `creation_time` tag, usually UTC without an explicit zone.
    pub creation_time: Option<String>,
    /// Device-measured capture rate (e.g. Android slow-motion recordings).
    pub capture_fps: Option<f64>,
    /// Nominal playback frame rate of the video stream.
    pub playback_fps: f64,
    pub duration_secs: Option<f64>,
}

/// What the decoder knows before the first frame is decoded
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub metadata: ContainerMetadata,
}

/// A decoder producing frames in strict, gap-free arrival order.
pub trait VideoSource: Send {
    fn info(&self) -> &VideoInfo;

    /// Next decoded frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn info(&self) -> &VideoInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}
