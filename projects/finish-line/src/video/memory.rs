use super::{ContainerMetadata, VideoInfo, VideoSource};
use crate::error::{Result, SlitScanError};
use crate::pipeline::types::Frame;
use image::RgbImage;
use std::collections::VecDeque;
use std::time::Duration;

/// In-memory video source over already decoded frames.
///
/// The reported frame count can be overridden to emulate containers that
/// over- or under-report, and a decode failure can be injected at an index.
pub struct MemorySource {
    info: VideoInfo,
    frames: VecDeque<RgbImage>,
    next_index: usize,
    fail_at: Option<usize>,
    frame_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new(frames: Vec<RgbImage>, playback_fps: f64) -> Self {
        let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        let frame_count = frames.len();
        Self {
            info: VideoInfo {
                frame_count,
                width,
                height,
                metadata: ContainerMetadata {
                    playback_fps,
                    duration_secs: Some(frame_count as f64 / playback_fps),
                    ..Default::default()
                },
            },
            frames: frames.into(),
            next_index: 0,
            fail_at: None,
            frame_delay: None,
        }
    }

    pub fn with_reported_frame_count(mut self, frame_count: usize) -> Self {
        self.info.frame_count = frame_count;
        self
    }

    pub fn with_metadata(mut self, metadata: ContainerMetadata) -> Self {
        self.info.metadata = metadata;
        self
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Sleeps before yielding each frame, emulating a slow decoder.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }
}

impl VideoSource for MemorySource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.fail_at == Some(self.next_index) {
            return Err(SlitScanError::Decode(format!(
                "corrupt packet at frame {}",
                self.next_index
            )));
        }
        if let Some(delay) = self.frame_delay {
            std::thread::sleep(delay);
        }
        Ok(self.frames.pop_front().map(|image| {
            let frame = Frame::new(self.next_index, image);
            self.next_index += 1;
            frame
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_arrive_in_order() {
        let frames = (0..3).map(|_| RgbImage::new(4, 2)).collect();
        let mut source = MemorySource::new(frames, 30.0);
        assert_eq!(source.info().frame_count, 3);
        assert_eq!((source.info().width, source.info().height), (4, 2));

        let indices: Vec<usize> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_metadata_override_feeds_capture_rates() {
        let frames = (0..2).map(|_| RgbImage::new(4, 2)).collect();
        let source = MemorySource::new(frames, 30.0).with_metadata(ContainerMetadata {
            creation_time: Some("2024-06-01T08:00:00.000000Z".to_string()),
            capture_fps: Some(240.0),
            playback_fps: 30.0,
            duration_secs: Some(2.0),
        });
        let rates = crate::timing::CaptureRates::from_metadata(&source.info().metadata);
        assert_eq!(rates.effective_fps(), 240.0);
        assert_eq!(source.info().frame_count, 2);
        assert!(source.info().metadata.creation_time.is_some());
    }

    #[test]
    fn test_injected_failure() {
        let frames = (0..3).map(|_| RgbImage::new(4, 2)).collect();
        let mut source = MemorySource::new(frames, 30.0).failing_at(1);
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(source.next_frame(), Err(SlitScanError::Decode(_))));
    }
}
