use super::{ContainerMetadata, VideoInfo, VideoSource};
use crate::error::SlitScanError;
use crate::pipeline::types::Frame;
use anyhow::{anyhow, Context};
use image::RgbImage;
use std::path::Path;

use ffmpeg_next::ffi;

/// Container tag Android writes for high-frame-rate recordings.
const CAPTURE_FPS_TAG: &str = "com.android.capture.fps";

/// Sequential video decoder backed by FFmpeg via ffmpeg-next.
/// Frames are converted to packed RGB24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    info: VideoInfo,
    frames_decoded: usize,
    /// Persistent packet object to avoid allocations.
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    /// Whether we've sent EOF to the decoder.
    eof_sent: bool,
}

// SAFETY: FfmpegReader is only ever used from the single decode thread in the pipeline.
// The raw pointers inside ffmpeg-next types are not shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !path.exists() {
            return Err(anyhow!("Video file not found: {:?}", path));
        }

        let input_ctx = ffmpeg_next::format::input(&path).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {:?}", path))?;

        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let playback_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let duration_secs = match input_ctx.duration() {
            d if d > 0 => Some(d as f64 / ffi::AV_TIME_BASE as f64),
            _ => None,
        };

        let format_tags = input_ctx.metadata();
        let stream_tags = video_stream.metadata();
        let creation_time = format_tags
            .get("creation_time")
            .or_else(|| stream_tags.get("creation_time"))
            .map(str::to_string);
        let capture_fps = format_tags
            .get(CAPTURE_FPS_TAG)
            .or_else(|| stream_tags.get(CAPTURE_FPS_TAG))
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|f| f.is_finite() && *f > 0.0);

        let stream_frames = video_stream.frames().max(0) as usize;
        let frame_count = if stream_frames > 0 {
            stream_frames
        } else {
            // Containers without a frame count: count packets in a separate demux pass.
            let counted = count_video_packets(path, video_stream_index)?;
            tracing::debug!(
                "FfmpegReader: stream reports no frame count, counted {} packets",
                counted
            );
            counted
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();

        tracing::info!(
            "FfmpegReader: opened {:?}, {}x{}, duration={:?}s, fps={:.2}, capture_fps={:?}, frames={}",
            path,
            width,
            height,
            duration_secs,
            playback_fps,
            capture_fps,
            frame_count
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            info: VideoInfo {
                frame_count,
                width,
                height,
                metadata: ContainerMetadata {
                    creation_time,
                    capture_fps,
                    playback_fps,
                    duration_secs,
                },
            },
            frames_decoded: 0,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pulls the next decoded frame. `Ok(false)` means the stream is drained.
    fn decode_loop(
        &mut self,
        target_frame: &mut ffmpeg_next::util::frame::Video,
    ) -> anyhow::Result<bool> {
        loop {
            match self.decoder.receive_frame(target_frame) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until we find a video packet or reach EOF
            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn get_or_create_scaler(
        &mut self,
        src_format: ffmpeg_next::format::Pixel,
    ) -> anyhow::Result<&mut ffmpeg_next::software::scaling::Context> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                src_format,
                self.info.width,
                self.info.height,
                ffmpeg_next::format::Pixel::RGB24,
                self.info.width,
                self.info.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        self.scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler not initialized"))
    }

    fn read_rgb(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_loop(&mut raw)? {
            return Ok(None);
        }

        let scaler = self.get_or_create_scaler(raw.format())?;
        let mut rgb = ffmpeg_next::util::frame::Video::empty();
        scaler.run(&raw, &mut rgb).context("Scaler failed")?;
        Ok(Some(rgb_frame_to_image(&rgb)?))
    }
}

/// Copies a packed RGB24 frame row by row, skipping the stride padding.
fn rgb_frame_to_image(frame: &ffmpeg_next::util::frame::Video) -> anyhow::Result<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width * 3;

    let mut buf = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let src_offset = y * stride;
        let row = data
            .get(src_offset..src_offset + row_bytes)
            .ok_or_else(|| anyhow!("RGB frame buffer shorter than expected at row {}", y))?;
        buf.extend_from_slice(row);
    }
    RgbImage::from_raw(width as u32, height as u32, buf)
        .ok_or_else(|| anyhow!("Failed to build {}x{} RGB image", width, height))
}

fn count_video_packets(path: &Path, stream_index: usize) -> anyhow::Result<usize> {
    let mut input =
        ffmpeg_next::format::input(&path).context("Failed to reopen video for counting")?;
    Ok(input
        .packets()
        .filter(|(stream, _)| stream.index() == stream_index)
        .count())
}

impl VideoSource for FfmpegReader {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> crate::error::Result<Option<Frame>> {
        let image = self.read_rgb().map_err(|e| {
            SlitScanError::Decode(format!("frame {}: {:#}", self.frames_decoded, e))
        })?;
        Ok(image.map(|image| {
            let frame = Frame::new(self.frames_decoded, image);
            self.frames_decoded += 1;
            frame
        }))
    }
}
