use crate::pipeline::calibration::Calibration;
use crate::pipeline::sampler::rotate_expanded;
use crate::video::VideoSource;
use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use std::path::Path;

const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_HALF_WIDTH: i64 = 1;

/// Saves the first frame of `source` with the sampling line drawn over it.
///
/// The default view shows the frame after quarter turns only, with the line
/// slanted by the current skew. The corrected view applies the full rotation
/// so the line is vertical, which is what the sampler actually reads.
pub fn extract_preview_frame<S: VideoSource + ?Sized>(
    source: &mut S,
    calibration: &Calibration,
    output_path: &Path,
    corrected: bool,
) -> Result<RgbImage> {
    let frame = source
        .next_frame()?
        .context("Video has no frames to preview")?;
    let (w, h) = frame.image.dimensions();
    if (w, h) != (calibration.source_width, calibration.source_height) {
        bail!(
            "Calibration is for {}x{} frames but the video is {}x{}",
            calibration.source_width,
            calibration.source_height,
            w,
            h
        );
    }

    let preview = render_preview(&frame.image, calibration, corrected);
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    preview
        .save(output_path)
        .with_context(|| format!("Failed to write preview {:?}", output_path))?;
    tracing::info!(
        "Preview: wrote {}x{} frame to {:?} (corrected={})",
        preview.width(),
        preview.height(),
        output_path,
        corrected
    );
    Ok(preview)
}

pub fn render_preview(image: &RgbImage, calibration: &Calibration, corrected: bool) -> RgbImage {
    if corrected {
        let mut rotated = rotate_expanded(image, calibration.rotation_degrees());
        // Calibrated frame sits in the middle of the expanded canvas.
        let offset = (rotated.width() as f64 - calibration.frame_width() as f64) / 2.0;
        let x = calibration.line_position as f64 + offset;
        let height = rotated.height() as f64;
        draw_line(&mut rotated, (x, 0.0), (x, height));
        rotated
    } else {
        let mut turned = rotate_expanded(image, 90.0 * calibration.quarter_turns as f64);
        let (top, bottom) = calibration.line_endpoints();
        draw_line(&mut turned, top, bottom);
        turned
    }
}

fn draw_line(image: &mut RgbImage, from: (f64, f64), to: (f64, f64)) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as i64;
    let (w, h) = (image.width() as i64, image.height() as i64);

    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let cx = (from.0 + dx * t).floor() as i64;
        let cy = (from.1 + dy * t).floor() as i64;
        for x in cx - LINE_HALF_WIDTH..=cx + LINE_HALF_WIDTH {
            if x >= 0 && x < w && cy >= 0 && cy < h {
                image.put_pixel(x as u32, cy as u32, LINE_COLOR);
            }
        }
    }
}
