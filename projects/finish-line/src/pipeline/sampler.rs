// Line sampler: extracts the one-pixel-wide sampling column from a frame.
//
// The rotated path samples the calibrated frame as if the source had been
// rotated about its centre onto an expanded canvas and the calibrated region
// cropped from the middle of that canvas. Only the requested column is
// evaluated.

use crate::error::{Result, SlitScanError};
use crate::pipeline::types::{ColumnPixels, Frame, SamplingConfig, BACKGROUND};
use image::{imageops, Rgb, RgbImage};

/// Residual angles below this (degrees) are treated as exact quarter turns.
const QUARTER_TURN_EPSILON: f64 = 1e-9;

/// A counter-clockwise rotation split into whole quarter turns and a residual.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rotation {
    /// Counter-clockwise quarter turns, 0..4
    quarter_turns: u8,
    residual_degrees: f64,
    total_radians: f64,
}

impl Rotation {
    fn from_degrees(degrees: f64) -> Self {
        let turns = (degrees / 90.0).round();
        let residual_degrees = degrees - turns * 90.0;
        Self {
            quarter_turns: (turns as i64).rem_euclid(4) as u8,
            residual_degrees,
            total_radians: degrees.to_radians(),
        }
    }

    fn is_exact(&self) -> bool {
        self.residual_degrees.abs() < QUARTER_TURN_EPSILON
    }
}

/// Samples the column for `frame` described by `config`.
pub fn sample(frame: &Frame, config: &SamplingConfig) -> Result<ColumnPixels> {
    let (width, height) = frame.image.dimensions();
    if width != config.source_width || height != config.source_height {
        return Err(SlitScanError::Decode(format!(
            "frame {} is {}x{}, expected {}x{}",
            frame.index, width, height, config.source_width, config.source_height
        )));
    }
    if config.line_position >= config.frame_width {
        return Err(SlitScanError::InvalidLinePosition {
            position: config.line_position,
            width: config.frame_width,
        });
    }

    if !config.needs_rotation() {
        return Ok(copy_column(&frame.image, config.line_position));
    }

    let rotation = Rotation::from_degrees(config.rotation_degrees);
    if rotation.is_exact() {
        Ok(quarter_turn_column(&frame.image, config, rotation.quarter_turns))
    } else {
        Ok(interpolated_column(&frame.image, config, rotation))
    }
}

/// Straight copy of column `x`, no resampling.
fn copy_column(image: &RgbImage, x: u32) -> ColumnPixels {
    let (width, height) = image.dimensions();
    let raw = image.as_raw();
    let stride = width as usize * 3;
    let offset = x as usize * 3;
    let pixels = (0..height as usize)
        .map(|y| {
            let i = y * stride + offset;
            Rgb([raw[i], raw[i + 1], raw[i + 2]])
        })
        .collect();
    ColumnPixels(pixels)
}

/// Lossless column read for rotations that are whole quarter turns.
fn quarter_turn_column(
    image: &RgbImage,
    config: &SamplingConfig,
    quarter_turns: u8,
) -> ColumnPixels {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x = config.line_position as i64;
    let pixels = (0..config.frame_height as i64)
        .map(|y| {
            let (sx, sy) = match quarter_turns {
                0 => (x, y),
                1 => (w - 1 - y, x),
                2 => (w - 1 - x, h - 1 - y),
                _ => (y, h - 1 - x),
            };
            if sx < 0 || sy < 0 || sx >= w || sy >= h {
                BACKGROUND
            } else {
                *image.get_pixel(sx as u32, sy as u32)
            }
        })
        .collect();
    ColumnPixels(pixels)
}

fn interpolated_column(
    image: &RgbImage,
    config: &SamplingConfig,
    rotation: Rotation,
) -> ColumnPixels {
    let (sin, cos) = rotation.total_radians.sin_cos();
    let src_cx = image.width() as f64 / 2.0;
    let src_cy = image.height() as f64 / 2.0;
    let u = config.line_position as f64 + 0.5 - config.frame_width as f64 / 2.0;
    let half_h = config.frame_height as f64 / 2.0;

    let pixels = (0..config.frame_height)
        .map(|y| {
            let v = y as f64 + 0.5 - half_h;
            let (sx, sy) = inverse_rotate(u, v, cos, sin);
            bilinear_sample_rgb(image, sx + src_cx - 0.5, sy + src_cy - 0.5)
        })
        .collect();
    ColumnPixels(pixels)
}

/// Maps a point relative to the rotated canvas centre back into source space
/// for a counter-clockwise rotation with the given cos/sin.
#[inline]
fn inverse_rotate(u: f64, v: f64, cos: f64, sin: f64) -> (f64, f64) {
    (u * cos - v * sin, u * sin + v * cos)
}

/// Sample an RGB image at a sub-pixel position (pixel centres on integers)
/// using bilinear interpolation. Neighbours outside the image read as the
/// background colour.
pub fn bilinear_sample_rgb(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return BACKGROUND;
    }

    let fetch = |px: i64, py: i64| -> [f64; 3] {
        if px < 0 || py < 0 || px >= w || py >= h {
            let b = BACKGROUND.0;
            [b[0] as f64, b[1] as f64, b[2] as f64]
        } else {
            let p = img.get_pixel(px as u32, py as u32).0;
            [p[0] as f64, p[1] as f64, p[2] as f64]
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = (1.0 - fx) * (1.0 - fy) * p00[c]
            + fx * (1.0 - fy) * p10[c]
            + (1.0 - fx) * fy * p01[c]
            + fx * fy * p11[c];
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Rotates a whole image counter-clockwise by `degrees` about its centre,
/// expanding the canvas so no corner is clipped. Quarter turns are lossless.
pub fn rotate_expanded(image: &RgbImage, degrees: f64) -> RgbImage {
    let rotation = Rotation::from_degrees(degrees);
    if rotation.is_exact() {
        return match rotation.quarter_turns {
            0 => image.clone(),
            1 => imageops::rotate270(image),
            2 => imageops::rotate180(image),
            _ => imageops::rotate90(image),
        };
    }

    let (w, h) = (image.width() as f64, image.height() as f64);
    let (sin, cos) = rotation.total_radians.sin_cos();
    let out_w = ((w * cos.abs() + h * sin.abs()) - 1e-6).ceil().max(1.0) as u32;
    let out_h = ((w * sin.abs() + h * cos.abs()) - 1e-6).ceil().max(1.0) as u32;

    let (src_cx, src_cy) = (w / 2.0, h / 2.0);
    let (dst_cx, dst_cy) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    RgbImage::from_fn(out_w, out_h, |x, y| {
        let u = x as f64 + 0.5 - dst_cx;
        let v = y as f64 + 0.5 - dst_cy;
        let (sx, sy) = inverse_rotate(u, v, cos, sin);
        bilinear_sample_rgb(image, sx + src_cx - 0.5, sy + src_cy - 0.5)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Direction;

    /// Frame whose red channel encodes x and green channel encodes y.
    fn gradient_frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
    }

    fn rotated_config(
        source: &RgbImage,
        frame_w: u32,
        frame_h: u32,
        line: u32,
        degrees: f64,
    ) -> SamplingConfig {
        SamplingConfig {
            source_width: source.width(),
            source_height: source.height(),
            frame_width: frame_w,
            frame_height: frame_h,
            line_position: line,
            rotation_degrees: degrees,
            direction: Direction::Forward,
            frame_count: 1,
        }
    }

    #[test]
    fn test_unrotated_sample_is_exact_copy() {
        let image = gradient_frame(48, 40);
        let frame = Frame::new(0, image.clone());
        for line in [0, 17, 47] {
            let config = SamplingConfig::unrotated(48, 40, line, Direction::Forward, 1);
            let column = sample(&frame, &config).unwrap();
            assert_eq!(column.len(), 40);
            for (y, px) in column.pixels().iter().enumerate() {
                assert_eq!(px, image.get_pixel(line, y as u32));
            }
        }
    }

    #[test]
    fn test_full_turn_matches_fast_path() {
        let image = gradient_frame(48, 40);
        let frame = Frame::new(0, image.clone());
        let plain = SamplingConfig::unrotated(48, 40, 21, Direction::Forward, 1);
        let fast = sample(&frame, &plain).unwrap();
        let turned = sample(&frame, &rotated_config(&image, 48, 40, 21, 360.0)).unwrap();
        assert_eq!(fast, turned);
    }

    #[test]
    fn test_tiny_rotation_has_no_seam() {
        let image = gradient_frame(48, 40);
        let frame = Frame::new(0, image.clone());
        let plain = SamplingConfig::unrotated(48, 40, 21, Direction::Forward, 1);
        let fast = sample(&frame, &plain).unwrap();
        let tilted = sample(&frame, &rotated_config(&image, 48, 40, 21, 0.01)).unwrap();
        for (a, b) in fast.pixels().iter().zip(tilted.pixels()).skip(1).take(38) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1, "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_quarter_turn_round_trip_is_lossless() {
        let image = gradient_frame(48, 40);
        let rotated = rotate_expanded(&image, 90.0);
        assert_eq!(rotated.dimensions(), (40, 48));

        let frame = Frame::new(0, rotated.clone());
        let config = rotated_config(&rotated, 48, 40, 20, -90.0);
        let column = sample(&frame, &config).unwrap();
        for (y, px) in column.pixels().iter().enumerate() {
            assert_eq!(px, image.get_pixel(20, y as u32));
        }
    }

    #[test]
    fn test_tilt_round_trip_within_tolerance() {
        let image = gradient_frame(48, 40);
        let theta = 12.0;
        let rotated = rotate_expanded(&image, theta);
        assert!(rotated.width() > 48 && rotated.height() > 40);

        let frame = Frame::new(0, rotated.clone());
        let config = rotated_config(&rotated, 48, 40, 20, -theta);
        let column = sample(&frame, &config).unwrap();
        assert_eq!(column.len(), 40);

        for y in 4..36u32 {
            let got = column.pixels()[y as usize];
            let want = image.get_pixel(20, y);
            for c in 0..3 {
                let diff = (got[c] as i32 - want[c] as i32).abs();
                assert!(diff <= 3, "row {} channel {}: got {:?}, want {:?}", y, c, got, want);
            }
        }
    }

    #[test]
    fn test_sample_rejects_wrong_frame_size() {
        let frame = Frame::new(3, gradient_frame(32, 32));
        let config = SamplingConfig::unrotated(48, 40, 10, Direction::Forward, 5);
        assert!(matches!(sample(&frame, &config), Err(SlitScanError::Decode(_))));
    }

    #[test]
    fn test_sample_rejects_line_outside_frame() {
        let frame = Frame::new(0, gradient_frame(48, 40));
        let config = SamplingConfig::unrotated(48, 40, 48, Direction::Forward, 1);
        assert!(matches!(
            sample(&frame, &config),
            Err(SlitScanError::InvalidLinePosition { .. })
        ));
    }

    #[test]
    fn test_bilinear_sample_midpoint() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        img.put_pixel(1, 1, Rgb([100, 0, 0]));
        img.put_pixel(2, 1, Rgb([200, 0, 0]));
        img.put_pixel(1, 2, Rgb([100, 0, 0]));
        img.put_pixel(2, 2, Rgb([200, 0, 0]));
        assert_eq!(bilinear_sample_rgb(&img, 1.5, 1.5)[0], 150);
        assert_eq!(bilinear_sample_rgb(&img, 50.0, 1.0), BACKGROUND);
    }

    #[test]
    fn test_rotation_decomposition() {
        let r = Rotation::from_degrees(-90.0);
        assert_eq!(r.quarter_turns, 3);
        assert!(r.is_exact());

        let r = Rotation::from_degrees(100.0);
        assert_eq!(r.quarter_turns, 1);
        assert!((r.residual_degrees - 10.0).abs() < 1e-9);
        assert!(!r.is_exact());
    }
}
