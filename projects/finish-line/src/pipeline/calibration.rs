use crate::error::Result;
use crate::pipeline::types::{Direction, SamplingConfig};
use serde::{Deserialize, Serialize};

/// Pixels the line ends move apart per skew step
pub const SKEW_STEP: i32 = 5;

/// Interactive calibration of the sampling line against a preview frame.
///
/// Every adjustment returns a new value; width and height are derived from the
/// source dimensions and the quarter-turn count rather than stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub source_width: u32,
    pub source_height: u32,
    pub line_position: u32,
    /// Signed horizontal offset of the line ends from `line_position`.
    pub half_line_skew: i32,
    /// Net counter-clockwise quarter turns applied to the preview.
    pub quarter_turns: i32,
    pub direction: Direction,
}

impl Calibration {
    pub fn new(source_width: u32, source_height: u32) -> Self {
        Self {
            source_width,
            source_height,
            line_position: source_width / 2,
            half_line_skew: 0,
            quarter_turns: 0,
            direction: Direction::Forward,
        }
    }

    pub fn with_line_position(&self, line_position: u32) -> Self {
        Self {
            line_position,
            ..self.clone()
        }
    }

    pub fn with_skew(&self, half_line_skew: i32) -> Self {
        Self {
            half_line_skew,
            ..self.clone()
        }
    }

    pub fn with_direction(&self, direction: Direction) -> Self {
        Self {
            direction,
            ..self.clone()
        }
    }

    pub fn with_quarter_turns(&self, quarter_turns: i32) -> Self {
        Self {
            quarter_turns,
            ..self.clone()
        }
    }

    pub fn skew_counter_clockwise(&self) -> Self {
        self.with_skew(self.half_line_skew + SKEW_STEP)
    }

    pub fn skew_clockwise(&self) -> Self {
        self.with_skew(self.half_line_skew - SKEW_STEP)
    }

    pub fn rotate_image_counter_clockwise(&self) -> Self {
        self.with_quarter_turns(self.quarter_turns + 1)
    }

    pub fn rotate_image_clockwise(&self) -> Self {
        self.with_quarter_turns(self.quarter_turns - 1)
    }

    fn is_transposed(&self) -> bool {
        self.quarter_turns.rem_euclid(2) == 1
    }

    /// Preview width after quarter turns
    pub fn frame_width(&self) -> u32 {
        if self.is_transposed() {
            self.source_height
        } else {
            self.source_width
        }
    }

    pub fn frame_height(&self) -> u32 {
        if self.is_transposed() {
            self.source_width
        } else {
            self.source_height
        }
    }

    /// Angle (degrees) between the skewed line and the vertical.
    pub fn tilt_degrees(&self) -> f64 {
        (self.half_line_skew as f64)
            .atan2(self.frame_height() as f64 / 2.0)
            .to_degrees()
    }

    /// Counter-clockwise correction applied to each frame: tilt is
    /// subtracted, then the quarter turns are added.
    pub fn rotation_degrees(&self) -> f64 {
        -self.tilt_degrees() + 90.0 * self.quarter_turns as f64
    }

    /// Top and bottom end points of the sampling line in preview coordinates.
    pub fn line_endpoints(&self) -> ((f64, f64), (f64, f64)) {
        let x = self.line_position as f64;
        let skew = self.half_line_skew as f64;
        ((x - skew, 0.0), (x + skew, self.frame_height() as f64))
    }

    pub fn sampling_config(&self, frame_count: usize) -> Result<SamplingConfig> {
        let config = SamplingConfig {
            source_width: self.source_width,
            source_height: self.source_height,
            frame_width: self.frame_width(),
            frame_height: self.frame_height(),
            line_position: self.line_position,
            rotation_degrees: self.rotation_degrees(),
            direction: self.direction,
            frame_count,
        };
        config.validate()?;
        Ok(config)
    }
}
