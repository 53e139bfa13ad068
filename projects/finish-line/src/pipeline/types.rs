use crate::error::{Result, SlitScanError};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Background colour of a freshly allocated raster.
pub const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Direction of travel across the finish line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Left to right: earliest frames land at the right edge of the raster.
    #[default]
    Forward,
    /// Right to left: earliest frames land at the left edge.
    Reverse,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "ltr" | "left-to-right" => Ok(Direction::Forward),
            "reverse" | "rtl" | "right-to-left" => Ok(Direction::Reverse),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// A decoded video frame tagged with its arrival index
pub struct Frame {
    pub index: usize,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: usize, image: RgbImage) -> Self {
        Self { index, image }
    }
}

/// One output column: `frame_height` RGB samples, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPixels(pub Vec<Rgb<u8>>);

impl ColumnPixels {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pixels(&self) -> &[Rgb<u8>] {
        &self.0
    }
}

/// Immutable per-run sampling parameters.
///
/// `frame_width`/`frame_height` describe the calibrated frame (after any
/// quarter-turn rotation), which is the coordinate space `line_position` lives
/// in. `source_width`/`source_height` are the decoded frame dimensions.
/// `rotation_degrees` is the counter-clockwise correction applied to every
/// frame before sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub source_width: u32,
    pub source_height: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub line_position: u32,
    pub rotation_degrees: f64,
    pub direction: Direction,
    pub frame_count: usize,
}

impl SamplingConfig {
    /// Config for an uncorrected run where the calibrated frame is the source frame.
    pub fn unrotated(
        width: u32,
        height: u32,
        line_position: u32,
        direction: Direction,
        frame_count: usize,
    ) -> Self {
        Self {
            source_width: width,
            source_height: height,
            frame_width: width,
            frame_height: height,
            line_position,
            rotation_degrees: 0.0,
            direction,
            frame_count,
        }
    }

    pub fn needs_rotation(&self) -> bool {
        self.rotation_degrees != 0.0
    }

    /// Checks the config before any frame is decoded.
    pub fn validate(&self) -> Result<()> {
        if self.frame_count == 0 {
            return Err(SlitScanError::InvalidFrameGeometry(
                "video reports zero frames".to_string(),
            ));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(SlitScanError::InvalidFrameGeometry(format!(
                "empty calibrated frame {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if !self.rotation_degrees.is_finite() {
            return Err(SlitScanError::InvalidFrameGeometry(format!(
                "rotation {} is not finite",
                self.rotation_degrees
            )));
        }
        if !self.needs_rotation()
            && (self.frame_width != self.source_width || self.frame_height != self.source_height)
        {
            return Err(SlitScanError::InvalidFrameGeometry(format!(
                "unrotated config maps {}x{} source onto {}x{} frame",
                self.source_width, self.source_height, self.frame_width, self.frame_height
            )));
        }
        if self.line_position >= self.frame_width {
            return Err(SlitScanError::InvalidLinePosition {
                position: self.line_position,
                width: self.frame_width,
            });
        }
        Ok(())
    }
}

/// Lifecycle of a reconstruction run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }
}

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: RunStatus,
    pub submitted: usize,
    pub written: usize,
    pub total: usize,
    /// 0.0-0.5 while frames are handed to workers, 0.5-1.0 as columns land.
    pub fraction: f64,
    pub elapsed_secs: f64,
    pub columns_per_sec: f64,
    pub error: Option<String>,
}

/// Processing state shared between the decoder, the workers and the collector
#[derive(Debug)]
pub struct ProcessingState {
    pub total_frames: usize,
    submitted: AtomicUsize,
    written: AtomicUsize,
    cancel_requested: AtomicBool,
    /// Set on cancellation or failure; workers and the decoder stop on it.
    halted: AtomicBool,
    status: RwLock<RunStatus>,
    error: RwLock<Option<String>>,
    start_time: Instant,
}

impl ProcessingState {
    pub fn new(total_frames: usize) -> Self {
        Self {
            total_frames,
            submitted: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            cancel_requested: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            status: RwLock::new(RunStatus::Running),
            error: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.status.read() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Moves a running state to a terminal status. Terminal states never change.
    pub(crate) fn finish(&self, status: RunStatus) -> bool {
        let mut guard = match self.status.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_terminal() {
            return false;
        }
        *guard = status;
        if status != RunStatus::Completed {
            self.halted.store(true, Ordering::SeqCst);
        }
        true
    }

    pub(crate) fn fail(&self, message: String) -> bool {
        if let Ok(mut error) = self.error.write() {
            if error.is_none() {
                *error = Some(message);
            }
        }
        self.finish(RunStatus::Failed)
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_written(&self) {
        self.written.fetch_add(1, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<String> {
        match self.error.read() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn progress(&self) -> Progress {
        let written = self.written();
        let submitted = self.submitted();
        let total = self.total_frames.max(1);
        let fraction = (submitted + written) as f64 / (2 * total) as f64;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let columns_per_sec = if elapsed > 0.0 {
            written as f64 / elapsed
        } else {
            0.0
        };

        Progress {
            status: self.status(),
            submitted,
            written,
            total: self.total_frames,
            fraction: fraction.min(1.0),
            elapsed_secs: elapsed,
            columns_per_sec,
            error: self.error(),
        }
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        serde_json::to_value(self.progress()).unwrap_or(serde_json::Value::Null)
    }
}
