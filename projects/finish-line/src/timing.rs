// Column-to-wall-clock mapping for a finished raster.

use crate::error::{Result, SlitScanError};
use crate::pipeline::types::Direction;
use crate::video::ContainerMetadata;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock time read off the raster (local to the recording).
pub type Timestamp = NaiveDateTime;

/// Display format for cursor and bib times. Lexicographic order on this
/// format is chronological within one day.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S%.6f";

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"];

/// Converts raster columns to timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeMapping {
    start_time: Timestamp,
    fps: f64,
    direction: Direction,
    raster_width: usize,
}

impl TimeMapping {
    pub fn new(
        start_time: Timestamp,
        fps: f64,
        direction: Direction,
        raster_width: usize,
    ) -> Result<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(SlitScanError::InvalidFpsValue(fps));
        }
        // The whole raster window must be representable as a timestamp.
        if checked_add_seconds(start_time, raster_width as f64 / fps).is_none() {
            return Err(SlitScanError::InvalidFpsValue(fps));
        }
        Ok(Self {
            start_time,
            fps,
            direction,
            raster_width,
        })
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn raster_width(&self) -> usize {
        self.raster_width
    }

    /// Time resolution of one raster column ("1 px = N seconds").
    pub fn seconds_per_column(&self) -> f64 {
        1.0 / self.fps
    }

    /// Columns between the cursor and the start-of-recording edge.
    /// Columns past the raster edge are clamped to it.
    pub fn distance_from_origin(&self, column: usize) -> f64 {
        let column = column.min(self.raster_width);
        match self.direction {
            Direction::Forward => self.raster_width as f64 - column as f64,
            Direction::Reverse => column as f64,
        }
    }

    pub fn seconds_from_start(&self, column: usize) -> f64 {
        self.distance_from_origin(column) / self.fps
    }

    pub fn to_timestamp(&self, column: usize) -> Timestamp {
        checked_add_seconds(self.start_time, self.seconds_from_start(column))
            .unwrap_or(self.start_time)
    }

    pub fn format_column(&self, column: usize) -> String {
        format_timestamp(&self.to_timestamp(column))
    }

    /// Start and end of the time window the raster covers.
    pub fn window(&self) -> (Timestamp, Timestamp) {
        let end = checked_add_seconds(self.start_time, self.raster_width as f64 / self.fps)
            .unwrap_or(self.start_time);
        (self.start_time, end)
    }

    /// Default export name derived from the time window.
    pub fn export_filename(&self) -> String {
        let (start, end) = self.window();
        format!(
            "results_{}_{}.png",
            start.format("%H-%M-%S%.3f"),
            end.format("%H-%M-%S%.3f")
        )
    }
}

/// `t + seconds`, or `None` when the result is outside the representable range.
pub fn checked_add_seconds(t: Timestamp, seconds: f64) -> Option<Timestamp> {
    let micros = (seconds * 1e6).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    t.checked_add_signed(Duration::microseconds(micros as i64))
}

pub fn format_timestamp(t: &Timestamp) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Frame rates reported by the container and, optionally, the recording device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRates {
    pub playback_fps: f64,
    pub capture_fps: Option<f64>,
}

impl CaptureRates {
    pub fn from_metadata(metadata: &ContainerMetadata) -> Self {
        Self {
            playback_fps: metadata.playback_fps,
            capture_fps: metadata.capture_fps.filter(|f| f.is_finite() && *f > 0.0),
        }
    }

    /// Frames per real second: the device rate when known, else the nominal rate.
    pub fn effective_fps(&self) -> f64 {
        self.capture_fps.unwrap_or(self.playback_fps)
    }

    /// How much slower than real time the container plays back.
    pub fn slow_motion_factor(&self) -> f64 {
        match self.capture_fps {
            Some(capture) if self.playback_fps > 0.0 => capture / self.playback_fps,
            _ => 1.0,
        }
    }

    /// Real elapsed time covered by a clip of `container_secs` playback time.
    pub fn real_duration(&self, container_secs: f64) -> f64 {
        container_secs / self.slow_motion_factor()
    }
}

/// Parses a container `creation_time` tag. Values without a zone are UTC.
pub fn parse_creation_time(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    parse_naive_datetime(s)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| SlitScanError::InvalidTimestamp(s.to_string()))
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Parses a user-entered start time: a full date-time, or a bare time of day
/// placed on `date`.
pub fn parse_start_time(s: &str, date: NaiveDate) -> Result<Timestamp> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_local());
    }
    if let Some(naive) = parse_naive_datetime(s) {
        return Ok(naive);
    }
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
        .map(|time| date.and_time(time))
        .ok_or_else(|| SlitScanError::InvalidTimestamp(s.to_string()))
}

/// Parses a UTC offset such as `+02:00`, `-0530`, `+2` or `Z`.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let invalid = || SlitScanError::InvalidTimestamp(format!("bad UTC offset '{}'", s));
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => (1, s),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => match (rest.get(..2), rest.get(2..)) {
            (Some(h), Some(m)) => (h, m),
            _ => return Err(invalid()),
        },
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Shifts a decoder-reported UTC creation time into the recording's local
/// wall clock.
pub fn apply_capture_timezone_offset(creation: DateTime<Utc>, offset: FixedOffset) -> Timestamp {
    creation.with_timezone(&offset).naive_local()
}
