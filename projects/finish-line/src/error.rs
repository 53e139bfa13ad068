use std::path::PathBuf;

/// Errors produced by the reconstruction core.
///
/// Cancellation is not represented here: a cancelled run ends in
/// [`crate::pipeline::types::RunStatus::Cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum SlitScanError {
    #[error("Line position {position} is outside the frame (width {width})")]
    InvalidLinePosition { position: u32, width: u32 },

    #[error("Invalid fps value: {0} (must be positive)")]
    InvalidFpsValue(f64),

    #[error("Frame geometry mismatch: {0}")]
    InvalidFrameGeometry(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Column {0} was already written")]
    ColumnAlreadyWritten(usize),

    #[error("Ledger sink unavailable at {path:?}: {source}")]
    SinkUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A reconstruction run is already in progress")]
    AlreadyRunning,

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, SlitScanError>;
