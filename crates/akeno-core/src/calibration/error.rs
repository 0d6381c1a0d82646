//! Calibration errors

use thiserror::Error;

/// Errors raised while constructing, decoding or validating calibration data.
///
/// Lookups never produce these; a table that exists has already passed
/// validation.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("axis {axis} has no breakpoints")]
    EmptyAxis { axis: usize },

    #[error("axis {axis} is not strictly increasing at index {index}")]
    AxisNotIncreasing { axis: usize, index: usize },

    #[error("value grid has {actual} entries, axes require {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("expected a rank {expected} table, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("missing table '{0}'")]
    MissingTable(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("table '{name}': {source}")]
    InvalidTable {
        name: String,
        #[source]
        source: Box<CalibrationError>,
    },

    #[error("table '{name}' must be indexed by {state} states 0..={max}")]
    StateAxis {
        name: String,
        state: &'static str,
        max: usize,
    },

    #[error("scalar '{0}' must be non-zero")]
    ZeroScalar(&'static str),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("calibration data truncated")]
    Truncated,

    #[error("not a calibration image")]
    BadMagic,

    #[error("unsupported calibration image version {0}")]
    UnsupportedVersion(u8),

    #[error("table name is not valid UTF-8")]
    InvalidName,

    #[error("{what} of {len} does not fit the image format (max {max})")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalibrationError {
    /// Attach the table name to an error raised while building that table.
    pub(crate) fn in_table(self, name: &str) -> Self {
        CalibrationError::InvalidTable {
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}
