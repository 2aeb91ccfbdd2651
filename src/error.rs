//! Unified error handling for the place-matcher library.
//!
//! Errors fall into two groups. Input problems (invalid coordinates,
//! out-of-order samples) drop the offending sample and leave the engine
//! usable. Invariant violations during consolidation are fatal and halt
//! the engine until it is rebuilt.

use thiserror::Error;

/// Unified error type for place-matcher operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaceError {
    /// Sample has non-finite or out-of-range coordinates
    #[error("Sample at t={timestamp} has invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates {
        timestamp: i64,
        latitude: f64,
        longitude: f64,
    },
    /// Sample is older than the last accepted one
    #[error("Sample at t={timestamp} is older than the last sample at t={last_timestamp}")]
    OutOfOrderSample { timestamp: i64, last_timestamp: i64 },
    /// Sample is too far from the engine clocks to measure elapsed time
    #[error("Sample at t={timestamp} is out of range of the clock at t={reference}")]
    TimestampOutOfRange { timestamp: i64, reference: i64 },
    /// A pending sample carried no duration when folded into its cluster
    #[error("Pending sample {index} has zero duration")]
    ZeroDurationSample { index: usize },
    /// Pending sample durations do not fit in a u64
    #[error("Pending samples ({count}) overflow the duration counter")]
    PendingDurationOverflow { count: usize },
    /// Engine stopped after a fatal consolidation error
    #[error("Engine halted after fatal error: {reason}")]
    EngineHalted { reason: String },
    /// Persisted row could not be decoded
    #[error("Malformed place row: column '{column}' {message}")]
    MalformedRow { column: String, message: String },
    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

impl PlaceError {
    /// Whether this error means the engine can no longer make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlaceError::ZeroDurationSample { .. }
                | PlaceError::PendingDurationOverflow { .. }
                | PlaceError::EngineHalted { .. }
        )
    }

    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        PlaceError::Persistence {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for PlaceError {
    fn from(err: rusqlite::Error) -> Self {
        PlaceError::persistence(err.to_string())
    }
}

/// Result type alias for place-matcher operations.
pub type Result<T> = std::result::Result<T, PlaceError>;

/// Extension trait for converting Option to PlaceError.
pub trait OptionExt<T> {
    /// Convert a missing row column into a malformed row error.
    fn ok_or_missing_column(self, column: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing_column(self, column: &str) -> Result<T> {
        self.ok_or_else(|| PlaceError::MalformedRow {
            column: column.to_string(),
            message: "is missing".to_string(),
        })
    }
}
