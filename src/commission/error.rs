//! Engine Errors

use thiserror::Error;

/// Why a commission schedule could not be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no active commission schedule")]
    NoActiveSchedule,

    #[error("max_levels must be between 1 and {max}, got {got}")]
    MaxLevelsOutOfRange { got: u32, max: u32 },

    #[error("level_percentages has {got} entries, max_levels is {expected}")]
    PercentageCountMismatch { expected: u32, got: usize },

    #[error("level {level} percentage {value} is outside 0..=100")]
    PercentageOutOfRange { level: u32, value: String },

    #[error("min_package_amount must not be negative")]
    NegativeMinimum,

    #[error("invalid schedule document: {0}")]
    Malformed(String),

    #[error("schedule store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that fail a whole distribution call
#[derive(Error, Debug)]
pub enum DistributionError {
    /// No usable schedule. Nothing was paid.
    #[error("commission schedule unavailable: {0}")]
    ConfigMissing(String),
}

impl From<ScheduleError> for DistributionError {
    fn from(err: ScheduleError) -> Self {
        DistributionError::ConfigMissing(err.to_string())
    }
}

/// Result type for distribution operations
pub type DistributionResult<T> = Result<T, DistributionError>;
