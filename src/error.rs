use std::time::Duration;

use thiserror::Error;

/// Failure reported by a video encoder implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encoder: {0}")]
pub struct EncoderError(pub String);

impl EncoderError {
    /// Create a new encoder error.
    pub fn new(msg: impl Into<String>) -> Self {
        EncoderError(msg.into())
    }
}

/// Errors from applying encoder tuning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TuneError {
    /// The encoder rejected a speed or quality value. The lock is released.
    #[error("{0}")]
    Encoder(#[from] EncoderError),

    /// The encoder lock was not acquired within the configured timeout.
    #[error("encoder lock not acquired within {0:?}")]
    LockTimeout(Duration),
}

/// Errors from building or validating a [`Config`][crate::Config].
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("{name}: invalid value {value:?}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// The offending input.
        value: String,
    },

    /// A value is outside its allowed range.
    #[error("{name}: {value} is out of range")]
    OutOfRange {
        /// Setting name.
        name: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The delay bounds are inconsistent.
    #[error("delay bounds: min {min} start {start} max {max}")]
    DelayBounds {
        /// Minimum delay in milliseconds.
        min: f64,
        /// Start delay in milliseconds.
        start: f64,
        /// Maximum delay in milliseconds.
        max: f64,
    },
}
