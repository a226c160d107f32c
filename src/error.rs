//! Configuration errors.
//!
//! Bad configuration values fail eagerly, at construction time, with a
//! message naming the offending value. Numerical failures (NaN losses,
//! exploding gradients) and resource failures (missing device, OOM) are not
//! intercepted anywhere; they propagate as the underlying candle error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),

    #[error("unknown optimizer {0:?}")]
    UnknownOptimizer(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
