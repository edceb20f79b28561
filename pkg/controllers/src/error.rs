use std::time::Duration;
use thiserror::Error;

use crate::schedule::ScheduleParseError;

/// Classified failure of a scaling operation.
///
/// The class decides what happens next: retryable errors are picked up again by
/// the next tick or queue redelivery, everything else is logged and dropped.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error(transparent)]
    ScheduleParse(#[from] ScheduleParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("invalid resource key '{0}'")]
    InvalidKey(String),

    #[error("invalid object: {0}")]
    Structural(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl ScalingError {
    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScalingError::Transient(_) | ScalingError::Timeout { .. }
        )
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, ScalingError::NotImplemented(_))
    }
}
