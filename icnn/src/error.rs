//! Error type shared by every engine operation.

use crate::tensor::TensorError;

/// Everything that can stop the engine.
///
/// Only [`EngineError::PowerFailure`] is expected during normal operation: it is raised by the
/// fault injecting medium and handled by rebooting. Every other variant is fatal.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("power failure after {0} durable bytes written")]
    PowerFailure(u64),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("NVM is not provisioned: {0}")]
    Unprovisioned(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model description: {0}")]
    Description(String),
    #[error("malformed JSON model description: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl EngineError {
    pub fn is_power_failure(&self) -> bool {
        matches!(self, EngineError::PowerFailure(_))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Returns an [`EngineError::Invariant`] from the enclosing function unless `$cond` holds.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::EngineError::Invariant(format!($($arg)+)));
        }
    };
}

/// Builds an [`EngineError::Invariant`], for use with `ok_or_else` and friends.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::EngineError::Invariant(format!($($arg)+))
    };
}
