//! Crate-level error taxonomy for control operations.
//!
//! Step-level failures (no executor, unavailable input, exhausted retries,
//! lease redrives) are not errors at this layer: they are terminal step
//! outcomes written to the run store. Transient store/log failures stay in
//! the `Store`/`Log` variants and are retried by the loops that hit them;
//! they never decide a run's fate.

use thiserror::Error;

use crate::log::LogError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Spec or run missing; surfaced to the API caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cyclic DAG or unknown dependency; rejected at submit.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Run or spec id collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Cancel or complete on a terminal run.
    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Error::NotFound(what),
            StoreError::AlreadyExists(what) => Error::AlreadyExists(what),
            other => Error::Store(other),
        }
    }
}

impl Error {
    /// Whether retrying the same call later could succeed. Drives the
    /// ack-or-nak decision in the consumer loops.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Log(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Step error strings written into step rows and task results. Prefix-stable
// so operators and tests can match on them.
pub const STEP_ERROR_NO_EXECUTOR: &str = "no_executor";
pub const STEP_ERROR_INPUT_UNAVAILABLE: &str = "input_unavailable";
pub const STEP_ERROR_EXECUTOR: &str = "executor_error";
pub const STEP_ERROR_LEASE_EXPIRED: &str = "lease_expired_exceeded";
pub const STEP_ERROR_DEADLINE: &str = "deadline_exceeded";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: Error = StoreError::NotFound("run x".to_string()).into();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn sqlx_errors_stay_transient() {
        let err: Error = StoreError::Sqlx(sqlx::Error::PoolClosed).into();
        assert!(matches!(err, Error::Store(_)));
        assert!(err.is_transient());
    }
}
