// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keelson-engine.

use thiserror::Error;

use crate::store::StoreError;

/// Broad classification of an [`Error`], used by callers to decide whether a
/// retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was mutated.
    Validation,
    /// Conflicts with existing state; nothing was mutated.
    Conflict,
    /// A bounded wait ran out.
    ConvergenceTimeout,
    /// The cluster, the store or a job failed.
    External,
}

/// Engine errors.
///
/// Messages are suitable for direct display and never contain credentials.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Declared input is invalid.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A wait loop exhausted its budget.
    #[error("{operation} did not converge in time (last state: {last_state})")]
    ConvergenceTimeout {
        /// What was being waited for.
        operation: String,
        /// Last observed state.
        last_state: String,
    },

    /// External failure that is not a cluster or store error (e.g. failed job).
    #[error("{0}")]
    External(String),

    /// Cluster control API failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),

    /// Declared-state store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The owning request was aborted.
    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::NotFound(_) | Error::Config(_) => ErrorKind::Validation,
            Error::Conflict(_) | Error::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Error::Store(StoreError::NotFound(_)) => ErrorKind::Validation,
            Error::ConvergenceTimeout { .. } | Error::Cancelled(_) => ErrorKind::ConvergenceTimeout,
            Error::External(_)
            | Error::Cluster(_)
            | Error::Store(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::External,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }
}

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::Store(StoreError::Conflict("mount path /data".into())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            Error::ConvergenceTimeout {
                operation: "resize".into(),
                last_state: "pending".into(),
            }
            .kind(),
            ErrorKind::ConvergenceTimeout
        );
        assert_eq!(Error::External("job failed".into()).kind(), ErrorKind::External);
    }
}
