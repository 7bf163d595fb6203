//! # Engine Error Kinds
//!
//! Most failures in StrataDB propagate as `eyre::Result` with contextual
//! messages, matching the rest of the storage layer. A small set of failures
//! is part of the engine's *contract* and must be matchable by callers:
//!
//! - `ConcurrentModification`: a page version changed between read and
//!   commit. The caller is expected to roll back and retry the whole
//!   transaction.
//! - `DuplicateKey`: a unique-index constraint was violated, either at
//!   immediate put time or during the deferred commit-time check. The
//!   transaction is rolled back; the error is not retried automatically.
//! - `LockTimeout`: a file lock could not be acquired within the configured
//!   window. Retryable by the caller.
//! - `Corruption`: an internal page invariant was violated (for example a
//!   pointer-array offset below the header boundary). Fatal for the affected
//!   operation.
//!
//! These travel as a typed [`EngineError`] inside the `eyre::Report`, so the
//! expected-and-retried cases are plain values recovered with
//! `Report::downcast_ref` rather than string matching.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("concurrent modification on page {file_id}:{page_no}")]
    ConcurrentModification { file_id: u32, page_no: u32 },

    #[error("duplicate key in unique index '{index}'")]
    DuplicateKey { index: String },

    #[error("timed out waiting for lock on file {file_id} after {waited_ms}ms")]
    LockTimeout { file_id: u32, waited_ms: u64 },

    #[error("index corruption: {0}")]
    Corruption(String),
}

impl EngineError {
    /// True for failures a caller may resolve by retrying the whole
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrentModification { .. } | EngineError::LockTimeout { .. }
        )
    }
}

/// The typed kind of a report, if it carries one.
pub fn error_kind(report: &eyre::Report) -> Option<&EngineError> {
    report.downcast_ref::<EngineError>()
}

pub fn is_concurrent_modification(report: &eyre::Report) -> bool {
    matches!(
        error_kind(report),
        Some(EngineError::ConcurrentModification { .. })
    )
}

pub fn is_duplicate_key(report: &eyre::Report) -> bool {
    matches!(error_kind(report), Some(EngineError::DuplicateKey { .. }))
}

pub fn is_lock_timeout(report: &eyre::Report) -> bool {
    matches!(error_kind(report), Some(EngineError::LockTimeout { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_wrapping() {
        let report = eyre::Report::new(EngineError::ConcurrentModification {
            file_id: 3,
            page_no: 7,
        })
        .wrap_err("commit failed");

        assert!(is_concurrent_modification(&report));
        assert!(!is_duplicate_key(&report));
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::ConcurrentModification {
            file_id: 0,
            page_no: 0
        }
        .is_retryable());
        assert!(EngineError::LockTimeout {
            file_id: 0,
            waited_ms: 10
        }
        .is_retryable());
        assert!(!EngineError::DuplicateKey {
            index: "users".into()
        }
        .is_retryable());
        assert!(!EngineError::Corruption("bad pointer".into()).is_retryable());
    }

    #[test]
    fn plain_eyre_report_has_no_kind() {
        let report = eyre::eyre!("some other failure");
        assert!(error_kind(&report).is_none());
    }
}
