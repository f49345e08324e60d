use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification attached to a failed fetch attempt. Recoverable kinds are
/// eligible for retry/fallback; fatal kinds fail the job immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[error("transient network error")]
    TransientNetwork,

    #[error("requested format is not available")]
    FormatUnavailable,

    #[error("merge codec missing")]
    MergeCodecMissing,

    #[error("transfer stalled")]
    StalledTransfer,

    #[error("invalid input")]
    InvalidInput,

    #[error("access denied")]
    AccessDenied,

    #[error("disk write error")]
    DiskWrite,

    #[error("retry ceiling exceeded")]
    RetryCeilingExceeded,

    #[error("internal engine fault")]
    Internal,
}

impl FailureKind {
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            FailureKind::TransientNetwork
                | FailureKind::FormatUnavailable
                | FailureKind::MergeCodecMissing
                | FailureKind::StalledTransfer
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has been shut down")]
    EngineClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch tool exited with code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(FailureKind::TransientNetwork.is_recoverable());
        assert!(FailureKind::FormatUnavailable.is_recoverable());
        assert!(FailureKind::MergeCodecMissing.is_recoverable());
        assert!(FailureKind::StalledTransfer.is_recoverable());
    }

    #[test]
    fn fatal_kinds() {
        assert!(!FailureKind::InvalidInput.is_recoverable());
        assert!(!FailureKind::AccessDenied.is_recoverable());
        assert!(!FailureKind::DiskWrite.is_recoverable());
        assert!(!FailureKind::RetryCeilingExceeded.is_recoverable());
        assert!(!FailureKind::Internal.is_recoverable());
    }
}
