use std::time::Duration;

use project_store::StoreError;
use sandbox::SandboxError;

use crate::lifecycle::Phase;

#[derive(Debug, thiserror::Error)]
pub enum WorkbenchError {
    #[error("environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    #[error("sandbox boot timed out after {0:?}")]
    BootTimeout(Duration),

    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    #[error("sandbox boot cancelled by teardown")]
    BootCancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("output stream aborted: {0}")]
    StreamAborted(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("path conflict: {0:?} is a {1}")]
    PathConflict(String, &'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file manager is not initialized")]
    NotInitialized,

    #[error("invalid project name: {0:?}")]
    InvalidProjectName(String),

    #[error("install exited with code {exit_code}")]
    InstallFailed { exit_code: i32, tail: String },

    #[error("dev server failed to start: {reason}")]
    ServeFailed { reason: String, excerpt: String },

    #[error("persistence failed: {0}")]
    PersistenceFailed(#[source] StoreError),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("{phase} failed: {source}")]
    Lifecycle {
        phase: Phase,
        #[source]
        source: Box<WorkbenchError>,
    },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkbenchError>;

impl WorkbenchError {
    /// Whether re-invoking the failed operation (or re-running the session
    /// from mounting) can succeed without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BootTimeout(_)
            | Self::BootFailed(_)
            | Self::BootCancelled
            | Self::Timeout(_)
            | Self::StreamAborted(_)
            | Self::InstallFailed { .. }
            | Self::ServeFailed { .. }
            | Self::PersistenceFailed(_) => true,
            Self::EnvironmentUnsupported(_)
            | Self::InvalidPath(_)
            | Self::PathConflict(..)
            | Self::NotFound(_)
            | Self::NotInitialized
            | Self::InvalidProjectName(_)
            | Self::InvalidTransition { .. }
            | Self::Config(_) => false,
            Self::Lifecycle { source, .. } => source.is_retryable(),
            Self::Sandbox(e) => !matches!(e, SandboxError::EnvironmentUnsupported(_)),
        }
    }

    /// Captured process output attached to install and serve failures.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::InstallFailed { tail, .. } => Some(tail),
            Self::ServeFailed { excerpt, .. } => Some(excerpt),
            Self::Lifecycle { source, .. } => source.diagnostic(),
            _ => None,
        }
    }

    pub(crate) fn in_phase(self, phase: Phase) -> Self {
        match self {
            e @ Self::Lifecycle { .. } => e,
            e => Self::Lifecycle {
                phase,
                source: Box::new(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        assert!(!WorkbenchError::EnvironmentUnsupported("no node".into()).is_retryable());
        assert!(WorkbenchError::BootTimeout(Duration::from_secs(30)).is_retryable());
        assert!(WorkbenchError::StreamAborted("pipe".into()).is_retryable());
        assert!(!WorkbenchError::PathConflict("a.txt".into(), "file").is_retryable());
        assert!(!WorkbenchError::NotFound("x".into()).is_retryable());
        assert!(
            WorkbenchError::InstallFailed {
                exit_code: 1,
                tail: String::new()
            }
            .is_retryable()
        );
        assert!(
            !WorkbenchError::Sandbox(SandboxError::EnvironmentUnsupported("x".into()))
                .is_retryable()
        );
    }

    #[test]
    fn lifecycle_wrapper_delegates() {
        let err = WorkbenchError::ServeFailed {
            reason: "EADDRINUSE".into(),
            excerpt: "Error: listen EADDRINUSE :::3000".into(),
        }
        .in_phase(Phase::Serving);

        assert!(err.is_retryable());
        assert_eq!(err.diagnostic(), Some("Error: listen EADDRINUSE :::3000"));
        assert_eq!(
            err.to_string(),
            "serving failed: dev server failed to start: EADDRINUSE"
        );

        // Wrapping twice keeps the innermost phase.
        let again = err.in_phase(Phase::Installing);
        assert!(matches!(
            again,
            WorkbenchError::Lifecycle {
                phase: Phase::Serving,
                ..
            }
        ));
    }
}
