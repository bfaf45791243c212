//! Typed error hierarchy for the shipwright orchestrator.
//!
//! Four enums cover the layers of the engine:
//! - `PathError`: sandbox boundary failures from the path validator
//! - `GatewayError`: rejected or failed tool dispatches
//! - `TransitionError`: illegal moves of the phase state machine
//! - `OrchestratorError`: run-level failures surfaced to the CLI
//!
//! Every error maps onto the flat, serializable [`ErrorKind`] that blocked
//! reports carry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::gateway::Capability;
use crate::phase::{Phase, RunStage};

/// Flat error taxonomy recorded in outcome records and blocked reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OutOfBoundary,
    DuplicateRootSegment,
    CapabilityNotPermitted,
    WrongToolRole,
    ExhaustedRetries,
    ArchitectureViolation,
    ForbiddenInFixMode,
    MissingCommitMessage,
    PrematureRemoteWrite,
    /// An external tool failed outside of any retry loop (e.g. while snapshotting).
    ToolFailure,
    /// The agent could not produce a plan for the phase.
    PlanningFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::OutOfBoundary => "OutOfBoundary",
            ErrorKind::DuplicateRootSegment => "DuplicateRootSegment",
            ErrorKind::CapabilityNotPermitted => "CapabilityNotPermitted",
            ErrorKind::WrongToolRole => "WrongToolRole",
            ErrorKind::ExhaustedRetries => "ExhaustedRetries",
            ErrorKind::ArchitectureViolation => "ArchitectureViolation",
            ErrorKind::ForbiddenInFixMode => "ForbiddenInFixMode",
            ErrorKind::MissingCommitMessage => "MissingCommitMessage",
            ErrorKind::PrematureRemoteWrite => "PrematureRemoteWrite",
            ErrorKind::ToolFailure => "ToolFailure",
            ErrorKind::PlanningFailed => "PlanningFailed",
        };
        f.write_str(name)
    }
}

/// Errors from the path boundary validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path {path} resolves outside the sandbox root {root}")]
    OutOfBoundary { path: PathBuf, root: PathBuf },

    #[error("path {path} nests the root segment '{segment}' inside itself")]
    DuplicateRootSegment { path: PathBuf, segment: String },

    #[error("sandbox root must be an absolute path, got {root}")]
    RelativeRoot { root: PathBuf },
}

impl PathError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PathError::OutOfBoundary { .. } | PathError::RelativeRoot { .. } => {
                ErrorKind::OutOfBoundary
            }
            PathError::DuplicateRootSegment { .. } => ErrorKind::DuplicateRootSegment,
        }
    }
}

/// Errors from a single dispatch through the tool capability gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("phase {phase} does not permit the {capability} capability")]
    CapabilityNotPermitted { phase: Phase, capability: Capability },

    #[error("request declares the {declared} capability but its action belongs to the {actual} tool")]
    WrongToolRole {
        declared: Capability,
        actual: Capability,
    },

    #[error("forbidden in fix mode: {reason}")]
    ForbiddenInFixMode { reason: String },

    #[error("push to {repo} requires a non-empty commit message")]
    MissingCommitMessage { repo: String },

    #[error("remote write to {repo} before the repository was confirmed to exist")]
    PrematureRemoteWrite { repo: String },

    #[error("{capability} tool failed: {message}")]
    Tool {
        capability: Capability,
        message: String,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Path(e) => e.kind(),
            GatewayError::CapabilityNotPermitted { .. } => ErrorKind::CapabilityNotPermitted,
            GatewayError::WrongToolRole { .. } => ErrorKind::WrongToolRole,
            GatewayError::ForbiddenInFixMode { .. } => ErrorKind::ForbiddenInFixMode,
            GatewayError::MissingCommitMessage { .. } => ErrorKind::MissingCommitMessage,
            GatewayError::PrematureRemoteWrite { .. } => ErrorKind::PrematureRemoteWrite,
            GatewayError::Tool { .. } => ErrorKind::ToolFailure,
        }
    }

    /// Only failures reported by the external tool itself enter the retry loop.
    /// Everything else is a logic defect in the calling phase.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Tool { .. })
    }
}

/// Errors from the phase state machine's transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal { from: RunStage, to: RunStage },

    #[error("fix mode requires an attached QA artifact")]
    MissingQaArtifact,

    #[error("run is blocked; external intervention required")]
    RunBlocked,
}

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("forbidden in fix mode: {reason}")]
    ForbiddenInFixMode { reason: String },

    #[error("Failed to persist run state at {path}: {source}")]
    StatePersist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to append outcome record: {0}")]
    Audit(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestratorError::ForbiddenInFixMode { .. } => Some(ErrorKind::ForbiddenInFixMode),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_error_kinds_match_taxonomy() {
        let out = PathError::OutOfBoundary {
            path: PathBuf::from("/work/other/x"),
            root: PathBuf::from("/work/proj"),
        };
        let dup = PathError::DuplicateRootSegment {
            path: PathBuf::from("/work/proj/proj"),
            segment: "proj".to_string(),
        };
        assert_eq!(out.kind(), ErrorKind::OutOfBoundary);
        assert_eq!(dup.kind(), ErrorKind::DuplicateRootSegment);
        assert!(out.to_string().contains("/work/other/x"));
    }

    #[test]
    fn gateway_error_converts_from_path_error() {
        let err: GatewayError = PathError::DuplicateRootSegment {
            path: PathBuf::from("/a/b/b"),
            segment: "b".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::DuplicateRootSegment);
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_tool_failures_are_retryable() {
        let tool = GatewayError::Tool {
            capability: Capability::Execution,
            message: "exit 1".into(),
        };
        let role = GatewayError::WrongToolRole {
            declared: Capability::Execution,
            actual: Capability::Filesystem,
        };
        let capability = GatewayError::CapabilityNotPermitted {
            phase: Phase::Publish,
            capability: Capability::Execution,
        };
        assert!(tool.is_retryable());
        assert!(!role.is_retryable());
        assert!(!capability.is_retryable());
        assert_eq!(capability.kind(), ErrorKind::CapabilityNotPermitted);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ExhaustedRetries).unwrap();
        assert_eq!(json, "\"exhausted_retries\"");
        assert_eq!(ErrorKind::ExhaustedRetries.to_string(), "ExhaustedRetries");
    }

    #[test]
    fn transition_error_display_names_stages() {
        let err = TransitionError::Illegal {
            from: RunStage::Done,
            to: RunStage::Active(Phase::Scaffold),
        };
        let msg = err.to_string();
        assert!(msg.contains("done"));
        assert!(msg.contains("scaffold"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TransitionError::RunBlocked);
        assert_std_error(&GatewayError::MissingCommitMessage { repo: "a/b".into() });
        assert_std_error(&OrchestratorError::ForbiddenInFixMode {
            reason: "scaffold".into(),
        });
    }
}
