//! Typed error hierarchy for the remediation pipeline.
//!
//! Two enums cover the two levels of failure:
//! - `PipelineError` — session-level failures, including the remediation taxonomy
//! - `FixFailure` — why a single fix attempt was rolled back

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionPhase;

/// Errors surfaced by the pipeline subsystems.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fix for task {task_id} failed validation: {reason}")]
    ValidationFailed { task_id: String, reason: String },

    #[error("Fixing agent timed out after {secs}s on task {task_id}")]
    AgentTimeout { task_id: String, secs: u64 },

    #[error("Task {task_id} would remove `{symbol}` which is referenced in {}", referenced_in.display())]
    BlockedDependency {
        task_id: String,
        symbol: String,
        referenced_in: PathBuf,
    },

    #[error("Integrity violation on {}: expected {expected}, found {actual}", path.display())]
    IntegrityViolation {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Authentication failed for '{operation}'")]
    AuthenticationFailure { operation: String },

    #[error("Backup store is not writable at {}: {source}", path.display())]
    BackupStoreUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to append checkpoint at {}: {source}", path.display())]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} cannot be resumed from phase {phase}")]
    SessionNotResumable { id: String, phase: SessionPhase },

    #[error("Invalid phase transition {from} -> {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("Another pipeline instance holds the lock at {}", path.display())]
    InstanceLocked { path: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a single fix attempt did not stick. The file is always restored.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FixFailure {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("agent timed out after {secs}s")]
    AgentTimeout { secs: u64 },

    #[error("agent failed: {0}")]
    AgentFailed(String),
}

impl FixFailure {
    pub fn into_pipeline_error(self, task_id: &str) -> PipelineError {
        match self {
            FixFailure::ValidationFailed(reason) => PipelineError::ValidationFailed {
                task_id: task_id.to_string(),
                reason,
            },
            FixFailure::AgentTimeout { secs } => PipelineError::AgentTimeout {
                task_id: task_id.to_string(),
                secs,
            },
            FixFailure::AgentFailed(message) => PipelineError::ValidationFailed {
                task_id: task_id.to_string(),
                reason: format!("agent failed: {}", message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_dependency_names_symbol_and_path() {
        let err = PipelineError::BlockedDependency {
            task_id: "abc".into(),
            symbol: "parse_header".into(),
            referenced_in: PathBuf::from("src/lib.rs"),
        };
        let msg = err.to_string();
        assert!(msg.contains("parse_header"));
        assert!(msg.contains("src/lib.rs"));
    }

    #[test]
    fn authentication_failure_names_operation() {
        let err = PipelineError::AuthenticationFailure {
            operation: "restore".into(),
        };
        assert!(err.to_string().contains("restore"));
    }

    #[test]
    fn fix_failure_maps_to_taxonomy() {
        let err = FixFailure::AgentTimeout { secs: 30 }.into_pipeline_error("t1");
        match err {
            PipelineError::AgentTimeout { task_id, secs } => {
                assert_eq!(task_id, "t1");
                assert_eq!(secs, 30);
            }
            other => panic!("Expected AgentTimeout, got {other:?}"),
        }
        let err = FixFailure::AgentFailed("exit 3".into()).into_pipeline_error("t2");
        assert!(err.to_string().contains("agent failed: exit 3"));
    }

    #[test]
    fn fix_failure_serializes_tagged() {
        let json = serde_json::to_string(&FixFailure::AgentTimeout { secs: 5 }).unwrap();
        assert!(json.contains("agent_timeout"));
        let back: FixFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FixFailure::AgentTimeout { secs: 5 });
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::SessionNotFound { id: "x".into() });
        assert_std_error(&FixFailure::AgentFailed("boom".into()));
    }
}
