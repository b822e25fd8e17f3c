//! Durable session state.
//!
//! A session is the record of one pipeline run: `session.json` holds the
//! summary below, `checkpoint.log` the write-ahead log, `queue.json` the last
//! queue snapshot and `report.json` the final report.

pub mod checkpoint;
pub mod manager;
pub mod report;

pub use checkpoint::{CheckpointEntry, CheckpointLog, CheckpointRecord};
pub use manager::{RecoveredSession, SessionManager};
pub use report::SessionReport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::queue::TaskCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Scan,
    Fix,
    Validate,
    Publish,
    Done,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Allowed phase edges. `Aborted` is reachable from every live phase.
    pub fn can_transition_to(&self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, to) {
            (from, Aborted) => !from.is_terminal(),
            (Scan, Fix) => true,
            (Fix, Validate) => true,
            (Validate, Fix | Publish | Done) => true,
            (Publish, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Scan => "scan",
            SessionPhase::Fix => "fix",
            SessionPhase::Validate => "validate",
            SessionPhase::Publish => "publish",
            SessionPhase::Done => "done",
            SessionPhase::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Fix protocol passes started, including retries.
    pub dispatched: u64,
    /// Files rolled back after a failed attempt or an in-doubt recovery.
    pub restores: u64,
    pub agent_timeouts: u64,
    /// Wall-clock seconds spent running, summed across resumes.
    pub active_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: SessionPhase,
    pub cycle: u32,
    pub counts: TaskCounts,
    /// Sequence number of the last checkpoint entry folded into `queue.json`.
    pub checkpoint_cursor: u64,
    pub metrics: SessionMetrics,
    pub max_cycles: u32,
    pub target_issues: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_issues: Option<usize>,
    /// Cleared by any integrity violation observed during the run.
    pub trusted: bool,
    pub publish_gate_satisfied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, max_cycles: u32, target_issues: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            phase: SessionPhase::Scan,
            cycle: 0,
            counts: TaskCounts::default(),
            checkpoint_cursor: 0,
            metrics: SessionMetrics::default(),
            max_cycles,
            target_issues,
            remaining_issues: None,
            trusted: true,
            publish_gate_satisfied: false,
            abort_reason: None,
        }
    }

    pub fn transition(&mut self, to: SessionPhase) -> Result<(), PipelineError> {
        if !self.phase.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::info!(session = %self.session_id, from = %self.phase, to = %to, cycle = self.cycle, "phase change");
        self.phase = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.metrics.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Put an interrupted session back at `Scan` for a resumed run.
    pub fn reopen(&mut self) -> Result<(), PipelineError> {
        if self.phase == SessionPhase::Done {
            return Err(PipelineError::SessionNotResumable {
                id: self.session_id.clone(),
                phase: self.phase,
            });
        }
        tracing::info!(session = %self.session_id, from = %self.phase, "reopening session");
        self.phase = SessionPhase::Scan;
        self.abort_reason = None;
        self.metrics.finished_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn target_met(&self) -> bool {
        self.remaining_issues
            .is_some_and(|remaining| remaining <= self.target_issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new("s1", 3, 0);
        for phase in [
            SessionPhase::Fix,
            SessionPhase::Validate,
            SessionPhase::Fix,
            SessionPhase::Validate,
            SessionPhase::Publish,
            SessionPhase::Done,
        ] {
            session.transition(phase).unwrap();
        }
        assert!(session.metrics.finished_at.is_some());
    }

    #[test]
    fn test_publish_only_after_validate() {
        let mut session = Session::new("s1", 3, 0);
        let err = session.transition(SessionPhase::Publish).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: SessionPhase::Scan,
                to: SessionPhase::Publish
            }
        ));
    }

    #[test]
    fn test_any_live_phase_can_abort() {
        for start in [SessionPhase::Scan, SessionPhase::Fix, SessionPhase::Validate, SessionPhase::Publish] {
            assert!(start.can_transition_to(SessionPhase::Aborted));
        }
        assert!(!SessionPhase::Done.can_transition_to(SessionPhase::Aborted));
        assert!(!SessionPhase::Aborted.can_transition_to(SessionPhase::Fix));
    }

    #[test]
    fn test_reopen_rejects_done() {
        let mut session = Session::new("s1", 3, 0);
        session.transition(SessionPhase::Aborted).unwrap();
        session.reopen().unwrap();
        assert_eq!(session.phase, SessionPhase::Scan);

        session.phase = SessionPhase::Done;
        assert!(matches!(
            session.reopen(),
            Err(PipelineError::SessionNotResumable { .. })
        ));
    }

    #[test]
    fn test_target_met_requires_a_count() {
        let mut session = Session::new("s1", 3, 2);
        assert!(!session.target_met());
        session.remaining_issues = Some(3);
        assert!(!session.target_met());
        session.remaining_issues = Some(2);
        assert!(session.target_met());
    }
}
