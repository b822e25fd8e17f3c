use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backup::BackupRecord;
use crate::errors::FixFailure;
use crate::issue::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Applied,
    Skipped,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Skipped | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Applied => "applied",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a task was skipped rather than fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The issue condition no longer held when the task was dispatched.
    AlreadyResolved,
    /// The fix would remove a symbol referenced elsewhere.
    BlockedDependency {
        symbol: String,
        referenced_in: PathBuf,
    },
    /// The target file no longer exists.
    FileMissing,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyResolved => write!(f, "already resolved"),
            SkipReason::BlockedDependency {
                symbol,
                referenced_in,
            } => write!(
                f,
                "blocked: `{}` is referenced in {}",
                symbol,
                referenced_in.display()
            ),
            SkipReason::FileMissing => write!(f, "target file missing"),
        }
    }
}

/// What one pass of the fix protocol produced for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Applied { backup: BackupRecord },
    Skipped { reason: SkipReason },
    Failed {
        failure: FixFailure,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<BackupRecord>,
    },
}

impl TaskOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TaskOutcome::Applied { .. })
    }
}

/// One issue paired with its remediation lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixTask {
    pub issue: Issue,
    pub status: TaskStatus,
    pub attempt_count: u32,
    /// Content hash of the most recent pre-fix snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl FixTask {
    pub fn new(issue: Issue) -> Self {
        let now = Utc::now();
        Self {
            issue,
            status: TaskStatus::Pending,
            attempt_count: 0,
            backup_ref: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            skip_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.issue.id
    }

    /// Dispatch ordering key: category rank, then `(file, line)`, then id.
    pub fn priority_key(&self) -> (u8, &PathBuf, u32, &str) {
        (
            self.issue.priority_rank,
            &self.issue.file,
            self.issue.line_range.start,
            &self.issue.id,
        )
    }

    /// Human-readable reason for a skipped or failed task.
    pub fn reason(&self) -> Option<String> {
        match self.status {
            TaskStatus::Skipped => self.skip_reason.as_ref().map(|r| r.to_string()),
            TaskStatus::Failed | TaskStatus::Pending => self.last_error.clone(),
            _ => None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
