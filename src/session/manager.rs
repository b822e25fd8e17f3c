use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::backup::{BackupRecord, BackupStore};
use crate::errors::PipelineError;
use crate::queue::{TaskQueue, TaskStatus};
use crate::session::checkpoint::{CheckpointEntry, CheckpointLog, CheckpointRecord};
use crate::session::report::SessionReport;
use crate::session::{Session, SessionPhase};
use crate::util::{hash_file, write_atomic};

const SESSION_FILE: &str = "session.json";
const QUEUE_FILE: &str = "queue.json";
const CHECKPOINT_FILE: &str = "checkpoint.log";
const REPORT_FILE: &str = "report.json";
pub const BACKUPS_DIR: &str = "backups";

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    cursor: u64,
    queue: TaskQueue,
}

/// Session state rebuilt from `queue.json` plus the checkpoint entries after its cursor.
pub struct RecoveredSession {
    pub session: Session,
    pub queue: TaskQueue,
    pub checkpoint: CheckpointLog,
    pub replayed: usize,
    /// Tasks dispatched with no recorded completion; restored and pending again.
    pub in_doubt: Vec<String>,
}

/// Stores sessions under `.pipeline/sessions/<id>/`.
pub struct SessionManager {
    sessions_dir: PathBuf,
}

impl SessionManager {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    pub fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CHECKPOINT_FILE)
    }

    pub fn backups_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(BACKUPS_DIR)
    }

    /// Create a fresh session directory and persist the initial record.
    pub fn create(&self, max_cycles: u32, target_issues: usize) -> Result<Session, PipelineError> {
        let simple = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &simple[..8]);
        std::fs::create_dir_all(self.session_dir(&session_id))
            .with_context(|| format!("Failed to create session directory for {}", session_id))?;

        let session = Session::new(session_id, max_cycles, target_issues);
        self.save(&session)?;
        tracing::info!(session = %session.session_id, "session created");
        Ok(session)
    }

    pub fn save(&self, session: &Session) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(session).context("Failed to serialize session")?;
        write_atomic(&self.session_dir(&session.session_id).join(SESSION_FILE), &json)?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Session, PipelineError> {
        let path = self.session_dir(session_id).join(SESSION_FILE);
        if !path.exists() {
            return Err(PipelineError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let session = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(session)
    }

    /// All sessions, oldest first. Unreadable entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Session>, PipelineError> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let entries = std::fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("Failed to list {}", self.sessions_dir.display()))?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load(&id) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(session = %id, "skipping unreadable session: {}", e),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn latest(&self) -> Result<Option<Session>, PipelineError> {
        Ok(self.list()?.pop())
    }

    /// Persist the queue and the checkpoint cursor it reflects.
    pub fn save_queue(&self, session_id: &str, queue: &TaskQueue, cursor: u64) -> Result<(), PipelineError> {
        let file = QueueFile {
            cursor,
            queue: queue.clone(),
        };
        let json = serde_json::to_vec(&file).context("Failed to serialize queue snapshot")?;
        write_atomic(&self.session_dir(session_id).join(QUEUE_FILE), &json)?;
        Ok(())
    }

    /// Load the queue snapshot and its cursor, if one has been written.
    pub fn load_queue(&self, session_id: &str) -> Result<Option<(TaskQueue, u64)>, PipelineError> {
        let path = self.session_dir(session_id).join(QUEUE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let file: QueueFile = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some((file.queue, file.cursor)))
    }

    pub fn save_report(&self, report: &SessionReport) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(report).context("Failed to serialize report")?;
        write_atomic(&self.session_dir(&report.session_id).join(REPORT_FILE), &json)?;
        Ok(())
    }

    pub fn load_report(&self, session_id: &str) -> Result<Option<SessionReport>, PipelineError> {
        let path = self.session_dir(session_id).join(REPORT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&content).context("Failed to parse report")?))
    }

    /// Rebuild an unfinished session for resume.
    ///
    /// Every checkpoint entry after the snapshot cursor is folded into the
    /// queue. A task whose `Dispatched` entry has no later `Completed` had its
    /// fix interrupted: its file is restored from the recorded backup and the
    /// task returns to pending with its attempt count unchanged.
    pub fn recover(
        &self,
        session_id: &str,
        backups: &BackupStore,
        max_attempts: u32,
    ) -> Result<RecoveredSession, PipelineError> {
        let mut session = self.load(session_id)?;
        if session.phase == SessionPhase::Done {
            return Err(PipelineError::SessionNotResumable {
                id: session.session_id,
                phase: session.phase,
            });
        }

        let (checkpoint, entries) = CheckpointLog::open(self.checkpoint_path(session_id))?;
        let (mut queue, cursor) = self
            .load_queue(session_id)?
            .unwrap_or_else(|| (TaskQueue::new(max_attempts), 0));

        let (replayed, open) = replay(&entries, cursor, &mut queue, backups)?;

        let mut in_doubt: Vec<String> = Vec::new();
        for (task_id, backup) in open {
            if let Some(backup) = backup {
                let current = hash_file(&backup.original_path).ok();
                if current.as_deref() != Some(backup.content_hash.as_str()) {
                    backups.restore(&backup)?;
                    session.metrics.restores += 1;
                }
            }
            reset_to_pending(&mut queue, &task_id)?;
            in_doubt.push(task_id);
        }
        // A snapshot taken mid-batch may hold in-progress tasks with no dispatch record.
        for task_id in queue.in_progress_ids() {
            reset_to_pending(&mut queue, &task_id)?;
            in_doubt.push(task_id);
        }

        if !in_doubt.is_empty() {
            tracing::warn!(session = %session_id, tasks = ?in_doubt, "recovered in-doubt tasks");
        }

        session.counts = queue.counts();
        tracing::info!(session = %session_id, replayed, cursor, "session recovered");
        Ok(RecoveredSession {
            session,
            queue,
            checkpoint,
            replayed,
            in_doubt,
        })
    }
}

fn reset_to_pending(queue: &mut TaskQueue, task_id: &str) -> Result<(), PipelineError> {
    let (attempts, last_error) = match queue.get(task_id) {
        Some(task) => (task.attempt_count, task.last_error.clone()),
        None => {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "Checkpoint references unknown task {}",
                task_id
            )));
        }
    };
    queue.restore_state(task_id, TaskStatus::Pending, attempts, last_error, None)?;
    Ok(())
}

type OpenDispatches = BTreeMap<String, Option<BackupRecord>>;

/// Fold entries with `seq > cursor` into `queue`. Returns the number applied
/// and the dispatches left without a completion.
fn replay(
    entries: &[CheckpointEntry],
    cursor: u64,
    queue: &mut TaskQueue,
    backups: &BackupStore,
) -> Result<(usize, OpenDispatches), PipelineError> {
    let mut open = OpenDispatches::new();
    let mut applied = 0;

    for entry in entries.iter().filter(|e| e.seq > cursor) {
        match &entry.record {
            CheckpointRecord::Dispatched {
                task_id, backup, ..
            } => {
                if let Some(record) = backup {
                    backups.register(record.clone())?;
                }
                open.insert(task_id.clone(), backup.clone());
            }
            CheckpointRecord::Completed {
                task_id,
                status,
                attempt_count,
                reason,
                skip_reason,
            } => {
                open.remove(task_id);
                queue.restore_state(
                    task_id,
                    *status,
                    *attempt_count,
                    reason.clone(),
                    skip_reason.clone(),
                )?;
            }
            CheckpointRecord::PhaseChanged { .. } | CheckpointRecord::QueueSnapshot { .. } => {}
        }
        applied += 1;
    }
    Ok((applied, open))
}
