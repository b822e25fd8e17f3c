//! Single-task fix protocol.
//!
//! For each task, under the file's lock:
//! 1. the pre-check re-counts matching issues (0 means already resolved)
//! 2. snapshot the file, then checkpoint the dispatch
//! 3. run the agent under a timeout
//! 4. validate content at the requested level, then re-check the issue
//! 5. on any failure restore the snapshot byte-for-byte
//!
//! `Err` is reserved for failures that must stop the session: an unwritable
//! backup store or checkpoint log, or a restore that does not verify.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::FixAgent;
use crate::analyzer::{Analyzer, count_matching};
use crate::backup::BackupStore;
use crate::errors::{FixFailure, PipelineError};
use crate::fix::locks::FileLocks;
use crate::fix::validation::{ValidationLevel, validate_content};
use crate::fix::FixInstruction;
use crate::pipeline_config::{AgentSection, ValidationSection};
use crate::queue::{FixTask, SkipReason, TaskOutcome};
use crate::session::{CheckpointLog, CheckpointRecord};

/// Slack on top of the agent deadline before the protocol abandons the call.
/// Command agents enforce the deadline themselves and reap their processes.
const AGENT_DEADLINE_GRACE: Duration = Duration::from_secs(2);

pub struct FixProtocol {
    project_dir: PathBuf,
    analyzer: Arc<dyn Analyzer>,
    agent: Arc<dyn FixAgent>,
    backups: Arc<BackupStore>,
    checkpoint: Arc<CheckpointLog>,
    locks: FileLocks,
    agent_settings: AgentSection,
    thresholds: ValidationSection,
}

impl FixProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_dir: PathBuf,
        analyzer: Arc<dyn Analyzer>,
        agent: Arc<dyn FixAgent>,
        backups: Arc<BackupStore>,
        checkpoint: Arc<CheckpointLog>,
        locks: FileLocks,
        agent_settings: AgentSection,
        thresholds: ValidationSection,
    ) -> Self {
        Self {
            project_dir,
            analyzer,
            agent,
            backups,
            checkpoint,
            locks,
            agent_settings,
            thresholds,
        }
    }

    pub async fn apply(&self, task: &FixTask, level: ValidationLevel) -> Result<TaskOutcome, PipelineError> {
        let issue = &task.issue;
        let target = self.project_dir.join(&issue.file);
        let attempt = task.attempt_count + 1;

        let guard = self.locks.acquire(&target).await;

        if !target.exists() {
            tracing::info!(task = %issue.id, file = %issue.file.display(), "target file missing");
            return Ok(TaskOutcome::Skipped {
                reason: SkipReason::FileMissing,
            });
        }

        let before_count = match count_matching(self.analyzer.as_ref(), issue).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(task = %issue.id, "pre-check failed: {:#}", e);
                return Ok(TaskOutcome::Failed {
                    failure: FixFailure::ValidationFailed(format!("pre-check failed: {:#}", e)),
                    backup: None,
                });
            }
        };
        if before_count == 0 {
            tracing::info!(task = %issue.id, "issue already resolved, skipping");
            return Ok(TaskOutcome::Skipped {
                reason: SkipReason::AlreadyResolved,
            });
        }

        let before = std::fs::read(&target).map_err(|e| {
            PipelineError::Other(anyhow::anyhow!("Failed to read {}: {}", target.display(), e))
        })?;
        let backup = self.backups.snapshot(&target)?;
        self.checkpoint.append(CheckpointRecord::Dispatched {
            task_id: issue.id.clone(),
            attempt,
            backup: Some(backup.clone()),
        })?;

        tracing::info!(
            task = %issue.id,
            category = %issue.category,
            file = %issue.file.display(),
            attempt,
            level = %level,
            "dispatching fix"
        );

        let instruction = FixInstruction::for_task(task);
        let timeout = self.agent_settings.timeout();
        let agent_result =
            tokio::time::timeout(timeout + AGENT_DEADLINE_GRACE, self.agent.apply(&instruction)).await;

        let failure = match agent_result {
            Err(_) => Some(FixFailure::AgentTimeout {
                secs: timeout.as_secs(),
            }),
            Ok(Err(e)) => Some(match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::AgentTimeout { secs, .. }) => FixFailure::AgentTimeout { secs: *secs },
                _ => FixFailure::AgentFailed(format!("{:#}", e)),
            }),
            Ok(Ok(())) => self
                .validate(task, &before, before_count, level)
                .await
                .err()
                .map(FixFailure::ValidationFailed),
        };

        let Some(failure) = failure else {
            tracing::info!(task = %issue.id, "fix applied");
            return Ok(TaskOutcome::Applied { backup });
        };

        tracing::warn!(task = %issue.id, attempt, "fix rolled back: {}", failure);
        self.backups.restore(&backup)?;
        drop(guard);

        if matches!(failure, FixFailure::AgentTimeout { .. }) {
            let delay = self.agent_settings.backoff_for_attempt(attempt);
            tracing::debug!(task = %issue.id, delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
        }

        Ok(TaskOutcome::Failed {
            failure,
            backup: Some(backup),
        })
    }

    async fn validate(
        &self,
        task: &FixTask,
        before: &[u8],
        before_count: usize,
        level: ValidationLevel,
    ) -> Result<(), String> {
        let issue = &task.issue;
        let target = self.project_dir.join(&issue.file);
        let after = std::fs::read(&target)
            .map_err(|e| format!("target file unreadable after fix: {}", e))?;

        validate_content(
            &String::from_utf8_lossy(before),
            &String::from_utf8_lossy(&after),
            issue.category,
            level,
            &self.thresholds,
        )?;

        let after_count = count_matching(self.analyzer.as_ref(), issue)
            .await
            .map_err(|e| format!("re-check failed: {:#}", e))?;
        if after_count >= before_count {
            return Err("issue still present after fix".to_string());
        }
        Ok(())
    }
}
