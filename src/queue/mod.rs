//! Task queue and prioritizer.
//!
//! Tasks are dispatched strictly by category rank (security first), then
//! `(file, line)`, then id. `next()` and `next_batch()` flip the tasks they
//! hand out to `InProgress`, so a task is never handed out twice.

pub mod dependency;
pub mod task;

pub use dependency::DependencyChecker;
pub use task::{FixTask, SkipReason, TaskOutcome, TaskStatus};

use anyhow::{Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::issue::Issue;

/// Result of recording an outcome via [`TaskQueue::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    Skipped,
    /// Failed with attempts remaining; the task is pending again.
    Requeued,
    /// Failed and out of attempts.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub known: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueue {
    max_attempts: u32,
    tasks: BTreeMap<String, FixTask>,
}

impl TaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            tasks: BTreeMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Add tasks for issues not already known. Known issues keep their state.
    pub fn merge(&mut self, issues: Vec<Issue>) -> MergeReport {
        let mut report = MergeReport::default();
        for issue in issues {
            if self.tasks.contains_key(&issue.id) {
                report.known += 1;
                continue;
            }
            report.added.push(issue.id.clone());
            self.tasks.insert(issue.id.clone(), FixTask::new(issue));
        }
        report
    }

    /// Pop the highest-priority pending task and mark it `InProgress`.
    pub fn next(&mut self) -> Option<FixTask> {
        self.next_batch(1).pop()
    }

    /// Pop up to `max` pending tasks touching pairwise-distinct files.
    ///
    /// Only tasks sharing the best pending category rank are eligible, so a
    /// lower-priority category never runs alongside a higher one.
    pub fn next_batch(&mut self, max: usize) -> Vec<FixTask> {
        let mut pending: Vec<&FixTask> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.priority_key().cmp(&b.priority_key()));

        let Some(best_rank) = pending.first().map(|t| t.issue.priority_rank) else {
            return Vec::new();
        };

        let mut files: HashSet<&PathBuf> = HashSet::new();
        let mut chosen: Vec<String> = Vec::new();
        for task in pending {
            if chosen.len() >= max || task.issue.priority_rank != best_rank {
                break;
            }
            if files.insert(&task.issue.file) {
                chosen.push(task.issue.id.clone());
            }
        }

        let now = Utc::now();
        chosen
            .into_iter()
            .filter_map(|id| {
                let task = self.tasks.get_mut(&id)?;
                task.status = TaskStatus::InProgress;
                task.started_at = Some(now);
                task.touch();
                Some(task.clone())
            })
            .collect()
    }

    /// Return an in-progress task to the pending pool without counting an attempt.
    pub fn requeue(&mut self, task_id: &str) -> Result<()> {
        let task = self.in_progress_mut(task_id)?;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.touch();
        Ok(())
    }

    /// Record the outcome of an in-progress task.
    ///
    /// Afterwards the task is never `InProgress`: it is `Applied`, `Skipped`,
    /// `Failed`, or (for a failure with attempts left) `Pending` again.
    pub fn complete(&mut self, task_id: &str, outcome: &TaskOutcome) -> Result<Completion> {
        let max_attempts = self.max_attempts;
        let task = self.in_progress_mut(task_id)?;
        let completion = match outcome {
            TaskOutcome::Applied { backup } => {
                task.attempt_count += 1;
                task.backup_ref = Some(backup.content_hash.clone());
                task.status = TaskStatus::Applied;
                task.last_error = None;
                Completion::Applied
            }
            TaskOutcome::Skipped { reason } => {
                task.status = TaskStatus::Skipped;
                task.skip_reason = Some(reason.clone());
                Completion::Skipped
            }
            TaskOutcome::Failed { failure, backup } => {
                task.attempt_count += 1;
                if let Some(backup) = backup {
                    task.backup_ref = Some(backup.content_hash.clone());
                }
                task.last_error = Some(failure.to_string());
                if task.attempt_count < max_attempts {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    Completion::Requeued
                } else {
                    task.status = TaskStatus::Failed;
                    Completion::Failed
                }
            }
        };
        if task.status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        task.touch();
        Ok(completion)
    }

    /// Mark a pending task as blocked; it will never be dispatched.
    pub fn block(&mut self, task_id: &str, reason: SkipReason) -> Result<()> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            bail!("Unknown task {}", task_id);
        };
        if task.status != TaskStatus::Pending {
            bail!("Task {} is {} and cannot be blocked", task_id, task.status);
        }
        task.status = TaskStatus::Skipped;
        task.skip_reason = Some(reason);
        task.completed_at = Some(Utc::now());
        task.touch();
        Ok(())
    }

    /// Overwrite a task's lifecycle state from a replayed checkpoint.
    pub(crate) fn restore_state(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        attempt_count: u32,
        reason: Option<String>,
        skip_reason: Option<SkipReason>,
    ) -> Result<()> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            bail!("Checkpoint references unknown task {}", task_id);
        };
        task.status = status;
        task.attempt_count = attempt_count;
        task.last_error = reason;
        task.skip_reason = skip_reason;
        if status.is_terminal() {
            task.completed_at.get_or_insert_with(Utc::now);
        }
        task.touch();
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&FixTask> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &FixTask> {
        self.tasks.values()
    }

    /// Tasks in dispatch order.
    pub fn ordered(&self) -> Vec<&FixTask> {
        let mut tasks: Vec<&FixTask> = self.tasks.values().collect();
        tasks.sort_by(|a, b| a.priority_key().cmp(&b.priority_key()));
        tasks
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.values().any(|t| t.status == TaskStatus::Pending)
    }

    pub fn in_progress_ids(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.issue.id.clone())
            .collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            total: self.tasks.len(),
            ..TaskCounts::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Applied => counts.applied += 1,
                TaskStatus::Skipped => counts.skipped += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn in_progress_mut(&mut self, task_id: &str) -> Result<&mut FixTask> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            bail!("Unknown task {}", task_id);
        };
        if task.status != TaskStatus::InProgress {
            bail!("Task {} is {}, expected in_progress", task_id, task.status);
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupRecord;
    use crate::errors::FixFailure;
    use crate::issue::{AnalyzerRecord, ingest};

    fn issues(specs: &[(&str, u32, &str)]) -> Vec<Issue> {
        ingest(
            specs
                .iter()
                .map(|(file, line, category)| AnalyzerRecord {
                    file: PathBuf::from(file),
                    line: *line,
                    end_line: None,
                    category: category.to_string(),
                    message: format!("{} issue at {}", category, line),
                    severity: "warning".into(),
                    symbol: None,
                    confidence: None,
                })
                .collect(),
        )
    }

    fn backup() -> BackupRecord {
        BackupRecord {
            original_path: PathBuf::from("a.rs"),
            backup_path: PathBuf::from("objects/abc"),
            content_hash: "abc".into(),
            timestamp: Utc::now(),
            mode: None,
        }
    }

    fn failed() -> TaskOutcome {
        TaskOutcome::Failed {
            failure: FixFailure::ValidationFailed("still present".into()),
            backup: Some(backup()),
        }
    }

    #[test]
    fn test_security_dispatched_before_quality_regardless_of_insertion() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[
            ("a.rs", 1, "quality"),
            ("b.rs", 9, "quality"),
            ("z.rs", 50, "security"),
            ("c.rs", 3, "duplicate"),
            ("a.rs", 40, "security"),
        ]));

        let mut order = Vec::new();
        while let Some(task) = queue.next() {
            order.push(task.issue.category);
            queue
                .complete(task.id(), &TaskOutcome::Applied { backup: backup() })
                .unwrap();
        }
        use crate::issue::Category::*;
        assert_eq!(order, vec![Security, Security, Duplicate, Quality, Quality]);
    }

    #[test]
    fn test_ties_broken_by_file_then_line() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("b.rs", 1, "quality"), ("a.rs", 9, "quality"), ("a.rs", 2, "quality")]));
        let first = queue.next().unwrap();
        assert_eq!(first.issue.file, PathBuf::from("a.rs"));
        assert_eq!(first.issue.line_range.start, 2);
    }

    #[test]
    fn test_next_never_hands_out_same_task_twice() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("a.rs", 1, "quality"), ("b.rs", 1, "quality")]));
        let a = queue.next().unwrap();
        let b = queue.next().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(queue.next().is_none());
        assert_eq!(queue.counts().in_progress, 2);
    }

    #[test]
    fn test_batch_uses_distinct_files_and_single_rank() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[
            ("a.rs", 1, "security"),
            ("a.rs", 5, "security"),
            ("b.rs", 1, "security"),
            ("c.rs", 1, "quality"),
        ]));
        let batch = queue.next_batch(10);
        assert_eq!(batch.len(), 2);
        let files: HashSet<_> = batch.iter().map(|t| t.issue.file.clone()).collect();
        assert_eq!(files.len(), 2);
        assert!(batch.iter().all(|t| t.issue.category == crate::issue::Category::Security));
    }

    #[test]
    fn test_batch_treats_path_spellings_as_one_file() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("./a.rs", 1, "quality"), ("a.rs", 5, "quality"), ("src/../a.rs", 9, "quality")]));
        let batch = queue.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].issue.file, PathBuf::from("a.rs"));
        assert_eq!(queue.counts().pending, 2);
    }

    #[test]
    fn test_failure_requeues_until_attempts_exhausted() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("a.rs", 1, "security")]));

        let task = queue.next().unwrap();
        assert_eq!(queue.complete(task.id(), &failed()).unwrap(), Completion::Requeued);
        assert_eq!(queue.get(task.id()).unwrap().status, TaskStatus::Pending);

        let task = queue.next().unwrap();
        assert_eq!(task.attempt_count, 1);
        assert_eq!(queue.complete(task.id(), &failed()).unwrap(), Completion::Failed);
        let stored = queue.get(task.id()).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.reason().unwrap().contains("still present"));
        assert!(queue.next().is_none());
    }

    #[test]
    fn test_complete_never_leaves_in_progress() {
        let outcomes = [
            TaskOutcome::Applied { backup: backup() },
            TaskOutcome::Skipped {
                reason: SkipReason::AlreadyResolved,
            },
            failed(),
        ];
        for outcome in outcomes {
            let mut queue = TaskQueue::new(1);
            queue.merge(issues(&[("a.rs", 1, "quality")]));
            let task = queue.next().unwrap();
            queue.complete(task.id(), &outcome).unwrap();
            let status = queue.get(task.id()).unwrap().status;
            assert!(status.is_terminal(), "status {status} is not terminal");
        }
    }

    #[test]
    fn test_complete_rejects_task_not_in_progress() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("a.rs", 1, "quality")]));
        let id = queue.ordered()[0].issue.id.clone();
        assert!(queue.complete(&id, &failed()).is_err());
    }

    #[test]
    fn test_merge_keeps_known_state() {
        let mut queue = TaskQueue::new(2);
        let batch = issues(&[("a.rs", 1, "quality")]);
        queue.merge(batch.clone());
        let task = queue.next().unwrap();
        queue
            .complete(task.id(), &TaskOutcome::Applied { backup: backup() })
            .unwrap();

        let report = queue.merge(batch);
        assert!(report.added.is_empty());
        assert_eq!(report.known, 1);
        assert_eq!(queue.counts().applied, 1);
    }

    #[test]
    fn test_blocked_task_never_dispatched() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("a.rs", 1, "duplicate")]));
        let id = queue.ordered()[0].issue.id.clone();
        queue
            .block(
                &id,
                SkipReason::BlockedDependency {
                    symbol: "helper".into(),
                    referenced_in: PathBuf::from("b.rs"),
                },
            )
            .unwrap();
        assert!(queue.next().is_none());
        assert_eq!(queue.counts().skipped, 1);
    }

    #[test]
    fn test_requeue_does_not_count_attempt() {
        let mut queue = TaskQueue::new(2);
        queue.merge(issues(&[("a.rs", 1, "quality")]));
        let task = queue.next().unwrap();
        queue.requeue(task.id()).unwrap();
        let again = queue.next().unwrap();
        assert_eq!(again.attempt_count, 0);
    }
}
