use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::issue::Category;
use crate::queue::{TaskQueue, TaskStatus};
use crate::session::{Session, SessionPhase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPerformance {
    pub duration_s: f64,
    pub fixes_per_minute: f64,
}

/// A task that did not end applied, with the reason it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNote {
    pub task_id: String,
    pub file: PathBuf,
    pub category: Category,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub summary: ReportSummary,
    pub performance: ReportPerformance,
    pub phase: SessionPhase,
    pub cycles: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_issues: Option<usize>,
    pub trusted: bool,
    pub publish_gate_satisfied: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TaskNote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<TaskNote>,
}

impl SessionReport {
    pub fn build(session: &Session, queue: &TaskQueue) -> Self {
        let counts = queue.counts();
        let duration_s = session.metrics.active_secs;
        let fixes_per_minute = if duration_s > 0.0 {
            counts.applied as f64 / (duration_s / 60.0)
        } else {
            0.0
        };

        let note = |status: TaskStatus| -> Vec<TaskNote> {
            queue
                .ordered()
                .into_iter()
                .filter(|t| t.status == status)
                .map(|t| TaskNote {
                    task_id: t.issue.id.clone(),
                    file: t.issue.file.clone(),
                    category: t.issue.category,
                    attempts: t.attempt_count,
                    reason: t.reason().unwrap_or_else(|| "unknown".to_string()),
                })
                .collect()
        };

        Self {
            session_id: session.session_id.clone(),
            summary: ReportSummary {
                total: counts.total,
                applied: counts.applied,
                skipped: counts.skipped,
                failed: counts.failed,
            },
            performance: ReportPerformance {
                duration_s: (duration_s * 10.0).round() / 10.0,
                fixes_per_minute: (fixes_per_minute * 100.0).round() / 100.0,
            },
            phase: session.phase,
            cycles: session.cycle,
            remaining_issues: session.remaining_issues,
            trusted: session.trusted,
            publish_gate_satisfied: session.publish_gate_satisfied,
            failures: note(TaskStatus::Failed),
            skipped: note(TaskStatus::Skipped),
        }
    }
}
