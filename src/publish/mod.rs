//! "Ready to publish" signal.
//!
//! The pipeline performs no version-control operations itself. When a session
//! meets its target while trusted, the report is handed to a `Publisher`
//! which owns the branch/commit step.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::{ShellCommand, ShellOutcome};
use crate::session::SessionReport;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, report: &SessionReport) -> Result<()>;
}

/// Runs `[publish].command` with the session report JSON on stdin.
pub struct CommandPublisher {
    command: String,
    project_dir: PathBuf,
}

impl CommandPublisher {
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
        }
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish(&self, report: &SessionReport) -> Result<()> {
        let payload = serde_json::to_vec(report).context("Failed to serialize session report")?;
        let outcome = ShellCommand {
            command: &self.command,
            working_dir: &self.project_dir,
            envs: vec![("PIPELINE_SESSION_ID", report.session_id.clone())],
            stdin: Some(payload),
            timeout: PUBLISH_TIMEOUT,
        }
        .run()
        .await?;

        match outcome {
            ShellOutcome::Finished(output) if output.status.success() => {
                tracing::info!(session = %report.session_id, "publish command completed");
                Ok(())
            }
            ShellOutcome::Finished(output) => bail!(
                "publish command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            ShellOutcome::TimedOut => bail!("publish command timed out"),
        }
    }
}

/// Records the gate in the log only. Used when no publish command is configured.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, report: &SessionReport) -> Result<()> {
        tracing::info!(
            session = %report.session_id,
            applied = report.summary.applied,
            "ready to publish"
        );
        Ok(())
    }
}
