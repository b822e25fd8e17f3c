//! External fixing-agent collaborator.
//!
//! The agent receives one `FixInstruction` and signals completion by
//! returning control. File content is the source of truth; the return value
//! only reports whether the agent itself crashed.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::fix::FixInstruction;
use crate::process::{ShellCommand, ShellOutcome};

#[async_trait]
pub trait FixAgent: Send + Sync {
    async fn apply(&self, instruction: &FixInstruction) -> Result<()>;
}

/// Runs the configured agent command with the instruction JSON on stdin.
///
/// The command timeout is the fix deadline. On expiry the agent's whole
/// process group is killed and reaped before `apply` returns
/// `PipelineError::AgentTimeout`, so nothing it forked can touch the file
/// after the protocol restores it.
pub struct CommandAgent {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FixAgent for CommandAgent {
    async fn apply(&self, instruction: &FixInstruction) -> Result<()> {
        let payload =
            serde_json::to_vec(instruction).context("Failed to serialize fix instruction")?;

        tracing::debug!(task = %instruction.task_id, command = %self.command, "invoking agent");
        let outcome = ShellCommand {
            command: &self.command,
            working_dir: &self.project_dir,
            envs: vec![
                ("PIPELINE_TASK_ID", instruction.task_id.clone()),
                ("PIPELINE_TASK_FILE", instruction.file.display().to_string()),
                ("PIPELINE_TASK_LINE", instruction.line.to_string()),
                ("PIPELINE_TASK_CATEGORY", instruction.category.to_string()),
                ("PIPELINE_FIX_PROMPT", instruction.to_prompt()),
            ],
            stdin: Some(payload),
            timeout: self.timeout,
        }
        .run()
        .await?;

        match outcome {
            ShellOutcome::Finished(output) if output.status.success() => Ok(()),
            ShellOutcome::Finished(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "agent exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                )
            }
            ShellOutcome::TimedOut => Err(PipelineError::AgentTimeout {
                task_id: instruction.task_id.clone(),
                secs: self.timeout.as_secs(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Category;
    use tempfile::tempdir;

    fn instruction() -> FixInstruction {
        FixInstruction {
            task_id: "abc123".into(),
            file: PathBuf::from("lib.rs"),
            line: 1,
            end_line: 1,
            category: Category::Quality,
            description: "trailing whitespace".into(),
            constraints: vec![],
        }
    }

    #[tokio::test]
    async fn test_command_agent_mutates_named_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}   \n").unwrap();
        let agent = CommandAgent::new(
            r#"printf 'fn a() {}\n' > "$PIPELINE_TASK_FILE""#,
            dir.path(),
            Duration::from_secs(5),
        );
        agent.apply(&instruction()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "fn a() {}\n");
    }

    #[tokio::test]
    async fn test_command_agent_receives_json_payload() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("cat > payload.json", dir.path(), Duration::from_secs(5));
        agent.apply(&instruction()).await.unwrap();
        let payload: FixInstruction =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("payload.json")).unwrap())
                .unwrap();
        assert_eq!(payload, instruction());
    }

    #[tokio::test]
    async fn test_command_agent_nonzero_exit_is_error() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("echo nope >&2; exit 4", dir.path(), Duration::from_secs(5));
        let err = agent.apply(&instruction()).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_command_agent_timeout_is_typed() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 5", dir.path(), Duration::from_millis(100));
        let err = agent.apply(&instruction()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AgentTimeout { task_id, .. }) if task_id == "abc123"
        ));
    }
}
