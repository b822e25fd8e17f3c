//! Shell subprocess execution for the external collaborators.
//!
//! Commands run through `sh -c` in the project directory, receive an optional
//! payload on stdin, and are killed if they outlive the timeout. Each command
//! leads its own process group; whatever it forks is killed with it, and
//! `run` only returns once the group is gone.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::{Instant, timeout};

/// Upper bound on waiting for killed descendants to disappear.
const GROUP_EXIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ShellOutcome {
    Finished(Output),
    TimedOut,
}

pub struct ShellCommand<'a> {
    pub command: &'a str,
    pub working_dir: &'a Path,
    pub envs: Vec<(&'static str, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ShellCommand<'_> {
    pub async fn run(self) -> Result<ShellOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.command)
            .current_dir(self.working_dir)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", self.command))?;
        // Declared after `child` so a cancelled run kills the group first.
        let mut group = ProcessGroup::led_by(&child);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let payload = self.stdin.as_deref();

        let collected = timeout(self.timeout, async {
            let (fed, out, err, status) =
                tokio::join!(feed(stdin, payload), drain(stdout), drain(stderr), child.wait());
            fed?;
            Ok::<_, std::io::Error>(Output {
                status: status?,
                stdout: out?,
                stderr: err?,
            })
        })
        .await;

        group.terminate(&mut child).await;
        match collected {
            Ok(output) => Ok(ShellOutcome::Finished(
                output.context("Failed to wait for command")?,
            )),
            Err(_) => {
                tracing::debug!(command = %self.command, "command timed out, process group killed");
                Ok(ShellOutcome::TimedOut)
            }
        }
    }
}

async fn feed(stdin: Option<ChildStdin>, payload: Option<&[u8]>) -> std::io::Result<()> {
    let (Some(mut pipe), Some(payload)) = (stdin, payload) else {
        return Ok(());
    };
    match pipe.write_all(payload).await {
        // Commands are free to exit without reading their input.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// The process group a spawned shell leads. Dropping it SIGKILLs the group.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn led_by(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    /// Kill every member, reap the leader, then wait for the rest to exit.
    async fn terminate(&mut self, child: &mut Child) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        kill_group(pgid);
        if let Err(e) = child.wait().await {
            tracing::warn!(pgid, "failed to reap command: {}", e);
        }

        let deadline = Instant::now() + GROUP_EXIT_WAIT;
        while group_alive(pgid) {
            if Instant::now() >= deadline {
                tracing::warn!(pgid, "process group still alive after SIGKILL");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, "failed to kill process group: {}", e),
    }
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid), None).is_ok()
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}
