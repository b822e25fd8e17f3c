//! Top-level driver: scan → fix ⇄ validate → publish → done.
//!
//! The orchestrator owns the `Session`, the `TaskQueue` and the outcome
//! window and is the only code that mutates them. Fix workers run on a
//! `JoinSet` and hand their outcomes back here; every outcome is appended to
//! the checkpoint log before the next queue snapshot is written.

pub mod lock;

pub use lock::InstanceLock;

use anyhow::Context;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::agent::{CommandAgent, FixAgent};
use crate::analyzer::{Analyzer, CommandAnalyzer, scan_issues};
use crate::backup::BackupStore;
use crate::config::Config;
use crate::errors::{FixFailure, PipelineError};
use crate::fix::FixProtocol;
use crate::fix::FileLocks;
use crate::integrity::{IntegrityGuard, IntegrityMonitor};
use crate::issue::Issue;
use crate::publish::{CommandPublisher, LogPublisher, Publisher};
use crate::queue::{Completion, DependencyChecker, FixTask, SkipReason, TaskOutcome, TaskQueue, TaskStatus};
use crate::session::{CheckpointLog, CheckpointRecord, Session, SessionManager, SessionPhase, SessionReport};
use crate::strategy::{self, OutcomeKind, OutcomeWindow, StrategyBounds};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Remaining issues ≤ target and the session stayed trusted.
    TargetReached,
    /// Out of cycles, or nothing left that can be dispatched.
    Exhausted,
    /// Target met while a protected file had drifted; publish withheld.
    Untrusted,
    /// Interrupted; resumable.
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::TargetReached => 0,
            RunOutcome::Exhausted => 1,
            RunOutcome::Untrusted | RunOutcome::Aborted => 2,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::TargetReached => "target reached",
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::Untrusted => "untrusted",
            RunOutcome::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub report: SessionReport,
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub agent: Arc<dyn FixAgent>,
    pub publisher: Arc<dyn Publisher>,
}

impl Collaborators {
    /// Shell-command collaborators from `[analyzer]`, `[agent]` and `[publish]`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let settings = &config.settings;
        let Some(analyzer_cmd) = settings.analyzer.command.as_deref() else {
            anyhow::bail!("No analyzer command configured. Set [analyzer].command or PIPELINE_ANALYZER_CMD.");
        };
        let Some(agent_cmd) = settings.agent.command.as_deref() else {
            anyhow::bail!("No agent command configured. Set [agent].command or PIPELINE_AGENT_CMD.");
        };

        let publisher: Arc<dyn Publisher> = match settings.publish.command.as_deref() {
            Some(cmd) => Arc::new(CommandPublisher::new(cmd, &config.project_dir)),
            None => Arc::new(LogPublisher),
        };

        Ok(Self {
            analyzer: Arc::new(CommandAnalyzer::new(
                analyzer_cmd,
                &config.project_dir,
                Duration::from_secs(settings.analyzer.timeout_secs),
            )),
            agent: Arc::new(CommandAgent::new(
                agent_cmd,
                &config.project_dir,
                settings.agent.timeout(),
            )),
            publisher,
        })
    }
}

/// Everything one run mutates. Owned by the orchestrator loop.
struct RunState {
    session: Session,
    queue: TaskQueue,
    checkpoint: Arc<CheckpointLog>,
    backups: Arc<BackupStore>,
    window: OutcomeWindow,
    trusted: Arc<AtomicBool>,
    started: Instant,
    prior_active_secs: f64,
}

impl RunState {
    fn refresh(&mut self) {
        self.session.counts = self.queue.counts();
        self.session.trusted = self.trusted.load(Ordering::SeqCst);
        self.session.metrics.active_secs = self.prior_active_secs + self.started.elapsed().as_secs_f64();
        self.session.updated_at = Utc::now();
    }
}

pub struct Orchestrator {
    config: Config,
    collaborators: Collaborators,
    sessions: SessionManager,
    locks: FileLocks,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            sessions: SessionManager::new(&config.sessions_dir),
            config,
            collaborators,
            locks: FileLocks::new(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Start a new session.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let _lock = InstanceLock::acquire(&self.config.lock_file)?;
        self.config.ensure_directories()?;
        let settings = &self.config.settings;

        let session = self
            .sessions
            .create(settings.pipeline.max_cycles.max(1), settings.pipeline.target_issues)?;
        let id = session.session_id.clone();
        let (checkpoint, _) = CheckpointLog::open(self.sessions.checkpoint_path(&id))?;
        let backups = BackupStore::open(self.sessions.backups_dir(&id), settings.backups.retention)?;
        tracing::info!(
            session = %id,
            max_cycles = session.max_cycles,
            target = session.target_issues,
            "starting session"
        );

        let state = RunState {
            session,
            queue: TaskQueue::new(settings.pipeline.max_attempts),
            checkpoint: Arc::new(checkpoint),
            backups: Arc::new(backups),
            window: OutcomeWindow::new(settings.strategy.window_size),
            trusted: Arc::new(AtomicBool::new(true)),
            started: Instant::now(),
            prior_active_secs: 0.0,
        };
        self.drive(state).await
    }

    /// Continue an unfinished session from its last durable checkpoint.
    pub async fn resume(&self, session_id: &str) -> Result<RunSummary, PipelineError> {
        let _lock = InstanceLock::acquire(&self.config.lock_file)?;
        self.config.ensure_directories()?;
        let settings = &self.config.settings;

        // Fail on an unknown id before the backup store creates directories for it.
        self.sessions.load(session_id)?;
        let backups = BackupStore::open(self.sessions.backups_dir(session_id), settings.backups.retention)?;
        let recovered = self
            .sessions
            .recover(session_id, &backups, settings.pipeline.max_attempts)?;
        let mut session = recovered.session;
        session.reopen()?;

        let window = rebuild_window(&recovered.checkpoint, &recovered.queue, settings.strategy.window_size)?;
        tracing::info!(
            session = %session_id,
            replayed = recovered.replayed,
            in_doubt = recovered.in_doubt.len(),
            cycle = session.cycle,
            "resuming session"
        );

        let mut state = RunState {
            prior_active_secs: session.metrics.active_secs,
            session,
            queue: recovered.queue,
            checkpoint: Arc::new(recovered.checkpoint),
            backups: Arc::new(backups),
            window,
            trusted: Arc::new(AtomicBool::new(true)),
            started: Instant::now(),
        };
        // Make the in-doubt resets durable before anything is dispatched again.
        self.persist(&mut state)?;
        self.drive(state).await
    }

    async fn drive(&self, mut state: RunState) -> Result<RunSummary, PipelineError> {
        let settings = &self.config.settings;
        let guard = Arc::new(IntegrityGuard::open(
            &self.config.project_dir,
            &self.config.protection_dir,
            self.locks.clone(),
            settings.protection.os_immutable,
            settings.backups.retention,
        )?);

        let violations = guard.check()?;
        if !violations.is_empty() {
            for violation in violations {
                tracing::error!("{}", violation.into_error(&self.config.project_dir));
            }
            tracing::warn!(session = %state.session.session_id, "session is untrusted until protected files are restored");
            state.trusted.store(false, Ordering::SeqCst);
        }
        let monitor = (!guard.is_empty()).then(|| {
            IntegrityMonitor::spawn(
                guard.clone(),
                Duration::from_secs(settings.protection.check_interval_secs),
                state.trusted.clone(),
            )
        });

        let protocol = Arc::new(FixProtocol::new(
            self.config.project_dir.clone(),
            self.collaborators.analyzer.clone(),
            self.collaborators.agent.clone(),
            state.backups.clone(),
            state.checkpoint.clone(),
            self.locks.clone(),
            settings.agent.clone(),
            settings.validation.clone(),
        ));

        let result = tokio::select! {
            r = self.cycles(&mut state, &protocol) => r.map(Some),
            _ = tokio::signal::ctrl_c() => Ok(None),
        };

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        match result {
            Ok(Some(outcome)) => {
                self.persist(&mut state)?;
                let report = SessionReport::build(&state.session, &state.queue);
                self.sessions.save_report(&report)?;
                tracing::info!(
                    session = %state.session.session_id,
                    outcome = %outcome,
                    applied = report.summary.applied,
                    skipped = report.summary.skipped,
                    failed = report.summary.failed,
                    "session finished"
                );
                Ok(RunSummary { outcome, report })
            }
            Ok(None) => {
                tracing::warn!(session = %state.session.session_id, "interrupted; resume with `pipeline resume`");
                let report = self.abort(&mut state, "interrupted");
                Ok(RunSummary {
                    outcome: RunOutcome::Aborted,
                    report,
                })
            }
            Err(e) => {
                tracing::error!(session = %state.session.session_id, "session aborted: {}", e);
                self.abort(&mut state, &e.to_string());
                Err(e)
            }
        }
    }

    async fn cycles(&self, state: &mut RunState, protocol: &Arc<FixProtocol>) -> Result<RunOutcome, PipelineError> {
        self.mark_phase(state)?;
        let issues = scan_issues(self.collaborators.analyzer.as_ref()).await?;
        state.session.remaining_issues = Some(issues.len());
        self.ingest(state, issues)?;

        let max_cycles = state.session.max_cycles.max(1);
        loop {
            state.session.cycle += 1;
            self.enter(state, SessionPhase::Fix)?;
            let dispatched = self.fix_batch(state, protocol).await?;
            self.persist(state)?;

            self.enter(state, SessionPhase::Validate)?;
            let issues = scan_issues(self.collaborators.analyzer.as_ref()).await?;
            let remaining = issues.len();
            state.session.remaining_issues = Some(remaining);
            self.ingest(state, issues)?;

            tracing::info!(
                cycle = state.session.cycle,
                dispatched,
                remaining,
                target = state.session.target_issues,
                "cycle complete"
            );

            if state.session.target_met() {
                if !state.trusted.load(Ordering::SeqCst) {
                    tracing::warn!("target met but session is untrusted; publish withheld");
                    self.enter(state, SessionPhase::Done)?;
                    return Ok(RunOutcome::Untrusted);
                }
                self.publish(state).await?;
                return Ok(RunOutcome::TargetReached);
            }
            if dispatched == 0 && !state.queue.has_pending() {
                tracing::info!(remaining, "no dispatchable tasks remain");
                self.enter(state, SessionPhase::Done)?;
                return Ok(RunOutcome::Exhausted);
            }
            if state.session.cycle >= max_cycles {
                tracing::info!(max_cycles, remaining, "cycle limit reached");
                self.enter(state, SessionPhase::Done)?;
                return Ok(RunOutcome::Exhausted);
            }
        }
    }

    /// Merge analyzer results, block tasks that would break dependents, and snapshot.
    fn ingest(&self, state: &mut RunState, issues: Vec<Issue>) -> Result<(), PipelineError> {
        let merged = state.queue.merge(issues);
        tracing::info!(added = merged.added.len(), known = merged.known, "merged analyzer results");

        if !merged.added.is_empty() {
            let added: Vec<&Issue> = merged
                .added
                .iter()
                .filter_map(|id| state.queue.get(id))
                .map(|task| &task.issue)
                .collect();
            let blocked = DependencyChecker::new(&self.config.project_dir).check_all(&added);

            for (task_id, reason) in blocked {
                if let SkipReason::BlockedDependency {
                    symbol,
                    referenced_in,
                } = &reason
                {
                    let err = PipelineError::BlockedDependency {
                        task_id: task_id.clone(),
                        symbol: symbol.clone(),
                        referenced_in: referenced_in.clone(),
                    };
                    tracing::warn!(task = %task_id, "{}", err);
                }
                state.queue.block(&task_id, reason)?;
            }
        }
        self.persist(state)
    }

    /// Dispatch one strategy-sized batch and record each outcome as it lands.
    async fn fix_batch(&self, state: &mut RunState, protocol: &Arc<FixProtocol>) -> Result<usize, PipelineError> {
        let bounds = StrategyBounds::from(&self.config.settings.strategy);
        let params = strategy::derive(&state.window, &bounds);
        let batch = state.queue.next_batch(params.batch_size);
        if batch.is_empty() {
            return Ok(0);
        }

        let dispatched = batch.len();
        let workers = if params.parallel_allowed { dispatched } else { 1 };
        tracing::info!(
            cycle = state.session.cycle,
            tasks = dispatched,
            workers,
            batch_size = params.batch_size,
            level = %params.validation_level,
            "dispatching batch"
        );

        let mut waiting: VecDeque<FixTask> = batch.into();
        let mut in_flight: JoinSet<(String, Result<TaskOutcome, PipelineError>)> = JoinSet::new();
        loop {
            while in_flight.len() < workers {
                let Some(task) = waiting.pop_front() else {
                    break;
                };
                let protocol = protocol.clone();
                let level = params.validation_level;
                in_flight.spawn(async move {
                    let result = protocol.apply(&task, level).await;
                    (task.issue.id, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (task_id, result) =
                joined.map_err(|e| PipelineError::Other(anyhow::anyhow!("Fix worker failed: {}", e)))?;
            self.record_outcome(state, &task_id, &result?)?;
        }
        Ok(dispatched)
    }

    fn record_outcome(&self, state: &mut RunState, task_id: &str, outcome: &TaskOutcome) -> Result<(), PipelineError> {
        let completion = state.queue.complete(task_id, outcome)?;
        let Some(task) = state.queue.get(task_id) else {
            return Err(PipelineError::Other(anyhow::anyhow!("Task {} vanished from queue", task_id)));
        };
        let category = task.issue.category;
        let attempts = task.attempt_count;
        let reason = task.reason();

        state.checkpoint.append(CheckpointRecord::Completed {
            task_id: task_id.to_string(),
            status: task.status,
            attempt_count: task.attempt_count,
            reason: task.last_error.clone(),
            skip_reason: task.skip_reason.clone(),
        })?;
        state.window.record(category, OutcomeKind::from(outcome));

        let metrics = &mut state.session.metrics;
        match outcome {
            TaskOutcome::Applied { .. } => metrics.dispatched += 1,
            TaskOutcome::Failed { failure, backup } => {
                if backup.is_some() {
                    metrics.dispatched += 1;
                    metrics.restores += 1;
                }
                if matches!(failure, FixFailure::AgentTimeout { .. }) {
                    metrics.agent_timeouts += 1;
                }
            }
            TaskOutcome::Skipped { .. } => {}
        }

        let reason = match outcome {
            TaskOutcome::Failed { failure, .. } => failure.clone().into_pipeline_error(task_id).to_string(),
            _ => reason.unwrap_or_default(),
        };
        match completion {
            Completion::Applied => tracing::info!(task = %task_id, %category, attempts, "applied"),
            Completion::Skipped => tracing::info!(task = %task_id, %category, "skipped: {}", reason),
            Completion::Requeued => {
                tracing::warn!(task = %task_id, %category, attempts, "requeued after failure: {}", reason)
            }
            Completion::Failed => {
                tracing::error!(task = %task_id, %category, attempts, "permanently failed: {}", reason)
            }
        }
        Ok(())
    }

    async fn publish(&self, state: &mut RunState) -> Result<(), PipelineError> {
        self.enter(state, SessionPhase::Publish)?;
        state.session.publish_gate_satisfied = true;
        state.refresh();
        let report = SessionReport::build(&state.session, &state.queue);
        self.collaborators
            .publisher
            .publish(&report)
            .await
            .context("Publish step failed")?;
        self.enter(state, SessionPhase::Done)
    }

    fn enter(&self, state: &mut RunState, phase: SessionPhase) -> Result<(), PipelineError> {
        state.session.transition(phase)?;
        self.mark_phase(state)
    }

    fn mark_phase(&self, state: &mut RunState) -> Result<(), PipelineError> {
        state.checkpoint.append(CheckpointRecord::PhaseChanged {
            phase: state.session.phase,
            cycle: state.session.cycle,
        })?;
        state.refresh();
        self.sessions.save(&state.session)
    }

    /// Write `queue.json` covering every checkpoint entry so far.
    ///
    /// Only called with no fixes in flight, so no open dispatch is hidden
    /// behind the cursor.
    fn persist(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let cursor = state.checkpoint.cursor();
        self.sessions
            .save_queue(&state.session.session_id, &state.queue, cursor)?;
        state.checkpoint.append(CheckpointRecord::QueueSnapshot { cursor })?;
        state.session.checkpoint_cursor = cursor;
        state.refresh();
        self.sessions.save(&state.session)
    }

    /// Mark the session aborted. The queue snapshot is left alone: the log
    /// after its cursor still describes every in-flight dispatch.
    fn abort(&self, state: &mut RunState, reason: &str) -> SessionReport {
        if !state.session.phase.is_terminal()
            && let Err(e) = state.session.transition(SessionPhase::Aborted)
        {
            tracing::error!("failed to mark session aborted: {}", e);
        }
        state.session.abort_reason = Some(reason.to_string());
        state.refresh();
        if let Err(e) = self.sessions.save(&state.session) {
            tracing::error!("failed to save aborted session: {}", e);
        }
        let report = SessionReport::build(&state.session, &state.queue);
        if let Err(e) = self.sessions.save_report(&report) {
            tracing::error!("failed to save session report: {}", e);
        }
        report
    }
}

/// Refill the outcome window from completions already in the checkpoint log.
fn rebuild_window(
    checkpoint: &CheckpointLog,
    queue: &TaskQueue,
    capacity: usize,
) -> Result<OutcomeWindow, PipelineError> {
    let mut window = OutcomeWindow::new(capacity);
    for entry in CheckpointLog::read(checkpoint.path())? {
        let CheckpointRecord::Completed { task_id, status, .. } = entry.record else {
            continue;
        };
        let Some(task) = queue.get(&task_id) else {
            continue;
        };
        let kind = match status {
            TaskStatus::Applied => OutcomeKind::Applied,
            TaskStatus::Skipped => OutcomeKind::Skipped,
            // A completion that left the task pending was a requeued failure.
            TaskStatus::Failed | TaskStatus::Pending => OutcomeKind::Failed,
            TaskStatus::InProgress => continue,
        };
        window.record(task.issue.category, kind);
    }
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::AnalyzerRecord;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    use crate::fix::FixInstruction;
    use crate::pipeline_config::PipelineToml;

    /// One quality issue per line containing `TODO`.
    struct TodoAnalyzer {
        root: PathBuf,
    }

    #[async_trait]
    impl Analyzer for TodoAnalyzer {
        async fn scan(&self) -> anyhow::Result<Vec<AnalyzerRecord>> {
            let mut records = Vec::new();
            for name in ["a.rs", "b.rs"] {
                records.extend(self.check_file(Path::new(name)).await?);
            }
            Ok(records)
        }

        async fn check_file(&self, file: &Path) -> anyhow::Result<Vec<AnalyzerRecord>> {
            let content = std::fs::read_to_string(self.root.join(file)).unwrap_or_default();
            Ok(content
                .lines()
                .enumerate()
                .filter(|(_, l)| l.contains("TODO"))
                .map(|(i, _)| AnalyzerRecord {
                    file: file.to_path_buf(),
                    line: i as u32 + 1,
                    end_line: None,
                    category: "quality".into(),
                    message: "leftover TODO".into(),
                    severity: "warning".into(),
                    symbol: None,
                    confidence: None,
                })
                .collect())
        }
    }

    struct StripAgent {
        root: PathBuf,
    }

    #[async_trait]
    impl FixAgent for StripAgent {
        async fn apply(&self, instruction: &FixInstruction) -> anyhow::Result<()> {
            let path = self.root.join(&instruction.file);
            let content = std::fs::read_to_string(&path)?;
            std::fs::write(&path, content.replacen("TODO", "done", 1))?;
            Ok(())
        }
    }

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        let mut settings = PipelineToml::default();
        settings.pipeline.max_cycles = 5;
        let config = Config::with_settings(dir.path().to_path_buf(), false, settings);
        let root = dir.path().to_path_buf();
        Orchestrator::new(
            config,
            Collaborators {
                analyzer: Arc::new(TodoAnalyzer { root: root.clone() }),
                agent: Arc::new(StripAgent { root }),
                publisher: Arc::new(LogPublisher),
            },
        )
    }

    #[tokio::test]
    async fn test_run_reaches_target_and_publishes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n// TODO one\n").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn b() {}\n// TODO two\n").unwrap();

        let orch = orchestrator(&dir);
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::TargetReached);
        assert_eq!(summary.outcome.exit_code(), 0);
        assert_eq!(summary.report.summary.applied, 2);
        assert!(summary.report.publish_gate_satisfied);

        let session = orch.sessions().latest().unwrap().unwrap();
        assert_eq!(session.phase, SessionPhase::Done);
        assert_eq!(session.remaining_issues, Some(0));
        assert!(orch.sessions().load_report(&session.session_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_done_session_not_resumable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "// TODO\n").unwrap();
        std::fs::write(dir.path().join("b.rs"), "\n").unwrap();

        let orch = orchestrator(&dir);
        let summary = orch.run().await.unwrap();
        let err = orch.resume(&summary.report.session_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::SessionNotResumable { .. }));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Exhausted.exit_code(), 1);
        assert_eq!(RunOutcome::Untrusted.exit_code(), 2);
        assert_eq!(RunOutcome::Aborted.exit_code(), 2);
    }
}
