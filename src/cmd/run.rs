//! Session execution: `pipeline run` and `pipeline resume`.

use anyhow::{Result, bail};
use std::path::Path;

use remediate::config::Config;
use remediate::orchestrator::{Collaborators, Orchestrator, RunSummary};

fn check_run_prerequisites(project_dir: &Path) -> Result<()> {
    if !remediate::init::is_initialized(project_dir) {
        bail!("Project not initialized. Run 'pipeline init' first.");
    }
    Ok(())
}

fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    for warning in config.settings.validate() {
        tracing::debug!("config: {}", warning);
    }
    let collaborators = Collaborators::from_config(&config)?;
    Ok(Orchestrator::new(config, collaborators))
}

pub async fn cmd_run(
    project_dir: &Path,
    verbose: bool,
    max_cycles: Option<u32>,
    target_issues: Option<usize>,
) -> Result<u8> {
    check_run_prerequisites(project_dir)?;
    let config = Config::new(project_dir.to_path_buf(), verbose)?.with_run_overrides(max_cycles, target_issues);
    let orchestrator = build_orchestrator(config)?;

    let summary = orchestrator.run().await?;
    print_summary(&summary);
    Ok(summary.outcome.exit_code())
}

pub async fn cmd_resume(project_dir: &Path, verbose: bool, session_id: &str) -> Result<u8> {
    check_run_prerequisites(project_dir)?;
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let orchestrator = build_orchestrator(config)?;

    let summary = orchestrator.resume(session_id).await?;
    print_summary(&summary);
    Ok(summary.outcome.exit_code())
}

fn print_summary(summary: &RunSummary) {
    let report = &summary.report;
    let outcome = match summary.outcome.exit_code() {
        0 => console::style(summary.outcome.to_string()).green().bold(),
        1 => console::style(summary.outcome.to_string()).yellow().bold(),
        _ => console::style(summary.outcome.to_string()).red().bold(),
    };

    println!();
    println!("Session {}: {}", console::style(&report.session_id).cyan(), outcome);
    println!(
        "  applied {}  skipped {}  failed {}  (of {})",
        report.summary.applied, report.summary.skipped, report.summary.failed, report.summary.total
    );
    if let Some(remaining) = report.remaining_issues {
        println!("  remaining issues: {}", remaining);
    }
    println!(
        "  {} cycles in {:.1}s ({:.2} fixes/min)",
        report.cycles, report.performance.duration_s, report.performance.fixes_per_minute
    );
    if !report.trusted {
        println!(
            "  {} protected files drifted; run 'pipeline protect check'",
            console::style("⚠").yellow()
        );
    }
    for note in &report.failures {
        println!(
            "  {} {} {} ({} attempts): {}",
            console::style("failed").red(),
            note.task_id,
            note.file.display(),
            note.attempts,
            note.reason
        );
    }
    println!();
}
