//! `pipeline status [--session ID]`.

use anyhow::{Context, Result};
use std::path::Path;

use remediate::config::Config;
use remediate::session::{SessionManager, SessionReport};

pub fn cmd_status(project_dir: &Path, session_id: Option<&str>, json: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    if !config.is_initialized() {
        println!("Project not initialized. Run 'pipeline init' first.");
        return Ok(());
    }

    let manager = SessionManager::new(&config.sessions_dir);
    let session = match session_id {
        Some(id) => manager.load(id)?,
        None => match manager.latest()? {
            Some(session) => session,
            None => {
                println!("No sessions yet. Start one with 'pipeline run'.");
                return Ok(());
            }
        },
    };

    let queue = manager
        .load_queue(&session.session_id)?
        .map(|(queue, _)| queue);
    let report = match (manager.load_report(&session.session_id)?, &queue) {
        (Some(report), _) => report,
        (None, Some(queue)) => SessionReport::build(&session, queue),
        (None, None) => SessionReport::build(&session, &remediate::queue::TaskQueue::new(1)),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    println!();
    println!("{}", console::style(format!("Session {}", session.session_id)).bold().cyan());
    println!("  Phase:     {}", session.phase);
    println!("  Cycle:     {}/{}", session.cycle, session.max_cycles);
    println!("  Created:   {}", session.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:   {}", session.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    match session.remaining_issues {
        Some(n) => println!("  Remaining: {} (target {})", n, session.target_issues),
        None => println!("  Remaining: unknown (target {})", session.target_issues),
    }
    println!(
        "  Tasks:     {} total, {} applied, {} skipped, {} failed, {} pending",
        report.summary.total,
        report.summary.applied,
        report.summary.skipped,
        report.summary.failed,
        queue.as_ref().map(|q| q.counts().pending).unwrap_or(0)
    );
    println!("  Trusted:   {}", if session.trusted { "yes" } else { "no" });
    if session.publish_gate_satisfied {
        println!("  Publish:   {}", console::style("gate satisfied").green());
    }
    if let Some(reason) = &session.abort_reason {
        println!("  Aborted:   {}", console::style(reason).red());
        println!();
        println!("Resume with 'pipeline resume --session {}'.", session.session_id);
    }

    if !report.failures.is_empty() {
        println!();
        println!("Failed tasks:");
        for note in &report.failures {
            println!(
                "  {} {}:{} {}",
                note.task_id,
                note.file.display(),
                note.category,
                console::style(&note.reason).dim()
            );
        }
    }
    println!();
    Ok(())
}
