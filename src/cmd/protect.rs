//! Control-file protection: `pipeline protect {setup|status|check|restore|unprotect}`.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use remediate::config::Config;
use remediate::fix::FileLocks;
use remediate::integrity::{IntegrityGuard, ProtectionState, ProtectionStatus};
use remediate::orchestrator::InstanceLock;

use super::super::ProtectCommands;

pub const CREDENTIAL_ENV: &str = "PIPELINE_CREDENTIAL";

pub async fn cmd_protect(project_dir: &Path, command: ProtectCommands, credential_stdin: bool) -> Result<u8> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    config.ensure_directories()?;
    let settings = &config.settings;
    let guard = IntegrityGuard::open(
        &config.project_dir,
        &config.protection_dir,
        FileLocks::new(),
        settings.protection.os_immutable,
        settings.backups.retention,
    )?;

    // Mutations wait for no run to be live; a run owns these files while it holds the lock.
    let mutating = matches!(
        command,
        ProtectCommands::Setup { .. } | ProtectCommands::Restore { .. } | ProtectCommands::Unprotect { .. }
    );
    let _lock = if mutating {
        Some(InstanceLock::acquire(&config.lock_file)?)
    } else {
        None
    };

    match command {
        ProtectCommands::Setup { patterns } => {
            let patterns = if patterns.is_empty() {
                settings.protection.files.clone()
            } else {
                patterns
            };
            if patterns.is_empty() {
                anyhow::bail!("No files to protect. Pass patterns or set [protection].files.");
            }
            let confirm = !guard.has_credential();
            let credential = read_credential(credential_stdin, confirm)?;
            let records = guard.setup(&patterns, credential.as_deref())?;
            println!(
                "{} {} file(s)",
                console::style("Protected").green().bold(),
                records.len()
            );
            for record in records {
                println!("  {} ({:?})", record.protected_path.display(), record.mode);
            }
            Ok(0)
        }
        ProtectCommands::Status => {
            print_statuses(&guard.status());
            Ok(0)
        }
        ProtectCommands::Check => {
            let violations = guard.check()?;
            if violations.is_empty() {
                println!("{} all protected files intact", console::style("✓").green());
                return Ok(0);
            }
            print_statuses(&violations);
            println!();
            println!("Restore with 'pipeline protect restore'.");
            Ok(2)
        }
        ProtectCommands::Restore { file } => {
            let credential = read_credential(credential_stdin, false)?;
            let target = file.map(|f| absolute(&config.project_dir, f));
            let restored = guard.restore(target.as_deref(), credential.as_deref()).await?;
            if restored.is_empty() {
                println!("Nothing to restore.");
            }
            for path in restored {
                println!("{} {}", console::style("Restored").green().bold(), path.display());
            }
            Ok(0)
        }
        ProtectCommands::Unprotect { files } => {
            let credential = read_credential(credential_stdin, false)?;
            let files: Vec<PathBuf> = files
                .into_iter()
                .map(|f| absolute(&config.project_dir, f))
                .collect();
            let removed = guard.unprotect(&files, credential.as_deref())?;
            for path in removed {
                println!("{} {}", console::style("Unprotected").yellow(), path.display());
            }
            Ok(0)
        }
    }
}

fn absolute(project_dir: &Path, file: PathBuf) -> PathBuf {
    if file.is_absolute() {
        file
    } else {
        project_dir.join(file)
    }
}

/// `--credential-stdin`, then `PIPELINE_CREDENTIAL`, then an interactive prompt.
/// `None` when none is available; the guard rejects and logs that.
fn read_credential(from_stdin: bool, confirm: bool) -> Result<Option<String>> {
    if from_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read credential from stdin")?;
        return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
    }
    if let Ok(value) = std::env::var(CREDENTIAL_ENV) {
        return Ok(Some(value));
    }
    if !console::Term::stderr().is_term() {
        return Ok(None);
    }

    use dialoguer::{Password, theme::ColorfulTheme};
    let theme = ColorfulTheme::default();
    let mut prompt = Password::with_theme(&theme).with_prompt("Administrative credential");
    if confirm {
        prompt = prompt.with_confirmation("Confirm credential", "Credentials do not match");
    }
    let value = prompt.interact().context("Failed to read credential")?;
    Ok(Some(value))
}

fn print_statuses(statuses: &[ProtectionStatus]) {
    if statuses.is_empty() {
        println!("No protected files. Run 'pipeline protect setup'.");
        return;
    }
    for status in statuses {
        let state = match &status.state {
            ProtectionState::Intact => console::style("intact".to_string()).green(),
            ProtectionState::Drifted { actual } => {
                console::style(format!("DRIFTED (now {})", &actual[..12.min(actual.len())])).red()
            }
            ProtectionState::Missing => console::style("MISSING".to_string()).red(),
        };
        println!(
            "  {:<40} {:<10} {}  verified {}",
            status.record.protected_path.display(),
            format!("{:?}", status.record.mode),
            state,
            status.record.last_verified.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
