//! External static-analysis collaborator.
//!
//! The analyzer contract is a JSON array of
//! `{file, line, end_line?, category, message, severity}` records on stdout.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::issue::{AnalyzerRecord, Issue, ingest};
use crate::process::{ShellCommand, ShellOutcome};
use crate::util::{find_json, normalize_path};

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Scan the whole project.
    async fn scan(&self) -> Result<Vec<AnalyzerRecord>>;

    /// Scan a single file (path relative to the project root).
    async fn check_file(&self, file: &Path) -> Result<Vec<AnalyzerRecord>>;
}

/// Scan and convert to issues with stable ids.
pub async fn scan_issues(analyzer: &dyn Analyzer) -> Result<Vec<Issue>> {
    Ok(ingest(analyzer.scan().await?))
}

/// Number of current issues in `file` that describe the same problem as `issue`.
pub async fn count_matching(analyzer: &dyn Analyzer, issue: &Issue) -> Result<usize> {
    let current = ingest(analyzer.check_file(&issue.file).await?);
    Ok(current.iter().filter(|i| i.same_problem(issue)).count())
}

/// Runs the configured analyzer command.
///
/// `check_file` runs the same command with `PIPELINE_TARGET_FILE` set and
/// filters the results to that file, so analyzers that ignore the variable
/// still work.
pub struct CommandAnalyzer {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
            timeout,
        }
    }

    /// Project-relative, normalized form of a reported path.
    fn relative(&self, file: &Path) -> PathBuf {
        let file = normalize_path(file);
        match file.strip_prefix(normalize_path(&self.project_dir)) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => file,
        }
    }

    async fn run(&self, target: Option<&Path>) -> Result<Vec<AnalyzerRecord>> {
        let mut envs = vec![("PIPELINE_PROJECT_DIR", self.project_dir.display().to_string())];
        if let Some(file) = target {
            envs.push(("PIPELINE_TARGET_FILE", file.display().to_string()));
        }

        let outcome = ShellCommand {
            command: &self.command,
            working_dir: &self.project_dir,
            envs,
            stdin: None,
            timeout: self.timeout,
        }
        .run()
        .await
        .context("Failed to run analyzer")?;

        let output = match outcome {
            ShellOutcome::Finished(output) => output,
            ShellOutcome::TimedOut => {
                bail!("Analyzer timed out after {}s", self.timeout.as_secs())
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Many linters exit non-zero when they find issues; trust stdout if it parses.
        let parsed = parse_records(&stdout).map(|records| {
            records
                .into_iter()
                .map(|mut record| {
                    record.file = self.relative(&record.file);
                    record
                })
                .collect::<Vec<_>>()
        });
        if output.status.success() {
            return parsed;
        }
        match parsed {
            Ok(records) if !records.is_empty() => Ok(records),
            other => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = match (stderr.trim(), other) {
                    ("", Err(e)) => e.to_string(),
                    ("", Ok(_)) => "no output".to_string(),
                    (text, _) => text.to_string(),
                };
                bail!(
                    "Analyzer exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    detail
                )
            }
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn scan(&self) -> Result<Vec<AnalyzerRecord>> {
        let records = self.run(None).await?;
        tracing::info!(count = records.len(), "analyzer scan complete");
        Ok(records)
    }

    async fn check_file(&self, file: &Path) -> Result<Vec<AnalyzerRecord>> {
        let records = self.run(Some(file)).await?;
        let file = self.relative(file);
        Ok(records.into_iter().filter(|r| r.file == file).collect())
    }
}

/// Parse analyzer stdout. Empty output means no issues.
pub fn parse_records(stdout: &str) -> Result<Vec<AnalyzerRecord>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    match find_json::<Vec<AnalyzerRecord>>(stdout) {
        Ok(Some(records)) => Ok(records),
        Ok(None) => bail!("No JSON array found in analyzer output"),
        Err(e) => Err(e).context("Failed to parse analyzer records"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_records_tolerates_noise() {
        let out = "running checks...\n[{\"file\":\"a.rs\",\"line\":3,\"category\":\"security\",\"message\":\"unsafe\",\"severity\":\"error\"}]\n";
        let records = parse_records(out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 3);
    }

    #[test]
    fn test_parse_records_skips_log_prefixed_lines() {
        let out = "[INFO] scanning 12 files\n[WARN] cache cold\n[{\"file\":\"a.rs\",\"line\":7,\"category\":\"quality\",\"message\":\"m\"}]\n[INFO] done\n";
        let records = parse_records(out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 7);
    }

    #[test]
    fn test_parse_records_empty_output() {
        assert!(parse_records("  \n").unwrap().is_empty());
        assert!(parse_records("[]").unwrap().is_empty());
        assert!(parse_records("garbage").is_err());
    }

    #[tokio::test]
    async fn test_command_analyzer_filters_check_file() {
        let dir = tempdir().unwrap();
        let script = r#"echo '[{"file":"a.rs","line":1,"category":"quality","message":"m"},{"file":"b.rs","line":2,"category":"quality","message":"m"}]'"#;
        let analyzer = CommandAnalyzer::new(script, dir.path(), Duration::from_secs(5));

        assert_eq!(analyzer.scan().await.unwrap().len(), 2);
        let only_b = analyzer.check_file(Path::new("b.rs")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].file, PathBuf::from("b.rs"));
    }

    #[tokio::test]
    async fn test_command_analyzer_reports_project_relative_paths() {
        let dir = tempdir().unwrap();
        let script = r#"printf '[{"file":"%s/src/a.rs","line":1,"category":"quality","message":"m"},{"file":"./b.rs","line":2,"category":"quality","message":"m"}]' "$PIPELINE_PROJECT_DIR""#;
        let analyzer = CommandAnalyzer::new(script, dir.path(), Duration::from_secs(5));

        let files: Vec<PathBuf> = analyzer.scan().await.unwrap().into_iter().map(|r| r.file).collect();
        assert_eq!(files, vec![PathBuf::from("src/a.rs"), PathBuf::from("b.rs")]);
        assert_eq!(analyzer.check_file(Path::new("./src/a.rs")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_command_analyzer_nonzero_exit_with_records_is_ok() {
        let dir = tempdir().unwrap();
        let script = r#"echo '[{"file":"a.rs","line":1,"category":"quality","message":"m"}]'; exit 1"#;
        let analyzer = CommandAnalyzer::new(script, dir.path(), Duration::from_secs(5));
        assert_eq!(analyzer.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_command_analyzer_failure_surfaces_stderr() {
        let dir = tempdir().unwrap();
        let analyzer = CommandAnalyzer::new("echo boom >&2; exit 3", dir.path(), Duration::from_secs(5));
        let err = analyzer.scan().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
