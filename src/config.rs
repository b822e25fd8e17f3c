use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::pipeline_config::PipelineToml;

pub const PIPELINE_DIR: &str = ".pipeline";

/// Runtime configuration for the pipeline.
///
/// Bridges the parsed `PipelineToml` with the paths the orchestrator needs
/// and holds the CLI overrides that sit on top of file and environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub pipeline_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub protection_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_file: PathBuf,
    pub verbose: bool,
    pub settings: PipelineToml,
}

impl Config {
    /// Resolve the project directory and load `.pipeline/pipeline.toml` plus env overrides.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let pipeline_dir = project_dir.join(PIPELINE_DIR);
        let mut settings = PipelineToml::load_or_default(&pipeline_dir)?;
        settings.apply_env();
        Ok(Self::with_settings(project_dir, verbose, settings))
    }

    /// Build a config from already-resolved settings (no file or env access).
    pub fn with_settings(project_dir: PathBuf, verbose: bool, settings: PipelineToml) -> Self {
        let pipeline_dir = project_dir.join(PIPELINE_DIR);
        Self {
            sessions_dir: pipeline_dir.join("sessions"),
            protection_dir: pipeline_dir.join("protection"),
            log_dir: pipeline_dir.join("logs"),
            lock_file: pipeline_dir.join("pipeline.lock"),
            pipeline_dir,
            project_dir,
            verbose,
            settings,
        }
    }

    /// CLI overrides for the run loop.
    pub fn with_run_overrides(mut self, max_cycles: Option<u32>, target_issues: Option<usize>) -> Self {
        if let Some(n) = max_cycles {
            self.settings.pipeline.max_cycles = n;
        }
        if let Some(k) = target_issues {
            self.settings.pipeline.target_issues = k;
        }
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.sessions_dir)
            .context("Failed to create sessions directory")?;
        std::fs::create_dir_all(&self.protection_dir)
            .context("Failed to create protection directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Path relative to the project root, for display and for analyzer records.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_dir).unwrap_or(path)
    }

    pub fn is_initialized(&self) -> bool {
        self.pipeline_dir.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_live_under_pipeline_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.pipeline_dir, root.join(".pipeline"));
        assert_eq!(config.sessions_dir, root.join(".pipeline/sessions"));
        assert_eq!(config.protection_dir, root.join(".pipeline/protection"));
        assert_eq!(config.lock_file, root.join(".pipeline/pipeline.lock"));
        assert_eq!(config.session_dir("abc"), root.join(".pipeline/sessions/abc"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert!(!config.is_initialized());
        config.ensure_directories().unwrap();
        assert!(config.is_initialized());
        assert!(config.sessions_dir.exists());
        assert!(config.protection_dir.exists());
        assert!(config.log_dir.exists());
    }

    #[test]
    fn test_run_overrides_take_precedence() {
        let dir = tempdir().unwrap();
        let config = Config::with_settings(dir.path().to_path_buf(), false, PipelineToml::default())
            .with_run_overrides(Some(3), Some(2));
        assert_eq!(config.settings.pipeline.max_cycles, 3);
        assert_eq!(config.settings.pipeline.target_issues, 2);

        let untouched = config.with_run_overrides(None, None);
        assert_eq!(untouched.settings.pipeline.max_cycles, 3);
    }

    #[test]
    fn test_relative_strips_project_root() {
        let dir = tempdir().unwrap();
        let config = Config::with_settings(dir.path().to_path_buf(), false, PipelineToml::default());
        let abs = dir.path().join("src/main.rs");
        assert_eq!(config.relative(&abs), Path::new("src/main.rs"));
    }

    #[test]
    fn test_new_fails_for_missing_dir() {
        let result = Config::new(PathBuf::from("/definitely/not/here"), false);
        assert!(result.is_err());
    }
}
