//! Unified configuration for the remediation pipeline.
//!
//! Settings are read from `.pipeline/pipeline.toml` and layered
//! file → environment → CLI. Every field has a default, so an empty or
//! missing file yields a usable configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_cycles = 10
//! target_issues = 0
//! max_attempts = 2
//! log_level = "info"
//!
//! [analyzer]
//! command = "my-linter --json"
//! timeout_secs = 300
//!
//! [agent]
//! command = "fix-agent"
//! timeout_secs = 600
//! retry_backoff_ms = 500
//! max_backoff_ms = 30000
//!
//! [strategy]
//! window_size = 20
//! initial_batch_size = 4
//! max_batch_size = 16
//! base_validation_level = "standard"
//!
//! [validation]
//! max_size_delta_ratio = 0.25
//! min_size_delta_bytes = 256
//! max_changed_lines = 40
//!
//! [backups]
//! retention = 5
//!
//! [protection]
//! files = [".pipeline/pipeline.toml", "scripts/*.sh"]
//! check_interval_secs = 30
//! os_immutable = false
//!
//! [publish]
//! command = "scripts/open-pr.sh"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::fix::ValidationLevel;

pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

/// Run-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Remaining-issue count at which the publish gate opens.
    #[serde(default)]
    pub target_issues: usize,
    /// Attempts per task before it is permanently failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_cycles() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            target_issues: 0,
            max_attempts: default_max_attempts(),
            log_level: default_log_level(),
        }
    }
}

/// External static analyzer invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
}

fn default_analyzer_timeout() -> u64 {
    300
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_analyzer_timeout(),
        }
    }
}

/// External fixing agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    /// Base delay before a timed-out task is released for retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_agent_timeout() -> u64 {
    600
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_agent_timeout(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl AgentSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Exponential backoff for the given (1-based) attempt, capped at `max_backoff_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Bounds for the adaptive strategy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySection {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub base_validation_level: ValidationLevel,
}

fn default_window_size() -> usize {
    20
}

fn default_initial_batch_size() -> usize {
    4
}

fn default_max_batch_size() -> usize {
    16
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            initial_batch_size: default_initial_batch_size(),
            max_batch_size: default_max_batch_size(),
            base_validation_level: ValidationLevel::default(),
        }
    }
}

/// Thresholds for the layered post-fix validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "default_max_size_delta_ratio")]
    pub max_size_delta_ratio: f64,
    #[serde(default = "default_min_size_delta_bytes")]
    pub min_size_delta_bytes: usize,
    #[serde(default = "default_max_changed_lines")]
    pub max_changed_lines: usize,
}

fn default_max_size_delta_ratio() -> f64 {
    0.25
}

fn default_min_size_delta_bytes() -> usize {
    256
}

fn default_max_changed_lines() -> usize {
    40
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            max_size_delta_ratio: default_max_size_delta_ratio(),
            min_size_delta_bytes: default_min_size_delta_bytes(),
            max_changed_lines: default_max_changed_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupsSection {
    /// Snapshots kept per original file.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_retention() -> usize {
    5
}

impl Default for BackupsSection {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// Control files guarded by the integrity subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionSection {
    /// Glob patterns relative to the project directory.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Also set the OS immutable flag (`chattr +i`) where available.
    #[serde(default)]
    pub os_immutable: bool,
}

fn default_check_interval() -> u64 {
    30
}

impl Default for ProtectionSection {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            check_interval_secs: default_check_interval(),
            os_immutable: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishSection {
    #[serde(default)]
    pub command: Option<String>,
}

/// The complete pipeline.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub strategy: StrategySection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub backups: BackupsSection,
    #[serde(default)]
    pub protection: ProtectionSection,
    #[serde(default)]
    pub publish: PublishSection,
}

impl PipelineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    /// Load from `<pipeline_dir>/pipeline.toml`, or defaults if absent.
    pub fn load_or_default(pipeline_dir: &Path) -> Result<Self> {
        let config_path = pipeline_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides for the collaborator commands.
    pub fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("PIPELINE_ANALYZER_CMD") {
            self.analyzer.command = Some(cmd);
        }
        if let Ok(cmd) = std::env::var("PIPELINE_AGENT_CMD") {
            self.agent.command = Some(cmd);
        }
        if let Ok(cmd) = std::env::var("PIPELINE_PUBLISH_CMD") {
            self.publish.command = Some(cmd);
        }
        if let Ok(level) = std::env::var("PIPELINE_LOG_LEVEL") {
            self.pipeline.log_level = level;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_cycles == 0 {
            warnings.push("pipeline.max_cycles is 0: no fix cycle will ever run".to_string());
        }
        if self.pipeline.max_attempts == 0 {
            warnings.push("pipeline.max_attempts is 0: treated as 1".to_string());
        }
        if self.strategy.max_batch_size == 0 {
            warnings.push("strategy.max_batch_size is 0: treated as 1".to_string());
        }
        if self.strategy.initial_batch_size > self.strategy.max_batch_size {
            warnings.push(format!(
                "strategy.initial_batch_size ({}) exceeds max_batch_size ({}): clamped",
                self.strategy.initial_batch_size, self.strategy.max_batch_size
            ));
        }
        if self.strategy.window_size == 0 {
            warnings.push("strategy.window_size is 0: treated as 1".to_string());
        }
        if !(0.0..=10.0).contains(&self.validation.max_size_delta_ratio) {
            warnings.push(format!(
                "validation.max_size_delta_ratio {} is outside 0.0..=10.0",
                self.validation.max_size_delta_ratio
            ));
        }
        if self.backups.retention == 0 {
            warnings.push(
                "backups.retention is 0: the just-created backup is always kept".to_string(),
            );
        }
        if self.analyzer.command.is_none() {
            warnings.push("analyzer.command is not set".to_string());
        }
        if self.agent.command.is_none() {
            warnings.push("agent.command is not set".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = PipelineToml::parse("").unwrap();
        assert_eq!(cfg.pipeline.max_cycles, 10);
        assert_eq!(cfg.pipeline.target_issues, 0);
        assert_eq!(cfg.pipeline.max_attempts, 2);
        assert_eq!(cfg.strategy.window_size, 20);
        assert_eq!(cfg.backups.retention, 5);
        assert_eq!(cfg.strategy.base_validation_level, ValidationLevel::Standard);
        assert!(cfg.protection.files.is_empty());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg = PipelineToml::parse(
            r#"
[pipeline]
max_cycles = 3

[strategy]
max_batch_size = 8
base_validation_level = "strict"
"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.max_cycles, 3);
        assert_eq!(cfg.pipeline.max_attempts, 2);
        assert_eq!(cfg.strategy.max_batch_size, 8);
        assert_eq!(cfg.strategy.initial_batch_size, 4);
        assert_eq!(cfg.strategy.base_validation_level, ValidationLevel::Strict);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let result = PipelineToml::parse("[pipeline\nmax_cycles = ");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse pipeline.toml")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let cfg = PipelineToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.pipeline.max_cycles, 10);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut cfg = PipelineToml::default();
        cfg.analyzer.command = Some("lint --json".to_string());
        cfg.protection.files = vec!["scripts/*.sh".to_string()];
        let path = dir.path().join(CONFIG_FILE_NAME);
        cfg.save(&path).unwrap();

        let loaded = PipelineToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.analyzer.command.as_deref(), Some("lint --json"));
        assert_eq!(loaded.protection.files, vec!["scripts/*.sh".to_string()]);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let agent = AgentSection {
            retry_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..AgentSection::default()
        };
        assert_eq!(agent.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(agent.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(agent.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(agent.backoff_for_attempt(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validate_flags_inverted_batch_bounds() {
        let mut cfg = PipelineToml::default();
        cfg.analyzer.command = Some("a".into());
        cfg.agent.command = Some("b".into());
        assert!(cfg.validate().is_empty());

        cfg.strategy.initial_batch_size = 32;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("initial_batch_size"));
    }
}
