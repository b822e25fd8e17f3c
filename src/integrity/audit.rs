use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SECURITY_LOG_FILE: &str = "security.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    CredentialSet,
    Protected,
    IntegrityViolation,
    AuthenticationFailure,
    Restored,
    Unprotected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            path: None,
            operation: None,
            detail: detail.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// Append-only JSON-lines log of security-relevant events.
pub struct SecurityLog {
    path: PathBuf,
}

impl SecurityLog {
    pub fn new(protection_dir: &Path) -> Self {
        Self {
            path: protection_dir.join(SECURITY_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &SecurityEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create protection directory")?;
        }
        let line = serde_json::to_string(event).context("Failed to serialize security event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open security log")?;
        writeln!(file, "{}", line).context("Failed to write security event")?;
        file.sync_all().context("Failed to flush security log")?;
        Ok(())
    }

    pub fn events(&self) -> Result<Vec<SecurityEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read security log")?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
