//! Integrity guard for the pipeline's own control files.
//!
//! Each protected file has a `ProtectionRecord` holding its last-known-good
//! hash and a verified snapshot in `protection/backups/`. `check` recomputes
//! hashes and reports drift. Restoring or unprotecting requires the
//! administrative credential; a mismatch changes nothing and is logged to
//! `protection/security.log`.

pub mod audit;
pub mod credential;
pub mod immutable;
pub mod monitor;

pub use audit::{SecurityEvent, SecurityEventKind, SecurityLog};
pub use credential::CredentialStore;
pub use monitor::IntegrityMonitor;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::backup::BackupStore;
use crate::errors::PipelineError;
use crate::fix::FileLocks;
use crate::util::{hash_file, write_atomic};

const RECORDS_FILE: &str = "records.json";
const BACKUPS_DIR: &str = "backups";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    /// Hash-checked and carrying the OS immutable flag.
    Immutable,
    HashOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionRecord {
    /// Relative to the project directory.
    pub protected_path: PathBuf,
    pub content_hash: String,
    pub mode: ProtectionMode,
    pub last_verified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectionState {
    Intact,
    Drifted { actual: String },
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionStatus {
    pub record: ProtectionRecord,
    pub state: ProtectionState,
}

impl ProtectionStatus {
    pub fn is_violation(&self) -> bool {
        self.state != ProtectionState::Intact
    }

    pub fn into_error(self, project_dir: &Path) -> PipelineError {
        let actual = match self.state {
            ProtectionState::Drifted { actual } => actual,
            ProtectionState::Missing => "<missing>".to_string(),
            ProtectionState::Intact => self.record.content_hash.clone(),
        };
        PipelineError::IntegrityViolation {
            path: project_dir.join(&self.record.protected_path),
            expected: self.record.content_hash,
            actual,
        }
    }
}

type Records = BTreeMap<PathBuf, ProtectionRecord>;

pub struct IntegrityGuard {
    project_dir: PathBuf,
    records_path: PathBuf,
    records: Mutex<Records>,
    backups: BackupStore,
    credentials: CredentialStore,
    log: SecurityLog,
    locks: FileLocks,
    os_immutable: bool,
    /// Paths already reported as drifted, so the monitor alerts once per drift.
    alerted: Mutex<HashSet<PathBuf>>,
}

impl IntegrityGuard {
    pub fn open(
        project_dir: impl Into<PathBuf>,
        protection_dir: &Path,
        locks: FileLocks,
        os_immutable: bool,
        retention: usize,
    ) -> Result<Self, PipelineError> {
        let project_dir = project_dir.into();
        std::fs::create_dir_all(protection_dir).context("Failed to create protection directory")?;
        let records_path = protection_dir.join(RECORDS_FILE);
        let records: Records = if records_path.exists() {
            let content = std::fs::read_to_string(&records_path)
                .with_context(|| format!("Failed to read {}", records_path.display()))?;
            serde_json::from_str(&content).context("Failed to parse protection records")?
        } else {
            Records::new()
        };

        Ok(Self {
            backups: BackupStore::open(protection_dir.join(BACKUPS_DIR), retention)?,
            credentials: CredentialStore::new(protection_dir),
            log: SecurityLog::new(protection_dir),
            project_dir,
            records_path,
            records: Mutex::new(records),
            locks,
            os_immutable,
            alerted: Mutex::new(HashSet::new()),
        })
    }

    pub fn security_log(&self) -> &SecurityLog {
        &self.log
    }

    pub fn has_credential(&self) -> bool {
        self.credentials.is_set()
    }

    pub fn records(&self) -> Vec<ProtectionRecord> {
        self.lock_records().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    /// Protect every file matching `patterns` (globs relative to the project).
    ///
    /// The first setup stores `credential` as the administrative reference;
    /// later calls must present it.
    pub fn setup(&self, patterns: &[String], credential: Option<&str>) -> Result<Vec<ProtectionRecord>, PipelineError> {
        if self.credentials.is_set() {
            self.authorize("setup", credential)?;
        } else {
            let Some(secret) = credential.filter(|c| !c.is_empty()) else {
                return Err(self.reject("setup", "no credential configured and none supplied"));
            };
            self.credentials.set(secret)?;
            self.audit(SecurityEvent::new(SecurityEventKind::CredentialSet, "administrative credential configured"));
        }

        let mut protected = Vec::new();
        for path in self.expand(patterns)? {
            let abs = self.project_dir.join(&path);
            let backup = self.backups.snapshot(&abs)?;
            let mode = if self.os_immutable && immutable::set_immutable(&abs, true) {
                ProtectionMode::Immutable
            } else {
                ProtectionMode::HashOnly
            };
            let record = ProtectionRecord {
                protected_path: path.clone(),
                content_hash: backup.content_hash,
                mode,
                last_verified: Utc::now(),
            };
            self.lock_records().insert(path.clone(), record.clone());
            self.clear_alert(&path);
            tracing::info!(file = %path.display(), mode = ?mode, "file protected");
            self.audit(SecurityEvent::new(SecurityEventKind::Protected, format!("{:?}", mode)).with_path(&path));
            protected.push(record);
        }
        self.save()?;
        Ok(protected)
    }

    /// Current state of every protected file. Read-only.
    pub fn status(&self) -> Vec<ProtectionStatus> {
        self.records()
            .into_iter()
            .map(|record| {
                let state = match hash_file(&self.project_dir.join(&record.protected_path)) {
                    Ok(actual) if actual == record.content_hash => ProtectionState::Intact,
                    Ok(actual) => ProtectionState::Drifted { actual },
                    Err(_) => ProtectionState::Missing,
                };
                ProtectionStatus { record, state }
            })
            .collect()
    }

    /// Verify all protected files and return the violations.
    ///
    /// Intact files get `last_verified` refreshed. Each new drift is logged once.
    pub fn check(&self) -> Result<Vec<ProtectionStatus>, PipelineError> {
        let statuses = self.status();
        let now = Utc::now();
        let mut violations = Vec::new();

        {
            let mut records = self.lock_records();
            for status in &statuses {
                if !status.is_violation()
                    && let Some(record) = records.get_mut(&status.record.protected_path)
                {
                    record.last_verified = now;
                }
            }
        }

        for status in statuses {
            let path = status.record.protected_path.clone();
            if !status.is_violation() {
                self.clear_alert(&path);
                continue;
            }
            let newly = self
                .alerted
                .lock()
                .map(|mut set| set.insert(path.clone()))
                .unwrap_or(true);
            if newly {
                let detail = match &status.state {
                    ProtectionState::Drifted { actual } => {
                        format!("expected {}, found {}", status.record.content_hash, actual)
                    }
                    _ => "file missing".to_string(),
                };
                tracing::error!(file = %path.display(), "integrity violation: {}", detail);
                self.audit(SecurityEvent::new(SecurityEventKind::IntegrityViolation, detail).with_path(&path));
            }
            violations.push(status);
        }

        self.save()?;
        Ok(violations)
    }

    /// Restore drifted files (or just `file`) from their verified snapshots.
    pub async fn restore(&self, file: Option<&Path>, credential: Option<&str>) -> Result<Vec<PathBuf>, PipelineError> {
        self.authorize("restore", credential)?;

        let targets: Vec<ProtectionRecord> = match file {
            Some(path) => {
                let rel = self.relative(path);
                let Some(record) = self.lock_records().get(&rel).cloned() else {
                    return Err(PipelineError::Other(anyhow::anyhow!(
                        "{} is not protected",
                        rel.display()
                    )));
                };
                vec![record]
            }
            None => self
                .status()
                .into_iter()
                .filter(|s| s.is_violation())
                .map(|s| s.record)
                .collect(),
        };

        let mut restored = Vec::new();
        for record in targets {
            let abs = self.project_dir.join(&record.protected_path);
            let _guard = self.locks.acquire(&abs).await;

            let Some(backup) = self.backups.latest_matching(&abs, &record.content_hash) else {
                return Err(PipelineError::Other(anyhow::anyhow!(
                    "No verified backup for {}",
                    record.protected_path.display()
                )));
            };
            if record.mode == ProtectionMode::Immutable {
                immutable::set_immutable(&abs, false);
            }
            self.backups.restore(&backup)?;
            if record.mode == ProtectionMode::Immutable {
                immutable::set_immutable(&abs, true);
            }

            if let Some(stored) = self.lock_records().get_mut(&record.protected_path) {
                stored.last_verified = Utc::now();
            }
            self.clear_alert(&record.protected_path);
            tracing::info!(file = %record.protected_path.display(), "protected file restored");
            self.audit(
                SecurityEvent::new(SecurityEventKind::Restored, "restored from verified backup")
                    .with_path(&record.protected_path),
            );
            restored.push(record.protected_path);
        }
        self.save()?;
        Ok(restored)
    }

    /// Stop protecting `files` (all when empty).
    pub fn unprotect(&self, files: &[PathBuf], credential: Option<&str>) -> Result<Vec<PathBuf>, PipelineError> {
        self.authorize("unprotect", credential)?;

        let wanted: HashSet<PathBuf> = files.iter().map(|f| self.relative(f)).collect();
        let removed: Vec<ProtectionRecord> = {
            let mut records = self.lock_records();
            let keys: Vec<PathBuf> = records
                .keys()
                .filter(|k| wanted.is_empty() || wanted.contains(*k))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| records.remove(k)).collect()
        };

        for record in &removed {
            if record.mode == ProtectionMode::Immutable {
                immutable::set_immutable(&self.project_dir.join(&record.protected_path), false);
            }
            self.clear_alert(&record.protected_path);
            tracing::info!(file = %record.protected_path.display(), "protection removed");
            self.audit(
                SecurityEvent::new(SecurityEventKind::Unprotected, "protection removed")
                    .with_path(&record.protected_path),
            );
        }
        self.save()?;
        Ok(removed.into_iter().map(|r| r.protected_path).collect())
    }

    fn authorize(&self, operation: &str, credential: Option<&str>) -> Result<(), PipelineError> {
        let Some(secret) = credential else {
            return Err(self.reject(operation, "no credential supplied"));
        };
        if self.credentials.verify(secret)? {
            Ok(())
        } else {
            Err(self.reject(operation, "credential mismatch"))
        }
    }

    fn reject(&self, operation: &str, detail: &str) -> PipelineError {
        tracing::warn!(operation, "authentication failure: {}", detail);
        self.audit(SecurityEvent::new(SecurityEventKind::AuthenticationFailure, detail).with_operation(operation));
        PipelineError::AuthenticationFailure {
            operation: operation.to_string(),
        }
    }

    fn audit(&self, event: SecurityEvent) {
        if let Err(e) = self.log.record(&event) {
            tracing::error!("failed to write security log: {:#}", e);
        }
    }

    fn expand(&self, patterns: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
        let mut paths = Vec::new();
        for pattern in patterns {
            let full = self.project_dir.join(pattern);
            let matches = glob::glob(&full.to_string_lossy())
                .with_context(|| format!("Invalid protection pattern: {}", pattern))?;
            let before = paths.len();
            for entry in matches.flatten() {
                if entry.is_file() {
                    let rel = self.relative(&entry);
                    if !paths.contains(&rel) {
                        paths.push(rel);
                    }
                }
            }
            if paths.len() == before {
                tracing::warn!(pattern = %pattern, "protection pattern matched no files");
            }
        }
        Ok(paths)
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.project_dir)
            .unwrap_or(path)
            .to_path_buf()
    }

    fn clear_alert(&self, path: &Path) {
        if let Ok(mut set) = self.alerted.lock() {
            set.remove(path);
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) -> Result<(), PipelineError> {
        let json = {
            let records = self.lock_records();
            serde_json::to_vec_pretty(&*records).context("Failed to serialize protection records")?
        };
        write_atomic(&self.records_path, &json)?;
        Ok(())
    }
}
