//! Content-addressed snapshot store.
//!
//! File contents live under `objects/<sha256>`; `index.json` maps each
//! original path to its append-only list of `BackupRecord`s, newest last.
//! Pruning keeps the last `retention` records per file and deletes an object
//! only once no record references it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::PipelineError;
use crate::util::{sha256_hex, write_atomic};

const INDEX_FILE: &str = "index.json";
const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Permission bits at snapshot time, re-applied on restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

type Index = BTreeMap<PathBuf, Vec<BackupRecord>>;

pub struct BackupStore {
    root: PathBuf,
    retention: usize,
    index: Mutex<Index>,
}

impl BackupStore {
    /// Open (or create) a store rooted at `root`, loading any existing index.
    pub fn open(root: impl Into<PathBuf>, retention: usize) -> Result<Self, PipelineError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(OBJECTS_DIR)).map_err(|source| {
            PipelineError::BackupStoreUnwritable {
                path: root.clone(),
                source,
            }
        })?;

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path).map_err(|source| {
                PipelineError::BackupStoreUnwritable {
                    path: index_path.clone(),
                    source,
                }
            })?;
            serde_json::from_str(&content).map_err(|e| {
                PipelineError::Other(anyhow::anyhow!(
                    "Corrupt backup index at {}: {}",
                    index_path.display(),
                    e
                ))
            })?
        } else {
            Index::new()
        };

        Ok(Self {
            root,
            retention: retention.max(1),
            index: Mutex::new(index),
        })
    }

    /// Snapshot `original` and record its content hash.
    pub fn snapshot(&self, original: &Path) -> Result<BackupRecord, PipelineError> {
        let bytes = std::fs::read(original).map_err(|e| {
            PipelineError::Other(anyhow::anyhow!(
                "Failed to read {} for backup: {}",
                original.display(),
                e
            ))
        })?;
        let mode = std::fs::metadata(original).ok().and_then(|m| file_mode(&m));
        let content_hash = sha256_hex(&bytes);
        let backup_path = self.root.join(OBJECTS_DIR).join(&content_hash);

        if !backup_path.exists() {
            write_atomic(&backup_path, &bytes).map_err(|e| self.unwritable(&backup_path, e))?;
        }

        let record = BackupRecord {
            original_path: original.to_path_buf(),
            backup_path,
            content_hash,
            timestamp: Utc::now(),
            mode,
        };

        let mut index = self.lock_index()?;
        index
            .entry(record.original_path.clone())
            .or_default()
            .push(record.clone());
        self.prune_locked(&mut index, original);
        self.save_locked(&index)?;

        tracing::debug!(
            file = %original.display(),
            hash = %&record.content_hash[..12],
            "snapshot taken"
        );
        Ok(record)
    }

    /// Restore `record` byte-for-byte over its original path, then verify the
    /// restored file hashes to the recorded `content_hash`.
    pub fn restore(&self, record: &BackupRecord) -> Result<(), PipelineError> {
        let bytes = std::fs::read(&record.backup_path).map_err(|e| {
            PipelineError::Other(anyhow::anyhow!(
                "Backup object {} unreadable: {}",
                record.backup_path.display(),
                e
            ))
        })?;
        let stored_hash = sha256_hex(&bytes);
        if stored_hash != record.content_hash {
            return Err(PipelineError::IntegrityViolation {
                path: record.backup_path.clone(),
                expected: record.content_hash.clone(),
                actual: stored_hash,
            });
        }

        write_atomic(&record.original_path, &bytes).map_err(PipelineError::Other)?;
        if let Some(mode) = record.mode {
            set_mode(&record.original_path, mode).map_err(|e| {
                PipelineError::Other(anyhow::anyhow!(
                    "Failed to restore permissions on {}: {}",
                    record.original_path.display(),
                    e
                ))
            })?;
        }

        let restored = crate::util::hash_file(&record.original_path).map_err(|e| {
            PipelineError::Other(anyhow::anyhow!(
                "Failed to re-read {} after restore: {}",
                record.original_path.display(),
                e
            ))
        })?;
        if restored != record.content_hash {
            return Err(PipelineError::IntegrityViolation {
                path: record.original_path.clone(),
                expected: record.content_hash.clone(),
                actual: restored,
            });
        }

        tracing::info!(file = %record.original_path.display(), "restored from backup");
        Ok(())
    }

    /// All records for `original`, oldest first.
    pub fn records_for(&self, original: &Path) -> Vec<BackupRecord> {
        self.index
            .lock()
            .map(|index| index.get(original).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn latest(&self, original: &Path) -> Option<BackupRecord> {
        self.records_for(original).pop()
    }

    /// Most recent record for `original` whose content matches `hash`.
    pub fn latest_matching(&self, original: &Path, hash: &str) -> Option<BackupRecord> {
        self.records_for(original)
            .into_iter()
            .rev()
            .find(|r| r.content_hash == hash && r.backup_path.exists())
    }

    /// Re-insert a record recovered from a checkpoint log, if not already indexed.
    pub fn register(&self, record: BackupRecord) -> Result<(), PipelineError> {
        let mut index = self.lock_index()?;
        let records = index.entry(record.original_path.clone()).or_default();
        if records.iter().any(|r| r == &record) {
            return Ok(());
        }
        records.push(record);
        records.sort_by_key(|r| r.timestamp);
        self.save_locked(&index)
    }

    fn prune_locked(&self, index: &mut Index, original: &Path) {
        let Some(records) = index.get_mut(original) else {
            return;
        };
        if records.len() <= self.retention {
            return;
        }
        let excess = records.len() - self.retention;
        let dropped: Vec<BackupRecord> = records.drain(..excess).collect();

        for record in dropped {
            let still_referenced = index
                .values()
                .flatten()
                .any(|r| r.backup_path == record.backup_path);
            if !still_referenced {
                if let Err(e) = std::fs::remove_file(&record.backup_path) {
                    tracing::warn!(path = %record.backup_path.display(), "failed to prune backup: {}", e);
                }
            }
        }
    }

    fn save_locked(&self, index: &Index) -> Result<(), PipelineError> {
        let path = self.root.join(INDEX_FILE);
        let json = serde_json::to_vec_pretty(index)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Failed to serialize backup index: {}", e)))?;
        write_atomic(&path, &json).map_err(|e| self.unwritable(&path, e))
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, Index>, PipelineError> {
        self.index
            .lock()
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("Backup index lock poisoned")))
    }

    fn unwritable(&self, path: &Path, err: anyhow::Error) -> PipelineError {
        let source = err
            .chain()
            .find_map(|e| e.downcast_ref::<std::io::Error>())
            .map(|io| std::io::Error::new(io.kind(), io.to_string()))
            .unwrap_or_else(|| std::io::Error::other(err.to_string()));
        PipelineError::BackupStoreUnwritable {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
