//! Append-only write-ahead checkpoint log.
//!
//! One JSON object per line, each fsync'd before `append` returns. A torn
//! final line (crash mid-write) is truncated on open; corruption anywhere
//! else is an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backup::BackupRecord;
use crate::errors::PipelineError;
use crate::queue::{SkipReason, TaskStatus};
use crate::session::SessionPhase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointRecord {
    PhaseChanged {
        phase: SessionPhase,
        cycle: u32,
    },
    /// Written after the pre-fix snapshot and before the agent runs.
    Dispatched {
        task_id: String,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<BackupRecord>,
    },
    Completed {
        task_id: String,
        status: TaskStatus,
        attempt_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
    },
    /// `queue.json` now reflects every entry up to and including `cursor`.
    QueueSnapshot {
        cursor: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: CheckpointRecord,
}

pub struct CheckpointLog {
    path: PathBuf,
    file: Mutex<File>,
    next_seq: AtomicU64,
}

impl CheckpointLog {
    /// Open for appending, returning the entries already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<CheckpointEntry>), PipelineError> {
        let path = path.into();
        let entries = if path.exists() {
            read_and_repair(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PipelineError::CheckpointWrite {
                path: path.clone(),
                source,
            })?;

        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        Ok((
            Self {
                path,
                file: Mutex::new(file),
                next_seq: AtomicU64::new(next_seq),
            },
            entries,
        ))
    }

    /// Durably append `record`, returning its sequence number.
    pub fn append(&self, record: CheckpointRecord) -> Result<u64, PipelineError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("Checkpoint log lock poisoned")))?;

        let seq = self.next_seq.load(Ordering::SeqCst);
        let entry = CheckpointEntry {
            seq,
            at: Utc::now(),
            record,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Failed to encode checkpoint: {}", e)))?;

        let io = |source| PipelineError::CheckpointWrite {
            path: self.path.clone(),
            source,
        };
        writeln!(file, "{}", line).map_err(io)?;
        file.sync_all().map_err(io)?;

        self.next_seq.store(seq + 1, Ordering::SeqCst);
        Ok(seq)
    }

    /// Sequence number of the last appended entry, 0 if the log is empty.
    pub fn cursor(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read entries without opening for write.
    pub fn read(path: &Path) -> Result<Vec<CheckpointEntry>, PipelineError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| read_error(path, e))?;
        let mut entries = Vec::new();
        let mut lines = BufReader::new(file).lines().peekable();
        while let Some(line) = lines.next() {
            let line = line.map_err(|e| read_error(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // Torn tail: ignore for readers.
                Err(_) if lines.peek().is_none() => break,
                Err(e) => return Err(corrupt(path, entries.len() + 1, e)),
            }
        }
        Ok(entries)
    }
}

fn read_and_repair(path: &Path) -> Result<Vec<CheckpointEntry>, PipelineError> {
    let content = std::fs::read_to_string(path).map_err(|e| read_error(path, e))?;
    let mut entries = Vec::new();
    let mut good_len = 0usize;
    let mut offset = 0usize;
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    for (idx, raw) in lines.iter().enumerate() {
        offset += raw.len();
        let line = raw.trim();
        if line.is_empty() {
            good_len = offset;
            continue;
        }
        let is_last = idx + 1 == lines.len();
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) if raw.ends_with('\n') => {
                entries.push(entry);
                good_len = offset;
            }
            Err(e) if !is_last => return Err(corrupt(path, idx + 1, e)),
            // Unterminated or unparsable final line.
            _ => {
                tracing::warn!(path = %path.display(), "truncating torn checkpoint tail");
                let truncate = || -> std::io::Result<()> {
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(good_len as u64)?;
                    file.sync_all()
                };
                truncate().map_err(|source| PipelineError::CheckpointWrite {
                    path: path.to_path_buf(),
                    source,
                })?;
                break;
            }
        }
    }
    Ok(entries)
}

fn read_error(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!(
        "Failed to read checkpoint log {}: {}",
        path.display(),
        e
    ))
}

fn corrupt(path: &Path, line: usize, e: serde_json::Error) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!(
        "Corrupt checkpoint log {} at line {}: {}",
        path.display(),
        line,
        e
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn completed(id: &str) -> CheckpointRecord {
        CheckpointRecord::Completed {
            task_id: id.into(),
            status: TaskStatus::Applied,
            attempt_count: 1,
            reason: None,
            skip_reason: None,
        }
    }

    #[test]
    fn test_append_assigns_increasing_seq_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        let (log, existing) = CheckpointLog::open(&path).unwrap();
        assert!(existing.is_empty());
        assert_eq!(log.cursor(), 0);

        assert_eq!(log.append(completed("a")).unwrap(), 1);
        assert_eq!(
            log.append(CheckpointRecord::PhaseChanged {
                phase: SessionPhase::Fix,
                cycle: 1
            })
            .unwrap(),
            2
        );
        drop(log);

        let (log, entries) = CheckpointLog::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record, completed("a"));
        assert_eq!(log.append(completed("b")).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        {
            let (log, _) = CheckpointLog::open(&path).unwrap();
            log.append(completed("a")).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":2,\"at\":\"2026-").unwrap();
        drop(f);

        assert_eq!(CheckpointLog::read(&path).unwrap().len(), 1);
        let (log, entries) = CheckpointLog::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.append(completed("b")).unwrap(), 2);
        drop(log);
        assert_eq!(CheckpointLog::read(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        {
            let (log, _) = CheckpointLog::open(&path).unwrap();
            log.append(completed("a")).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("not json\n{}", content)).unwrap();
        assert!(CheckpointLog::open(&path).is_err());
    }

    #[test]
    fn test_record_wire_format_is_tagged() {
        let json = serde_json::to_string(&CheckpointEntry {
            seq: 7,
            at: Utc::now(),
            record: CheckpointRecord::QueueSnapshot { cursor: 6 },
        })
        .unwrap();
        assert!(json.contains("\"type\":\"queue_snapshot\""));
        assert!(json.contains("\"seq\":7"));
    }
}
