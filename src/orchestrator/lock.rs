use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::PipelineError;

/// Exclusive advisory lock on `.pipeline/pipeline.lock`, held for a whole run.
///
/// Released when dropped (or when the process exits).
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Other(anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Failed to open {}: {}", path.display(), e)))?;

        if file.try_lock_exclusive().is_err() {
            return Err(PipelineError::InstanceLocked {
                path: path.to_path_buf(),
            });
        }

        // Holder pid, for humans only.
        file.set_len(0).ok();
        let _ = writeln!(file, "{}", std::process::id());
        tracing::debug!(path = %path.display(), "instance lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_instance_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".pipeline/pipeline.lock");
        let held = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(PipelineError::InstanceLocked { .. })
        ));
        drop(held);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
