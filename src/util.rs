//! Shared helpers: content hashing, JSON extraction from noisy tool output,
//! and durable file writes.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 of a file's current contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Lexically normalize `path`: drop `.` components and fold `..` into its
/// parent where one exists. Does not touch the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(Component::ParentDir),
            },
            other => out.push(other),
        }
    }
    out
}

/// Deserialize the first `T` found at one of `text`'s `[` or `{` positions.
///
/// Candidates that fail to parse are skipped, so bracketed log prefixes like
/// `[INFO]` ahead of the payload are tolerated; trailing text is ignored.
/// `Ok(None)` means there was no candidate; `Err` is the last parse error.
pub fn find_json<T: DeserializeOwned>(text: &str) -> Result<Option<T>, serde_json::Error> {
    let mut last_err = None;
    for (start, _) in text.match_indices(['[', '{']) {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => return Ok(Some(value)),
            Some(Err(e)) => last_err = Some(e),
            None => {}
        }
    }
    last_err.map_or(Ok(None), Err)
}

/// Write `content` to `path` via a sibling temp file, fsync, then rename.
/// An existing target keeps its permissions.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Ok(existing) = std::fs::metadata(path) {
            file.set_permissions(existing.permissions())
                .with_context(|| format!("Failed to set permissions on {}", tmp.display()))?;
        }
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}
