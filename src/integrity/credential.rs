use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::util::{sha256_hex, write_atomic};

pub const CREDENTIAL_FILE: &str = "credential.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    salt: String,
    hash: String,
    created_at: DateTime<Utc>,
}

/// Salted SHA-256 reference for the administrative credential.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(protection_dir: &Path) -> Self {
        Self {
            path: protection_dir.join(CREDENTIAL_FILE),
        }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Store the reference hash for `credential`. Fails if one already exists.
    pub fn set(&self, credential: &str) -> Result<()> {
        if self.is_set() {
            anyhow::bail!("A credential is already configured at {}", self.path.display());
        }
        if credential.is_empty() {
            anyhow::bail!("Credential must not be empty");
        }
        let salt = Uuid::new_v4().simple().to_string();
        let stored = StoredCredential {
            hash: salted_hash(&salt, credential),
            salt,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&stored).context("Failed to serialize credential")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create protection directory")?;
        }
        write_atomic(&self.path, &json)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }

    /// Whether `credential` matches the stored reference. False when none is set.
    pub fn verify(&self, credential: &str) -> Result<bool> {
        if !self.is_set() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let stored: StoredCredential =
            serde_json::from_str(&content).context("Failed to parse credential file")?;
        let candidate = salted_hash(&stored.salt, credential);
        Ok(candidate.as_bytes().ct_eq(stored.hash.as_bytes()).into())
    }
}

fn salted_hash(salt: &str, credential: &str) -> String {
    sha256_hex(format!("{}:{}", salt, credential).as_bytes())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credential file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_and_verify() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(!store.is_set());
        assert!(!store.verify("anything").unwrap());

        store.set("s3cret").unwrap();
        assert!(store.verify("s3cret").unwrap());
        assert!(!store.verify("S3cret").unwrap());
        assert!(!store.verify("").unwrap());
    }

    #[test]
    fn test_plaintext_never_stored() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("hunter2").unwrap();
        let raw = std::fs::read_to_string(dir.path().join(CREDENTIAL_FILE)).unwrap();
        assert!(!raw.contains("hunter2"));
    }

    #[test]
    fn test_set_twice_fails() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("a").unwrap();
        assert!(store.set("b").is_err());
        assert!(store.verify("a").unwrap());
    }

    #[test]
    fn test_truncated_reference_never_matches() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("s3cret").unwrap();

        let path = dir.path().join(CREDENTIAL_FILE);
        let mut stored: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let short = stored["hash"].as_str().unwrap()[..32].to_string();
        stored["hash"] = serde_json::Value::String(short);
        std::fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();

        assert!(!store.verify("s3cret").unwrap());
    }
}
