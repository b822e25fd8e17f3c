//! `pipeline init`: create the `.pipeline/` directory in a project.
//!
//! ```text
//! .pipeline/
//! ├── pipeline.toml    # Settings (defaults written on first init)
//! ├── sessions/        # One directory per session
//! ├── protection/      # Protection records, credential, security log
//! └── logs/            # JSON structured log
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::PIPELINE_DIR;
use crate::pipeline_config::{CONFIG_FILE_NAME, PipelineToml};

const SUBDIRS: &[&str] = &["sessions", "protection", "logs"];

#[derive(Debug)]
pub struct InitResult {
    pub pipeline_dir: PathBuf,
    /// False if `.pipeline/` already existed.
    pub created: bool,
    /// Whether a default `pipeline.toml` was written.
    pub wrote_config: bool,
}

/// Create or complete the `.pipeline/` structure. Existing files are kept.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let pipeline_dir = project_dir.join(PIPELINE_DIR);
    let created = !pipeline_dir.exists();

    for sub in SUBDIRS {
        let dir = pipeline_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_path = pipeline_dir.join(CONFIG_FILE_NAME);
    let wrote_config = !config_path.exists();
    if wrote_config {
        PipelineToml::default().save(&config_path)?;
    }

    Ok(InitResult {
        pipeline_dir,
        created,
        wrote_config,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(PIPELINE_DIR).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_structure() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.created);
        assert!(result.wrote_config);
        assert_eq!(result.pipeline_dir, dir.path().join(".pipeline"));
        for sub in SUBDIRS {
            assert!(result.pipeline_dir.join(sub).is_dir());
        }
        let cfg = PipelineToml::load(&result.pipeline_dir.join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(cfg.pipeline.max_cycles, 10);
    }

    #[test]
    fn test_init_project_keeps_existing_config() {
        let dir = tempdir().unwrap();
        let pipeline_dir = dir.path().join(".pipeline");
        std::fs::create_dir_all(&pipeline_dir).unwrap();
        std::fs::write(pipeline_dir.join(CONFIG_FILE_NAME), "[pipeline]\nmax_cycles = 3\n").unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert!(!result.wrote_config);
        assert!(pipeline_dir.join("sessions").is_dir());

        let content = std::fs::read_to_string(pipeline_dir.join(CONFIG_FILE_NAME)).unwrap();
        assert!(content.contains("max_cycles = 3"));
    }

    #[test]
    fn test_is_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        init_project(dir.path()).unwrap();
        assert!(is_initialized(dir.path()));
    }
}
