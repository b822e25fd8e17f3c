//! Static dependency pre-check.
//!
//! A task whose category may delete code and whose issue names a symbol is
//! blocked if that symbol appears anywhere else in the project.

use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::SkipReason;
use crate::issue::Issue;

const SKIP_DIRS: &[&str] = &["target", "node_modules", "vendor", "dist", "build"];
const MAX_SCAN_BYTES: u64 = 2 * 1024 * 1024;

pub struct DependencyChecker {
    root: PathBuf,
}

impl DependencyChecker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Return `(issue_id, reason)` for every issue whose removal would break a reference.
    pub fn check_all(&self, issues: &[&Issue]) -> Vec<(String, SkipReason)> {
        let candidates: Vec<(&Issue, &str, Regex)> = issues
            .iter()
            .filter(|issue| issue.category.handler().removes_symbols)
            .filter_map(|&issue| {
                let symbol = issue.symbol.as_deref()?.trim();
                if symbol.is_empty() {
                    return None;
                }
                let pattern = format!(r"\b{}\b", regex::escape(symbol));
                Regex::new(&pattern).ok().map(|re| (issue, symbol, re))
            })
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        let mut blocked: Vec<(String, SkipReason)> = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !is_skipped_dir(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if blocked.len() == candidates.len() {
                break;
            }
            if entry.metadata().map(|m| m.len() > MAX_SCAN_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_path_buf();

            for (issue, symbol, re) in &candidates {
                if blocked.iter().any(|(id, _)| id == &issue.id) {
                    continue;
                }
                if same_file(&issue.file, &relative) {
                    continue;
                }
                if re.is_match(&content) {
                    tracing::info!(
                        task = %issue.id,
                        symbol = %symbol,
                        referenced_in = %relative.display(),
                        "fix blocked by dependency"
                    );
                    blocked.push((
                        issue.id.clone(),
                        SkipReason::BlockedDependency {
                            symbol: symbol.to_string(),
                            referenced_in: relative.clone(),
                        },
                    ));
                }
            }
        }
        blocked
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref())
}

fn same_file(issue_file: &Path, relative: &Path) -> bool {
    let issue_file = issue_file.strip_prefix("./").unwrap_or(issue_file);
    issue_file == relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{AnalyzerRecord, ingest};
    use tempfile::TempDir;

    fn issue(file: &str, category: &str, symbol: Option<&str>) -> Issue {
        ingest(vec![AnalyzerRecord {
            file: PathBuf::from(file),
            line: 1,
            end_line: None,
            category: category.into(),
            message: "unused function".into(),
            severity: "warning".into(),
            symbol: symbol.map(String::from),
            confidence: None,
        }])
        .remove(0)
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/util.rs"), "pub fn helper() {}\nfn lonely() {}\n").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() { util::helper(); }\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".pipeline")).unwrap();
        std::fs::write(dir.path().join(".pipeline/notes"), "lonely").unwrap();
        dir
    }

    #[test]
    fn test_referenced_symbol_is_blocked() {
        let dir = project();
        let checker = DependencyChecker::new(dir.path());
        let target = issue("src/util.rs", "quality", Some("helper"));
        let blocked = checker.check_all(&[&target]);
        assert_eq!(blocked.len(), 1);
        match &blocked[0].1 {
            SkipReason::BlockedDependency { symbol, referenced_in } => {
                assert_eq!(symbol, "helper");
                assert_eq!(referenced_in, &PathBuf::from("src/main.rs"));
            }
            other => panic!("Expected BlockedDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unreferenced_symbol_passes_and_hidden_dirs_ignored() {
        let dir = project();
        let checker = DependencyChecker::new(dir.path());
        let target = issue("src/util.rs", "duplicate", Some("lonely"));
        assert!(checker.check_all(&[&target]).is_empty());
    }

    #[test]
    fn test_non_removing_category_not_checked() {
        let dir = project();
        let checker = DependencyChecker::new(dir.path());
        let target = issue("src/util.rs", "security", Some("helper"));
        assert!(checker.check_all(&[&target]).is_empty());
    }

    #[test]
    fn test_word_boundary_match() {
        let dir = project();
        std::fs::write(dir.path().join("src/other.rs"), "fn helpers_list() {}\n").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        let checker = DependencyChecker::new(dir.path());
        let target = issue("src/util.rs", "quality", Some("helper"));
        assert!(checker.check_all(&[&target]).is_empty());
    }
}
