//! Layered post-fix validation of file content.
//!
//! Content checks run here; the "issue no longer present" check needs the
//! analyzer and runs in the protocol.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::issue::Category;
use crate::pipeline_config::ValidationSection;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Mutation, delimiter balance, issue resolved.
    Basic,
    /// Basic + import/signature integrity + bounded size delta.
    #[default]
    Standard,
    /// Standard with a halved size bound and a changed-line cap.
    Strict,
}

impl ValidationLevel {
    pub fn tighten(self) -> Self {
        match self {
            Self::Basic => Self::Standard,
            Self::Standard | Self::Strict => Self::Strict,
        }
    }
}

impl std::fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Standard => write!(f, "standard"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(use\s|import\s|from\s+\S+\s+import\s|#include\s|require\s*\(|(const|let|var)\s+\w+\s*=\s*require\()")
        .expect("import pattern is valid")
});

static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(pub(\([^)]*\))?\s+)?(async\s+)?(fn|def|function|func|class)\s+\w+")
        .expect("signature pattern is valid")
});

/// Check `after` against `before` at the given level. Returns the first failing reason.
pub fn validate_content(
    before: &str,
    after: &str,
    category: Category,
    level: ValidationLevel,
    thresholds: &ValidationSection,
) -> Result<(), String> {
    if before == after {
        return Err("agent made no change to the file".to_string());
    }

    if delimiters_balanced(before) && !delimiters_balanced(after) {
        return Err("file no longer parses: unbalanced delimiters".to_string());
    }

    if level == ValidationLevel::Basic {
        return Ok(());
    }

    let handler = category.handler();
    let removed_imports = removed_lines(before, after, &IMPORT_RE);
    if removed_imports > handler.max_removed_imports {
        return Err(format!(
            "{} import line(s) removed, {} allowed for {}",
            removed_imports, handler.max_removed_imports, category
        ));
    }
    let removed_signatures = removed_lines(before, after, &SIGNATURE_RE);
    if removed_signatures > handler.max_removed_signatures {
        return Err(format!(
            "{} signature line(s) removed or altered, {} allowed for {}",
            removed_signatures, handler.max_removed_signatures, category
        ));
    }

    let mut ratio = thresholds.max_size_delta_ratio;
    let mut min_bytes = thresholds.min_size_delta_bytes;
    if level == ValidationLevel::Strict {
        ratio /= 2.0;
        min_bytes /= 2;
    }
    let allowed = ((before.len() as f64 * ratio) as usize).max(min_bytes);
    let delta = before.len().abs_diff(after.len());
    if delta > allowed {
        return Err(format!(
            "size changed by {} bytes, limit {} bytes",
            delta, allowed
        ));
    }

    if level == ValidationLevel::Strict {
        let changed = changed_line_span(before, after);
        if changed > thresholds.max_changed_lines {
            return Err(format!(
                "{} lines changed, limit {} at strict validation",
                changed, thresholds.max_changed_lines
            ));
        }
    }

    Ok(())
}

/// Whether `()`, `[]` and `{}` balance, ignoring string literals and comments.
pub fn delimiters_balanced(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let mut stack: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '\'' => {
                // Char literals only; a lone quote is a lifetime or apostrophe.
                if chars.get(i + 2) == Some(&'\'') {
                    i += 2;
                } else if next == Some('\\') && chars.get(i + 3) == Some(&'\'') {
                    i += 3;
                }
            }
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }
    stack.is_empty()
}

/// Count lines matching `re` present in `before` but missing from `after` (multiset).
fn removed_lines(before: &str, after: &str, re: &Regex) -> usize {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for line in after.lines().filter(|l| re.is_match(l)) {
        *remaining.entry(line.trim()).or_insert(0) += 1;
    }
    let mut removed = 0;
    for line in before.lines().filter(|l| re.is_match(l)) {
        match remaining.get_mut(line.trim()) {
            Some(n) if *n > 0 => *n -= 1,
            _ => removed += 1,
        }
    }
    removed
}

/// Lines inside the differing middle region once common prefix and suffix are trimmed.
fn changed_line_span(before: &str, after: &str) -> usize {
    let a: Vec<&str> = before.lines().collect();
    let b: Vec<&str> = after.lines().collect();
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    (a.len() - prefix - suffix).max(b.len() - prefix - suffix)
}
