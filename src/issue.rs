//! Issue records produced by the external analyzer, and the category
//! handler table that drives prioritization, instructions and validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::util::{normalize_path, sha256_hex};

/// Issue category, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    /// Connection and correctness defects.
    Connection,
    Duplicate,
    Quality,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Security => write!(f, "security"),
            Category::Connection => write!(f, "connection"),
            Category::Duplicate => write!(f, "duplicate"),
            Category::Quality => write!(f, "quality"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "security" | "vulnerability" => Ok(Category::Security),
            "connection" | "correctness" | "bug" => Ok(Category::Connection),
            "duplicate" | "duplication" => Ok(Category::Duplicate),
            "quality" | "lint" | "style" | "smell" => Ok(Category::Quality),
            _ => anyhow::bail!(
                "Invalid category '{}'. Valid values: security, connection, duplicate, quality",
                s
            ),
        }
    }
}

/// Static per-category behaviour.
#[derive(Debug)]
pub struct CategoryHandler {
    /// Lower ranks dispatch first.
    pub rank: u8,
    /// Extra constraint lines added to the fix instruction.
    pub constraints: &'static [&'static str],
    /// Fixes in this category may delete a named symbol, so they go through
    /// the dependency pre-check.
    pub removes_symbols: bool,
    pub max_removed_imports: usize,
    pub max_removed_signatures: usize,
}

static SECURITY: CategoryHandler = CategoryHandler {
    rank: 0,
    constraints: &[
        "Fix the vulnerability without changing the public behaviour of the surrounding code",
        "Do not disable or weaken existing checks",
    ],
    removes_symbols: false,
    max_removed_imports: 0,
    max_removed_signatures: 0,
};

static CONNECTION: CategoryHandler = CategoryHandler {
    rank: 1,
    constraints: &["Correct the defect in place; do not restructure callers"],
    removes_symbols: false,
    max_removed_imports: 0,
    max_removed_signatures: 0,
};

static DUPLICATE: CategoryHandler = CategoryHandler {
    rank: 2,
    constraints: &["Remove or merge only the duplicated block named in the problem"],
    removes_symbols: true,
    max_removed_imports: 1,
    max_removed_signatures: 1,
};

static QUALITY: CategoryHandler = CategoryHandler {
    rank: 3,
    constraints: &["Keep the change cosmetic; do not alter logic"],
    removes_symbols: true,
    max_removed_imports: 1,
    max_removed_signatures: 0,
};

impl Category {
    pub fn handler(self) -> &'static CategoryHandler {
        match self {
            Category::Security => &SECURITY,
            Category::Connection => &CONNECTION,
            Category::Duplicate => &DUPLICATE,
            Category::Quality => &QUALITY,
        }
    }

    pub fn rank(self) -> u8 {
        self.handler().rank
    }
}

/// Raw record as emitted by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerRecord {
    pub file: PathBuf,
    pub line: u32,
    #[serde(default)]
    pub end_line: Option<u32>,
    pub category: String,
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    /// Symbol the fix would remove, when the analyzer knows it.
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

fn default_severity() -> String {
    "warning".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

/// A detected issue. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub category: Category,
    pub file: PathBuf,
    pub line_range: LineRange,
    pub priority_rank: u8,
    pub description: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl Issue {
    /// Whether `other` describes the same problem, ignoring line drift.
    pub fn same_problem(&self, other: &Issue) -> bool {
        self.file == other.file
            && self.category == other.category
            && self.description == other.description
    }
}

fn severity_confidence(severity: &str) -> f32 {
    match severity.to_lowercase().as_str() {
        "critical" | "error" | "high" => 1.0,
        "warning" | "medium" => 0.7,
        _ => 0.4,
    }
}

/// Convert analyzer records into issues with stable ids.
///
/// The id hashes `(file, category, message, occurrence)`, where occurrence is
/// the record's index among identical `(file, category, message)` records
/// ordered by line, so ids survive line shifts between scans. Records with an
/// unknown category are dropped with a warning. Paths are normalized first, so
/// `./a.rs` and `a.rs` name the same file.
pub fn ingest(records: Vec<AnalyzerRecord>) -> Vec<Issue> {
    let mut parsed: Vec<(Category, AnalyzerRecord)> = records
        .into_iter()
        .map(|mut record| {
            record.file = normalize_path(&record.file);
            record
        })
        .filter_map(|record| match record.category.parse::<Category>() {
            Ok(category) => Some((category, record)),
            Err(e) => {
                tracing::warn!(file = %record.file.display(), line = record.line, "{}", e);
                None
            }
        })
        .collect();
    parsed.sort_by(|(_, a), (_, b)| (&a.file, a.line).cmp(&(&b.file, b.line)));

    let mut occurrences: HashMap<(PathBuf, Category, String), usize> = HashMap::new();
    parsed
        .into_iter()
        .map(|(category, record)| {
            let key = (record.file.clone(), category, record.message.clone());
            let occurrence = occurrences.entry(key).or_insert(0);
            let id_source = format!(
                "{}\0{}\0{}\0{}",
                record.file.display(),
                category,
                record.message,
                occurrence
            );
            *occurrence += 1;

            Issue {
                id: sha256_hex(id_source.as_bytes())[..12].to_string(),
                category,
                line_range: LineRange {
                    start: record.line,
                    end: record.end_line.unwrap_or(record.line).max(record.line),
                },
                priority_rank: category.rank(),
                confidence: record
                    .confidence
                    .unwrap_or_else(|| severity_confidence(&record.severity))
                    .clamp(0.0, 1.0),
                description: record.message,
                file: record.file,
                symbol: record.symbol,
            }
        })
        .collect()
}
