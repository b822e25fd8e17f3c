use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::issue::Category;
use crate::queue::FixTask;

const BASE_CONSTRAINTS: &[&str] = &[
    "Modify only the file named in this instruction",
    "Touch only the minimal region needed to resolve the problem",
    "Preserve existing function signatures",
    "Preserve existing imports unless the problem is the import itself",
];

/// Self-contained single-issue payload for the fixing agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixInstruction {
    pub task_id: String,
    pub file: PathBuf,
    pub line: u32,
    pub end_line: u32,
    pub category: Category,
    pub description: String,
    pub constraints: Vec<String>,
}

impl FixInstruction {
    pub fn for_task(task: &FixTask) -> Self {
        let issue = &task.issue;
        let constraints = BASE_CONSTRAINTS
            .iter()
            .chain(issue.category.handler().constraints.iter())
            .map(|c| c.to_string())
            .collect();

        Self {
            task_id: issue.id.clone(),
            file: issue.file.clone(),
            line: issue.line_range.start,
            end_line: issue.line_range.end,
            category: issue.category,
            description: issue.description.clone(),
            constraints,
        }
    }

    /// Plain-text rendering for agents that take a prompt instead of JSON.
    pub fn to_prompt(&self) -> String {
        let location = if self.end_line > self.line {
            format!("lines {}-{}", self.line, self.end_line)
        } else {
            format!("line {}", self.line)
        };
        let mut prompt = format!(
            "Fix exactly one {} issue in {} at {}.\n\nProblem: {}\n\nConstraints:\n",
            self.category,
            self.file.display(),
            location,
            self.description
        );
        for constraint in &self.constraints {
            prompt.push_str("- ");
            prompt.push_str(constraint);
            prompt.push('\n');
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{AnalyzerRecord, ingest};

    fn task(category: &str) -> FixTask {
        let issue = ingest(vec![AnalyzerRecord {
            file: PathBuf::from("src/db.rs"),
            line: 12,
            end_line: Some(14),
            category: category.into(),
            message: "SQL built from user input".into(),
            severity: "error".into(),
            symbol: None,
            confidence: None,
        }])
        .remove(0);
        FixTask::new(issue)
    }

    #[test]
    fn test_instruction_carries_category_constraints() {
        let instruction = FixInstruction::for_task(&task("security"));
        assert_eq!(instruction.line, 12);
        assert_eq!(instruction.end_line, 14);
        assert!(instruction.constraints.iter().any(|c| c.contains("minimal region")));
        assert!(instruction.constraints.iter().any(|c| c.contains("weaken existing checks")));
    }

    #[test]
    fn test_prompt_mentions_location_and_problem() {
        let prompt = FixInstruction::for_task(&task("connection")).to_prompt();
        assert!(prompt.contains("src/db.rs at lines 12-14"));
        assert!(prompt.contains("SQL built from user input"));
        assert!(prompt.contains("- Preserve existing function signatures"));
    }
}
