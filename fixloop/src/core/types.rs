//! Shared deterministic types for the workflow core.
//!
//! Each entity has exactly one canonical shape. It is built once by the step
//! that produces it and passed unchanged afterwards; a revision always creates
//! a new value instead of editing the old one.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single result record returned by the backend.
pub type Row = Map<String, Value>;

/// Executable unit produced by planning or debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Opaque statement handed to the execution backend.
    pub statement: String,
    /// True when the statement mutates state and needs human approval.
    pub sensitive: bool,
    /// Backend/environment the statement runs against.
    pub target: String,
    /// Planner's description of what the statement does.
    #[serde(default)]
    pub explanation: String,
}

/// Outcome of running an [`Action`] against the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// Successful result whose row count matches `rows`.
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            success: true,
            row_count: rows.len() as u64,
            rows,
            error_message: None,
        }
    }

    /// Successful result for statements that report affected rows instead of returning them.
    pub fn affected(row_count: u64) -> Self {
        Self {
            success: true,
            rows: Vec::new(),
            row_count,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            row_count: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Judgment on whether a result answers the original request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn invalid(issues: Vec<String>, suggestions: Vec<String>) -> Self {
        Self {
            valid: false,
            issues,
            suggestions,
        }
    }
}

/// Root cause plus a revised action after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugAnalysis {
    pub root_cause: String,
    pub revised_action: Action,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Workflow states. The three `End*` variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    ApprovalGate,
    Execute,
    Validate,
    Debug,
    Answer,
    EndSuccess,
    EndRejected,
    EndFailure,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::EndSuccess | Stage::EndRejected | Stage::EndFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::ApprovalGate => "approval_gate",
            Stage::Execute => "execute",
            Stage::Validate => "validate",
            Stage::Debug => "debug",
            Stage::Answer => "answer",
            Stage::EndSuccess => "end_success",
            Stage::EndRejected => "end_rejected",
            Stage::EndFailure => "end_failure",
        }
    }

    /// Terminal status for an `End*` stage, `None` otherwise.
    pub fn terminal_status(self) -> Option<TerminalStatus> {
        match self {
            Stage::EndSuccess => Some(TerminalStatus::Success),
            Stage::EndRejected => Some(TerminalStatus::Rejected),
            Stage::EndFailure => Some(TerminalStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Rejected,
    Failure,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Success => "success",
            TerminalStatus::Rejected => "rejected",
            TerminalStatus::Failure => "failure",
        }
    }
}

/// One line of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub stage: Stage,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_constructor_counts_rows() {
        let mut row = Row::new();
        row.insert("n".to_string(), Value::from(1));
        let result = ExecutionResult::rows(vec![row.clone(), row]);
        assert!(result.success);
        assert_eq!(result.row_count, 2);
        assert!(result.error_message.is_none());
    }

    #[test]
    fn only_end_stages_are_terminal() {
        let terminal: Vec<Stage> = [
            Stage::Plan,
            Stage::ApprovalGate,
            Stage::Execute,
            Stage::Validate,
            Stage::Debug,
            Stage::Answer,
            Stage::EndSuccess,
            Stage::EndRejected,
            Stage::EndFailure,
        ]
        .into_iter()
        .filter(|stage| stage.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![Stage::EndSuccess, Stage::EndRejected, Stage::EndFailure]
        );
    }

    #[test]
    fn execution_result_defaults_missing_fields() {
        let parsed: ExecutionResult = serde_json::from_str(r#"{"success": true}"#).expect("parse");
        assert_eq!(parsed, ExecutionResult::rows(Vec::new()));
    }

    #[test]
    fn audit_entry_renders_stage_prefix() {
        let entry = AuditEntry::new(Stage::Debug, "missing GROUP BY");
        assert_eq!(entry.to_string(), "debug: missing GROUP BY");
    }
}
