//! Execution backend abstraction and the process-backed implementation.
//!
//! [`ExecutionBackend`] decouples the workflow from how statements actually
//! run. [`CommandBackend`] runs each statement through a configured command
//! (for example `sqlite3 -json app.db`) and keeps one lazily-opened handle per
//! target context. Tests use scripted backends instead.

use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ExecutionResult, Row};
use crate::io::config::TargetConfig;
use crate::io::process::{CommandOutput, run_with_timeout};

/// Failure kinds a backend can signal. The workflow turns each into an
/// unsuccessful [`ExecutionResult`] and lets the debug cycle handle it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("unknown target context '{0}'")]
    UnknownTarget(String),

    #[error("connection failed: {0}")]
    Connectivity(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Abstraction over stateful execution backends.
pub trait ExecutionBackend {
    /// Run `statement` against `target` and return its rows.
    fn execute(&self, target: &str, statement: &str) -> Result<ExecutionResult, BackendError>;

    /// Human-readable description of `target` (tables, columns) for the planner.
    fn describe(&self, target: &str) -> Result<String, BackendError>;
}

impl<T: ExecutionBackend + ?Sized> ExecutionBackend for Arc<T> {
    fn execute(&self, target: &str, statement: &str) -> Result<ExecutionResult, BackendError> {
        (**self).execute(target, statement)
    }

    fn describe(&self, target: &str) -> Result<String, BackendError> {
        (**self).describe(target)
    }
}

/// A pooled target handle. Created on first use and reused afterwards.
#[derive(Debug)]
pub struct TargetHandle {
    name: String,
    config: TargetConfig,
    executions: AtomicU64,
}

impl TargetHandle {
    fn open(name: &str, config: &TargetConfig) -> Result<Self, BackendError> {
        if config.command.is_empty() {
            return Err(BackendError::Connectivity(format!(
                "target '{name}' has no command"
            )));
        }
        info!(target_context = name, program = %config.command[0], "opened backend target");
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            executions: AtomicU64::new(0),
        })
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    #[instrument(skip_all, fields(target_context = %self.name))]
    fn run(&self, statement: &str) -> Result<CommandOutput, BackendError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);

        let output = run_with_timeout(
            cmd,
            Some(statement.as_bytes()),
            self.config.timeout(),
            self.config.output_limit_bytes,
        )
        .map_err(|err| BackendError::Connectivity(format!("{err:#}")))?;

        if output.timed_out {
            return Err(BackendError::Timeout(self.config.timeout()));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let message = first_meaningful_line(&stderr)
                .unwrap_or_else(|| format!("exit status {:?}", output.status.code()));
            warn!(exit_code = ?output.status.code(), %message, "statement failed");
            return Err(classify_failure(&stderr, message));
        }
        Ok(output)
    }
}

/// Backend that pipes statements into per-target commands.
pub struct CommandBackend {
    targets: BTreeMap<String, TargetConfig>,
    pool: Mutex<HashMap<String, Arc<TargetHandle>>>,
}

impl CommandBackend {
    pub fn new(targets: BTreeMap<String, TargetConfig>) -> Self {
        Self {
            targets,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the pooled handle for `target`, opening it on first use.
    pub fn handle(&self, target: &str) -> Result<Arc<TargetHandle>, BackendError> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = pool.get(target) {
            return Ok(Arc::clone(handle));
        }
        let config = self
            .targets
            .get(target)
            .ok_or_else(|| BackendError::UnknownTarget(target.to_string()))?;
        let handle = Arc::new(TargetHandle::open(target, config)?);
        pool.insert(target.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Number of targets opened so far.
    pub fn open_targets(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ExecutionBackend for CommandBackend {
    fn execute(&self, target: &str, statement: &str) -> Result<ExecutionResult, BackendError> {
        let handle = self.handle(target)?;
        let Some(changes) = handle.config.changes.as_deref() else {
            let output = handle.run(statement)?;
            let rows = parse_rows(&output.stdout_text())?;
            debug!(target_context = target, rows = rows.len(), "statement succeeded");
            return Ok(ExecutionResult::rows(rows));
        };

        // Same session, so the report sees this statement's changes.
        let statement = statement.trim_end().trim_end_matches(';');
        let output = handle.run(&format!("{statement};\n{changes}\n"))?;
        let mut sets = parse_row_sets(&output.stdout_text())?;
        let report = sets.pop().unwrap_or_default();
        let rows: Vec<Row> = sets.into_iter().flatten().collect();
        if rows.is_empty() {
            let affected = changed_rows(&report);
            debug!(target_context = target, affected, "statement succeeded");
            return Ok(ExecutionResult::affected(affected));
        }
        debug!(target_context = target, rows = rows.len(), "statement succeeded");
        Ok(ExecutionResult::rows(rows))
    }

    fn describe(&self, target: &str) -> Result<String, BackendError> {
        let handle = self.handle(target)?;
        let Some(statement) = handle.config.describe.clone() else {
            return Ok(String::new());
        };
        let output = handle.run(&statement)?;
        Ok(output.stdout_text().trim().to_string())
    }
}

/// Parse command output as a JSON array of row objects.
///
/// Empty output means the statement returned no rows (e.g. DML in `sqlite3 -json`).
pub fn parse_rows(stdout: &str) -> Result<Vec<Row>, BackendError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| BackendError::Statement(format!("unparseable backend output: {err}")))?;
    rows_from_value(value)
}

/// Parse output holding one JSON row set per statement that printed rows.
pub fn parse_row_sets(stdout: &str) -> Result<Vec<Vec<Row>>, BackendError> {
    serde_json::Deserializer::from_str(stdout)
        .into_iter::<Value>()
        .map(|value| {
            value
                .map_err(|err| {
                    BackendError::Statement(format!("unparseable backend output: {err}"))
                })
                .and_then(rows_from_value)
        })
        .collect()
}

/// First non-negative integer in the first row of a changes report.
fn changed_rows(report: &[Row]) -> u64 {
    report
        .first()
        .and_then(|row| row.values().find_map(Value::as_u64))
        .unwrap_or(0)
}

fn rows_from_value(value: Value) -> Result<Vec<Row>, BackendError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(BackendError::Statement(format!(
                    "expected row object, got {other}"
                ))),
            })
            .collect(),
        Value::Object(row) => Ok(vec![row]),
        other => Err(BackendError::Statement(format!(
            "expected array of rows, got {other}"
        ))),
    }
}

fn first_meaningful_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Classify a failed command by its stderr.
pub fn classify_failure(stderr: &str, message: String) -> BackendError {
    static CONNECTIVITY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)(unable to open database|could not connect|connection refused|connection reset|no route to host|authentication failed|server closed the connection)",
        )
        .expect("connectivity pattern is valid")
    });
    if CONNECTIVITY_RE.is_match(stderr) {
        BackendError::Connectivity(message)
    } else {
        BackendError::Statement(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_target(script: &str) -> TargetConfig {
        TargetConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            describe: Some("TABLE users(id, active)".to_string()),
            timeout_secs: 5,
            ..TargetConfig::default()
        }
    }

    fn backend(script: &str) -> CommandBackend {
        let mut targets = BTreeMap::new();
        targets.insert("echo".to_string(), sh_target(script));
        CommandBackend::new(targets)
    }

    #[test]
    fn parse_rows_accepts_arrays_and_empty_output() {
        let rows = parse_rows(r#"[{"n": 1}, {"n": 2}]"#).expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(parse_rows("  \n").expect("empty").is_empty());
    }

    #[test]
    fn parse_rows_rejects_scalars() {
        let err = parse_rows("42").unwrap_err();
        assert!(matches!(err, BackendError::Statement(_)));
    }

    #[test]
    fn classifies_connectivity_failures() {
        let err = classify_failure(
            "Error: unable to open database \"x.db\"",
            "unable to open".to_string(),
        );
        assert!(matches!(err, BackendError::Connectivity(_)));
        let err = classify_failure(
            "Parse error: no such column: foo",
            "no such column".to_string(),
        );
        assert!(matches!(err, BackendError::Statement(_)));
    }

    #[test]
    fn executes_statement_through_command() {
        let backend = backend("cat");
        let result = backend
            .execute("echo", r#"[{"active": 3}]"#)
            .expect("execute");
        assert!(result.success);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["active"], Value::from(3));
    }

    #[test]
    fn non_zero_exit_is_statement_error() {
        let backend = backend("cat >/dev/null; echo 'Parse error: no such column: foo' >&2; exit 1");
        let err = backend.execute("echo", "SELECT foo").unwrap_err();
        assert_eq!(
            err,
            BackendError::Statement("Parse error: no such column: foo".to_string())
        );
    }

    #[test]
    fn slow_command_times_out() {
        let mut targets = BTreeMap::new();
        targets.insert(
            "slow".to_string(),
            TargetConfig {
                timeout_secs: 1,
                ..sh_target("sleep 5")
            },
        );
        let backend = CommandBackend::new(targets);
        let err = backend.execute("slow", "SELECT 1").unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_secs(1)));
    }

    #[test]
    fn unknown_target_is_reported() {
        let backend = backend("cat");
        let err = backend.execute("missing", "SELECT 1").unwrap_err();
        assert_eq!(err, BackendError::UnknownTarget("missing".to_string()));
        assert_eq!(backend.open_targets(), 0);
    }

    #[test]
    fn targets_are_opened_once_and_reused() {
        let backend = backend("cat");
        backend.execute("echo", "[]").expect("first");
        backend.execute("echo", "[]").expect("second");
        assert_eq!(backend.open_targets(), 1);
        let handle = backend.handle("echo").expect("handle");
        assert_eq!(handle.executions(), 2);
    }

    fn changes_backend(script: &str) -> CommandBackend {
        let mut targets = BTreeMap::new();
        targets.insert(
            "db".to_string(),
            TargetConfig {
                changes: Some("SELECT changes() AS changes;".to_string()),
                ..sh_target(script)
            },
        );
        CommandBackend::new(targets)
    }

    #[test]
    fn silent_statement_reports_changed_rows() {
        let backend = changes_backend(r#"cat >/dev/null; echo '[{"changes": 4}]'"#);
        let result = backend
            .execute("db", "DELETE FROM sessions WHERE expired")
            .expect("execute");
        assert!(result.success);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 4);
    }

    #[test]
    fn changes_report_is_split_from_query_rows() {
        let backend = changes_backend(
            r#"cat >/dev/null; echo '[{"id": 1}, {"id": 2}]'; echo '[{"changes": 0}]'"#,
        );
        let result = backend.execute("db", "SELECT id FROM users").expect("execute");
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[1]["id"], Value::from(2));
    }

    #[test]
    fn changes_statement_runs_in_the_same_session() {
        let backend = changes_backend(
            r#"input=$(cat); case "$input" in *"changes()"*) echo '[{"changes": 1}]';; *) exit 1;; esac"#,
        );
        let result = backend.execute("db", "UPDATE users SET active = 0").expect("execute");
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn parse_row_sets_reads_consecutive_arrays() {
        let sets = parse_row_sets("[{\"n\": 1}]\n[{\"changes\": 0}]\n").expect("sets");
        assert_eq!(sets.len(), 2);
        assert!(parse_row_sets("").expect("empty").is_empty());
        assert!(parse_row_sets("[1]").is_err());
    }

    #[test]
    fn describe_runs_configured_statement() {
        let backend = backend("cat");
        let schema = backend.describe("echo").expect("describe");
        assert_eq!(schema, "TABLE users(id, active)");
    }
}
