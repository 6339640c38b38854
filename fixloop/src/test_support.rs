//! Test-only scripted adapters and builders.
//!
//! Every scripted double replays a queue of canned answers. The last answer
//! repeats once the queue is down to one item, so "always fail" is a
//! one-element script.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::types::{Action, DebugAnalysis, ExecutionResult, Row, ValidationOutcome};
use crate::io::approval::{ApprovalProvider, ApprovalRequest, ApprovalResponse};
use crate::io::backend::{BackendError, ExecutionBackend};
use crate::io::inference::{Inference, PlannedAction};

/// Read-only or sensitive action against the `app` target.
pub fn action(statement: &str, sensitive: bool) -> Action {
    Action {
        statement: statement.to_string(),
        sensitive,
        target: "app".to_string(),
        explanation: format!("run {statement}"),
    }
}

/// Single-column row.
pub fn row(column: &str, value: impl Into<Value>) -> Row {
    let mut row = Row::new();
    row.insert(column.to_string(), value.into());
    row
}

/// A successful result of `n` rows shaped `{"id": i}`.
pub fn id_rows(n: usize) -> ExecutionResult {
    ExecutionResult::rows((0..n).map(|i| row("id", i)).collect())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pop the next item, keeping the last one for repeats.
fn next_scripted<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = lock(queue);
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Backend that replays scripted results and counts calls.
#[derive(Debug)]
pub struct ScriptedBackend {
    results: Mutex<VecDeque<Result<ExecutionResult, BackendError>>>,
    description: Mutex<Result<String, BackendError>>,
    executed: Mutex<Vec<String>>,
    calls: AtomicUsize,
    describe_calls: AtomicUsize,
}

impl ScriptedBackend {
    /// An empty script answers every statement with zero rows.
    pub fn new(results: Vec<Result<ExecutionResult, BackendError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            description: Mutex::new(Ok(String::new())),
            executed: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_description(self, description: &str) -> Self {
        *lock(&self.description) = Ok(description.to_string());
        self
    }

    pub fn with_describe_error(self, message: &str) -> Self {
        *lock(&self.description) = Err(BackendError::Connectivity(message.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Statements in the order they reached the backend.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn execute(&self, _target: &str, statement: &str) -> Result<ExecutionResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.executed).push(statement.to_string());
        next_scripted(&self.results).unwrap_or_else(|| Ok(ExecutionResult::rows(Vec::new())))
    }

    fn describe(&self, _target: &str) -> Result<String, BackendError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.description).clone()
    }
}

/// Inference that replays scripted answers per endpoint.
///
/// Unscripted endpoints: `plan` and `debug` fail, `validate` says valid,
/// `summarize` reports the row count.
#[derive(Debug, Default)]
pub struct ScriptedInference {
    plans: Mutex<VecDeque<Result<PlannedAction, String>>>,
    validations: Mutex<VecDeque<ValidationOutcome>>,
    debugs: Mutex<VecDeque<DebugAnalysis>>,
    answers: Mutex<VecDeque<String>>,
    schemas_seen: Mutex<Vec<String>>,
    plan_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    debug_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, action: Action) -> Self {
        lock(&self.plans).push_back(Ok(PlannedAction {
            statement: action.statement,
            explanation: action.explanation,
            sensitive: action.sensitive,
        }));
        self
    }

    pub fn with_plan_error(self, message: &str) -> Self {
        lock(&self.plans).push_back(Err(message.to_string()));
        self
    }

    pub fn with_validation(self, outcome: ValidationOutcome) -> Self {
        lock(&self.validations).push_back(outcome);
        self
    }

    pub fn with_debug(self, analysis: DebugAnalysis) -> Self {
        lock(&self.debugs).push_back(analysis);
        self
    }

    /// Script a debug step that swaps in `statement`.
    pub fn with_revision(self, statement: &str) -> Self {
        self.with_debug(DebugAnalysis {
            root_cause: format!("needs {statement}"),
            revised_action: action(statement, false),
            changes: vec![format!("use {statement}")],
        })
    }

    pub fn with_answer(self, answer: &str) -> Self {
        lock(&self.answers).push_back(answer.to_string());
        self
    }

    pub fn schemas_seen(&self) -> Vec<String> {
        lock(&self.schemas_seen).clone()
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn debug_calls(&self) -> usize {
        self.debug_calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }
}

impl Inference for ScriptedInference {
    fn plan(
        &self,
        _request: &str,
        _target: &str,
        schema: &str,
        _prior_debug: Option<&DebugAnalysis>,
    ) -> Result<PlannedAction> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.schemas_seen).push(schema.to_string());
        match next_scripted(&self.plans) {
            Some(Ok(planned)) => Ok(planned),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted plan")),
        }
    }

    fn validate(
        &self,
        _request: &str,
        _action: &Action,
        _result: &ExecutionResult,
    ) -> Result<ValidationOutcome> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(next_scripted(&self.validations).unwrap_or_else(ValidationOutcome::valid))
    }

    fn debug(
        &self,
        _request: &str,
        _schema: &str,
        _action: &Action,
        _result: &ExecutionResult,
        _validation: Option<&ValidationOutcome>,
    ) -> Result<DebugAnalysis> {
        self.debug_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.debugs).ok_or_else(|| anyhow!("no scripted debug analysis"))
    }

    fn summarize(
        &self,
        _request: &str,
        _action: &Action,
        result: &ExecutionResult,
    ) -> Result<String> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(next_scripted(&self.answers)
            .unwrap_or_else(|| format!("{} row(s)", result.row_count)))
    }
}

/// Approval provider that replays scripted responses and records requests.
#[derive(Debug, Default)]
pub struct ScriptedApproval {
    responses: Mutex<VecDeque<ApprovalResponse>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    pub fn new(responses: Vec<ApprovalResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        lock(&self.requests).clone()
    }
}

impl ApprovalProvider for ScriptedApproval {
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        lock(&self.requests).push(request.clone());
        next_scripted(&self.responses).unwrap_or(ApprovalResponse::Cancelled)
    }
}
