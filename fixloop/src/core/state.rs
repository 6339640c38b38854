//! The workflow record threaded through the state machine, and the partial
//! updates steps return.
//!
//! Steps never mutate [`WorkflowState`] directly. They return a
//! [`StateUpdate`] and the engine merges it with [`WorkflowState::apply`], which
//! enforces the engine-owned invariants (retry counter, append-only log).

use crate::cache::{CacheKey, cache_key};
use crate::core::types::{
    Action, AuditEntry, DebugAnalysis, ExecutionResult, TerminalStatus, ValidationOutcome,
};

/// Default retry budget when the request does not supply one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Construction input for one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRequest {
    pub request: String,
    pub target: String,
    pub max_retries: u32,
}

impl WorkflowRequest {
    pub fn new(request: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            target: target.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Single mutable aggregate owned by one workflow instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowState {
    pub request: String,
    pub target: String,
    /// Backend description handed to the planner.
    pub schema: Option<String>,
    pub action: Option<Action>,
    pub execution: Option<ExecutionResult>,
    /// True when `execution` was served from the cache.
    pub from_cache: bool,
    pub validation: Option<ValidationOutcome>,
    pub debug: Option<DebugAnalysis>,
    pub approved: Option<bool>,
    /// Key of the exact action that was approved. Approval never carries
    /// over to a different statement or target.
    pub approved_key: Option<CacheKey>,
    /// Provider response behind `approved`, kept verbatim.
    pub approval_note: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub audit_log: Vec<AuditEntry>,
    pub answer: Option<String>,
    pub status: Option<TerminalStatus>,
    /// Why the workflow ended (rejection or failure context).
    pub reason: Option<String>,
}

impl WorkflowState {
    pub fn new(request: &WorkflowRequest) -> Self {
        Self {
            request: request.request.clone(),
            target: request.target.clone(),
            schema: None,
            action: None,
            execution: None,
            from_cache: false,
            validation: None,
            debug: None,
            approved: None,
            approved_key: None,
            approval_note: None,
            retry_count: 0,
            max_retries: request.max_retries,
            audit_log: Vec::new(),
            answer: None,
            status: None,
            reason: None,
        }
    }

    /// Merge a step's partial update.
    ///
    /// Rejects updates that would move the retry counter by anything other
    /// than exactly one, or past the budget. On error the state is unchanged.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), String> {
        if let Some(next) = update.retry_count {
            if next != self.retry_count + 1 {
                return Err(format!(
                    "retry counter must advance by one (from {} to {})",
                    self.retry_count, next
                ));
            }
            if next > self.max_retries {
                return Err(format!(
                    "retry counter {} exceeds max_retries {}",
                    next, self.max_retries
                ));
            }
        }

        if let Some(schema) = update.schema {
            self.schema = Some(schema);
        }
        if let Some(action) = update.action {
            self.action = Some(action);
        }
        if let Some(execution) = update.execution {
            self.execution = Some(execution);
            self.from_cache = update.from_cache;
        }
        if let Some(validation) = update.validation {
            self.validation = Some(validation);
        }
        if let Some(debug) = update.debug {
            self.debug = Some(debug);
        }
        if let Some(approved) = update.approved {
            self.approved = Some(approved);
            self.approved_key = update.approved_key;
        }
        if let Some(note) = update.approval_note {
            self.approval_note = Some(note);
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(answer) = update.answer {
            self.answer = Some(answer);
        }
        self.audit_log.extend(update.audit);
        Ok(())
    }

    /// True only for the action a human approved (formatting differences aside).
    pub fn approves(&self, action: &Action) -> bool {
        self.approved == Some(true)
            && self.approved_key == Some(cache_key(&action.target, &action.statement))
    }

    /// Last execution error message, if the last execution failed.
    pub fn last_error(&self) -> Option<&str> {
        self.execution
            .as_ref()
            .filter(|result| !result.success)
            .and_then(|result| result.error_message.as_deref())
    }
}

/// Partial update returned by a step. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub schema: Option<String>,
    pub action: Option<Action>,
    pub execution: Option<ExecutionResult>,
    pub from_cache: bool,
    pub validation: Option<ValidationOutcome>,
    pub debug: Option<DebugAnalysis>,
    pub approved: Option<bool>,
    pub approved_key: Option<CacheKey>,
    pub approval_note: Option<String>,
    pub retry_count: Option<u32>,
    pub answer: Option<String>,
    pub audit: Vec<AuditEntry>,
}

impl StateUpdate {
    pub fn audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }
}
