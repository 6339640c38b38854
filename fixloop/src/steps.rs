//! Workflow steps.
//!
//! Each step reads the current [`WorkflowState`] and returns a
//! [`StateUpdate`]; none of them keep state of their own. An `Err` means the
//! step could not run at all (an adapter fault or a missing input), which the
//! engine turns into a terminal failure.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cache::{ResultCache, cache_key};
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::{Action, AuditEntry, ExecutionResult, Stage, ValidationOutcome};
use crate::io::approval::{ApprovalProvider, ApprovalRequest};
use crate::io::backend::ExecutionBackend;
use crate::io::inference::Inference;

/// Error recorded when a sensitive action reaches Execute without approval.
pub const APPROVAL_REQUIRED: &str = "sensitive action requires approval";

/// Adapters a step may call. Borrowed from the engine for one step.
pub struct StepContext<'a, B, I, A> {
    pub cache: &'a ResultCache,
    pub backend: &'a B,
    pub inference: &'a I,
    pub approval: &'a A,
    pub approval_timeout: Duration,
}

impl<B, I, A> StepContext<'_, B, I, A>
where
    B: ExecutionBackend,
    I: Inference,
    A: ApprovalProvider,
{
    /// Run the step for `stage`. Terminal stages have no step.
    pub fn run(&self, stage: Stage, state: &WorkflowState) -> Result<StateUpdate> {
        match stage {
            Stage::Plan => self.plan(state),
            Stage::ApprovalGate => self.approve(state),
            Stage::Execute => self.execute(state),
            Stage::Validate => self.validate(state),
            Stage::Debug => self.debug(state),
            Stage::Answer => self.answer(state),
            Stage::EndSuccess | Stage::EndRejected | Stage::EndFailure => {
                Err(anyhow!("terminal stage {stage} has no step"))
            }
        }
    }

    /// Turn the request into an action. Describes the target once per workflow.
    #[instrument(skip_all, fields(target_context = %state.target))]
    pub fn plan(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let fresh_schema = match &state.schema {
            Some(_) => None,
            None => Some(self.describe_target(&state.target)),
        };
        let schema = state
            .schema
            .as_deref()
            .or(fresh_schema.as_deref())
            .unwrap_or_default();

        let planned = self
            .inference
            .plan(&state.request, &state.target, schema, state.debug.as_ref())
            .context("plan request")?;
        if planned.statement.trim().is_empty() {
            return Err(anyhow!("planner returned an empty statement"));
        }
        let action = planned.into_action(&state.target);
        info!(sensitive = action.sensitive, "planned action");

        let entry = AuditEntry::new(
            Stage::Plan,
            format!(
                "planned {} statement: {}",
                if action.sensitive { "sensitive" } else { "read-only" },
                action.statement
            ),
        );
        Ok(StateUpdate {
            schema: fresh_schema,
            action: Some(action),
            ..StateUpdate::default()
        }
        .audit(entry))
    }

    fn describe_target(&self, target: &str) -> String {
        match self.backend.describe(target) {
            Ok(schema) => schema,
            Err(err) => {
                warn!(target_context = target, err = %err, "describe failed; planning without a description");
                String::new()
            }
        }
    }

    /// Ask the approval provider. Only an explicit approval sets `approved = true`.
    #[instrument(skip_all, fields(target_context = %state.target))]
    pub fn approve(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let action = require_action(state)?;
        let response = self.approval.request(&ApprovalRequest {
            statement: action.statement.clone(),
            target: action.target.clone(),
            explanation: action.explanation.clone(),
            timeout: self.approval_timeout,
        });
        let approved = response.is_approved();
        let note = response.to_string();
        info!(approved, response = %note, "approval decided");
        Ok(StateUpdate {
            approved: Some(approved),
            approved_key: approved.then(|| cache_key(&action.target, &action.statement)),
            approval_note: Some(note.clone()),
            ..StateUpdate::default()
        }
        .audit(AuditEntry::new(Stage::ApprovalGate, note)))
    }

    /// Run the current action, serving read-only statements from the cache.
    ///
    /// Sensitive actions bypass the cache and run only if this exact statement
    /// was approved; a sensitive revision from Debug is refused.
    #[instrument(skip_all, fields(target_context = %state.target))]
    pub fn execute(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let action = require_action(state)?;

        if action.sensitive && !state.approves(action) {
            warn!("refusing to execute unapproved sensitive action");
            return Ok(executed(
                ExecutionResult::failure(APPROVAL_REQUIRED),
                false,
                format!("refused: {APPROVAL_REQUIRED}"),
            ));
        }

        if !action.sensitive
            && let Some(hit) = self.cache.get(&action.target, &action.statement)
        {
            debug!(rows = hit.row_count, "cache hit");
            let detail = format!("cache hit: {} row(s)", hit.row_count);
            return Ok(executed(hit, true, detail));
        }

        let result = match self.backend.execute(&action.target, &action.statement) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %err, "backend execution failed");
                ExecutionResult::failure(err.to_string())
            }
        };
        if !action.sensitive {
            self.cache.put(&action.target, &action.statement, &result);
        }
        let detail = describe_result(&result);
        Ok(executed(result, false, detail))
    }

    /// Judge the result. A failed execution is invalid without asking inference.
    #[instrument(skip_all, fields(target_context = %state.target))]
    pub fn validate(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let action = require_action(state)?;
        let execution = require_execution(state)?;

        let outcome = if execution.success {
            self.inference
                .validate(&state.request, action, execution)
                .context("validate result")?
        } else {
            let message = execution
                .error_message
                .as_deref()
                .unwrap_or("unknown error");
            ValidationOutcome::invalid(
                vec![format!("execution failed: {message}")],
                vec!["debug and fix the statement".to_string()],
            )
        };

        let detail = if outcome.valid {
            "valid".to_string()
        } else {
            format!("invalid: {}", outcome.issues.join("; "))
        };
        Ok(StateUpdate {
            validation: Some(outcome),
            ..StateUpdate::default()
        }
        .audit(AuditEntry::new(Stage::Validate, detail)))
    }

    /// Diagnose the failure and replace the action. Consumes one retry.
    ///
    /// The revised action stays on the workflow target and never loses the
    /// sensitive flag of the action it replaces.
    #[instrument(skip_all, fields(target_context = %state.target, retry = state.retry_count + 1))]
    pub fn debug(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let action = require_action(state)?;
        let execution = require_execution(state)?;

        let mut analysis = self
            .inference
            .debug(
                &state.request,
                state.schema.as_deref().unwrap_or_default(),
                action,
                execution,
                state.validation.as_ref(),
            )
            .context("debug failure")?;
        if analysis.revised_action.statement.trim().is_empty() {
            return Err(anyhow!("debugger returned an empty statement"));
        }
        analysis.revised_action.target = state.target.clone();
        analysis.revised_action.sensitive |= action.sensitive;

        let revised = analysis.revised_action.clone();
        let retry_count = state.retry_count + 1;
        info!(retry_count, root_cause = %analysis.root_cause, "revised action");
        let entry = AuditEntry::new(
            Stage::Debug,
            format!(
                "retry {retry_count}/{}: {}; revised statement: {}",
                state.max_retries, analysis.root_cause, revised.statement
            ),
        );
        Ok(StateUpdate {
            action: Some(revised),
            debug: Some(analysis),
            retry_count: Some(retry_count),
            ..StateUpdate::default()
        }
        .audit(entry))
    }

    /// Summarize the validated result into the final answer.
    #[instrument(skip_all, fields(target_context = %state.target))]
    pub fn answer(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let action = require_action(state)?;
        let execution = require_execution(state)?;
        let answer = self
            .inference
            .summarize(&state.request, action, execution)
            .context("summarize result")?;
        Ok(StateUpdate {
            answer: Some(answer),
            ..StateUpdate::default()
        }
        .audit(AuditEntry::new(Stage::Answer, "answer produced")))
    }
}

fn require_action(state: &WorkflowState) -> Result<&Action> {
    state
        .action
        .as_ref()
        .ok_or_else(|| anyhow!("no action has been planned"))
}

fn require_execution(state: &WorkflowState) -> Result<&ExecutionResult> {
    state
        .execution
        .as_ref()
        .ok_or_else(|| anyhow!("no execution result is available"))
}

fn executed(result: ExecutionResult, from_cache: bool, detail: String) -> StateUpdate {
    StateUpdate {
        execution: Some(result),
        from_cache,
        ..StateUpdate::default()
    }
    .audit(AuditEntry::new(Stage::Execute, detail))
}

fn describe_result(result: &ExecutionResult) -> String {
    if result.success {
        format!("executed: {} row(s)", result.row_count)
    } else {
        format!(
            "failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        )
    }
}
