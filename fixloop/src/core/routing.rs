//! Deterministic routing between workflow stages.
//!
//! Every function here is total over partially-populated state: missing
//! flags default to "not sensitive" / "not approved", and missing execution
//! or validation results never trigger a retry or an answer on their own.

use crate::core::state::WorkflowState;
use crate::core::types::Stage;

/// Routing decision for the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Next(Stage),
    /// The inputs this decision depends on are not available yet.
    NotReady,
}

/// Dispatch to the decision for `current`. Terminal stages are absorbing.
pub fn next_stage(current: Stage, state: &WorkflowState) -> Route {
    match current {
        Stage::Plan => after_plan(state),
        Stage::ApprovalGate => after_approval(state),
        Stage::Execute => Route::Next(Stage::Validate),
        Stage::Validate => after_validate(state),
        Stage::Debug => Route::Next(Stage::Execute),
        Stage::Answer => Route::Next(Stage::EndSuccess),
        Stage::EndSuccess | Stage::EndRejected | Stage::EndFailure => Route::Next(current),
    }
}

/// Sensitive actions go through the approval gate; everything else executes.
pub fn after_plan(state: &WorkflowState) -> Route {
    let sensitive = state.action.as_ref().is_some_and(|action| action.sensitive);
    if sensitive {
        Route::Next(Stage::ApprovalGate)
    } else {
        Route::Next(Stage::Execute)
    }
}

/// Only an explicit approval continues to execution.
pub fn after_approval(state: &WorkflowState) -> Route {
    if state.approved == Some(true) {
        Route::Next(Stage::Execute)
    } else {
        Route::Next(Stage::EndRejected)
    }
}

/// Retry, fail, or answer after validation.
pub fn after_validate(state: &WorkflowState) -> Route {
    let execution_failed = state
        .execution
        .as_ref()
        .is_some_and(|result| !result.success);
    let validation_failed = state
        .validation
        .as_ref()
        .is_some_and(|outcome| !outcome.valid);

    if execution_failed || validation_failed {
        if state.retry_count < state.max_retries {
            return Route::Next(Stage::Debug);
        }
        return Route::Next(Stage::EndFailure);
    }

    if state.execution.is_some() && state.validation.is_some() {
        return Route::Next(Stage::Answer);
    }
    Route::NotReady
}
