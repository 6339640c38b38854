//! Workflow engine: drives one request through plan, approval, execution,
//! validation and bounded debugging until a terminal stage.
//!
//! An [`Engine`] owns the adapters and the shared [`ResultCache`]; each
//! [`Workflow`] owns one instance's state and advances it one step at a time.
//! Independent workflows can share one engine across threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::ResultCache;
use crate::core::routing::{Route, next_stage};
use crate::core::state::{WorkflowRequest, WorkflowState};
use crate::core::types::{
    Action, AuditEntry, ExecutionResult, Stage, TerminalStatus, ValidationOutcome,
};
use crate::io::approval::ApprovalProvider;
use crate::io::backend::ExecutionBackend;
use crate::io::inference::Inference;
use crate::steps::StepContext;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long the approval gate waits for an answer.
    pub approval_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Final report for one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub status: TerminalStatus,
    pub answer: Option<String>,
    /// Why the workflow was rejected or failed.
    pub reason: Option<String>,
    pub last_action: Option<Action>,
    pub last_execution: Option<ExecutionResult>,
    pub last_validation: Option<ValidationOutcome>,
    pub retries_consumed: u32,
    pub audit_log: Vec<AuditEntry>,
}

impl WorkflowOutput {
    fn from_state(state: &WorkflowState, status: TerminalStatus) -> Self {
        Self {
            status,
            answer: state.answer.clone(),
            reason: state.reason.clone(),
            last_action: state.action.clone(),
            last_execution: state.execution.clone(),
            last_validation: state.validation.clone(),
            retries_consumed: state.retry_count,
            audit_log: state.audit_log.clone(),
        }
    }
}

pub struct Engine<B, I, A> {
    cache: Arc<ResultCache>,
    backend: B,
    inference: I,
    approval: A,
    config: EngineConfig,
}

impl<B, I, A> Engine<B, I, A>
where
    B: ExecutionBackend,
    I: Inference,
    A: ApprovalProvider,
{
    pub fn new(cache: Arc<ResultCache>, backend: B, inference: I, approval: A) -> Self {
        Self {
            cache,
            backend,
            inference,
            approval,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn inference(&self) -> &I {
        &self.inference
    }

    pub fn approval(&self) -> &A {
        &self.approval
    }

    /// Create a fresh workflow instance positioned at `Plan`.
    pub fn start(&self, request: WorkflowRequest) -> Workflow<'_, B, I, A> {
        info!(target_context = %request.target, max_retries = request.max_retries, "starting workflow");
        Workflow {
            engine: self,
            state: WorkflowState::new(&request),
            stage: Stage::Plan,
        }
    }

    /// Run one request to completion.
    pub fn run(&self, request: WorkflowRequest) -> WorkflowOutput {
        self.start(request).finish()
    }

    fn step_context(&self) -> StepContext<'_, B, I, A> {
        StepContext {
            cache: &self.cache,
            backend: &self.backend,
            inference: &self.inference,
            approval: &self.approval,
            approval_timeout: self.config.approval_timeout,
        }
    }
}

impl<B, I, A> Engine<B, I, A>
where
    B: ExecutionBackend + Sync,
    I: Inference + Sync,
    A: ApprovalProvider + Sync,
{
    /// Run independent requests on up to `jobs` threads sharing this engine's
    /// cache. Outputs are returned in request order.
    #[instrument(skip_all, fields(requests = requests.len(), jobs = jobs))]
    pub fn run_all(&self, requests: Vec<WorkflowRequest>, jobs: usize) -> Vec<WorkflowOutput> {
        let total = requests.len();
        let workers = jobs.clamp(1, total.max(1));
        let next = AtomicUsize::new(0);
        let slots: Vec<Mutex<Option<WorkflowOutput>>> =
            (0..total).map(|_| Mutex::new(None)).collect();
        let requests = &requests;
        let slots_ref = &slots;
        let next = &next;

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move || {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(request) = requests.get(index) else {
                            break;
                        };
                        let output = self.run(request.clone());
                        *slots_ref[index]
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(output);
                    }
                });
            }
        });

        slots
            .into_iter()
            .filter_map(|slot| slot.into_inner().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

/// One workflow instance in progress.
pub struct Workflow<'e, B, I, A> {
    engine: &'e Engine<B, I, A>,
    state: WorkflowState,
    stage: Stage,
}

impl<B, I, A> Workflow<'_, B, I, A>
where
    B: ExecutionBackend,
    I: Inference,
    A: ApprovalProvider,
{
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Run exactly one step, merge its update and route to the next stage.
    ///
    /// A terminal stage is returned unchanged without running anything.
    #[instrument(skip_all, fields(stage = %self.stage, retry = self.state.retry_count))]
    pub fn advance(&mut self) -> Stage {
        let stage = self.stage;
        if stage.is_terminal() {
            return stage;
        }

        let update = match self.engine.step_context().run(stage, &self.state) {
            Ok(update) => update,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "step failed");
                self.terminate(Stage::EndFailure, Some(format!("{stage} step failed: {err:#}")));
                return self.stage;
            }
        };
        if let Err(err) = self.state.apply(update) {
            warn!(%err, "state update rejected");
            self.terminate(Stage::EndFailure, Some(format!("{stage} step failed: {err}")));
            return self.stage;
        }

        match next_stage(stage, &self.state) {
            Route::Next(next) if next.is_terminal() => {
                let reason = self.terminal_reason(next);
                self.terminate(next, reason);
            }
            Route::Next(next) => {
                debug!(from = %stage, to = %next, "routed");
                self.stage = next;
            }
            Route::NotReady => {
                self.terminate(
                    Stage::EndFailure,
                    Some(format!(
                        "{stage} cannot route: execution result or validation outcome is missing"
                    )),
                );
            }
        }
        self.stage
    }

    /// Drive the workflow to a terminal stage.
    pub fn finish(mut self) -> WorkflowOutput {
        while !self.stage.is_terminal() {
            self.advance();
        }
        self.output()
    }

    /// Like [`Workflow::finish`], but checks `cancel` before every step.
    ///
    /// Returns `None` when the workflow was abandoned; a step already running
    /// is never interrupted.
    pub fn run_until(mut self, cancel: &AtomicBool) -> Option<WorkflowOutput> {
        while !self.stage.is_terminal() {
            if cancel.load(Ordering::SeqCst) {
                info!(stage = %self.stage, "workflow cancelled");
                return None;
            }
            self.advance();
        }
        Some(self.output())
    }

    fn output(&self) -> WorkflowOutput {
        let status = self
            .state
            .status
            .or(self.stage.terminal_status())
            .unwrap_or(TerminalStatus::Failure);
        WorkflowOutput::from_state(&self.state, status)
    }

    fn terminal_reason(&self, terminal: Stage) -> Option<String> {
        match terminal {
            Stage::EndRejected => Some(
                self.state
                    .approval_note
                    .clone()
                    .unwrap_or_else(|| "sensitive action was not approved".to_string()),
            ),
            Stage::EndFailure => Some(self.exhausted_reason()),
            _ => None,
        }
    }

    fn exhausted_reason(&self) -> String {
        let mut reason = format!(
            "retry budget exhausted after {} of {} retries",
            self.state.retry_count, self.state.max_retries
        );
        if let Some(error) = self.state.last_error() {
            reason.push_str(&format!("; last error: {error}"));
        }
        if let Some(validation) = self.state.validation.as_ref().filter(|v| !v.valid)
            && !validation.issues.is_empty()
        {
            reason.push_str(&format!("; issues: {}", validation.issues.join("; ")));
        }
        reason
    }

    fn terminate(&mut self, terminal: Stage, reason: Option<String>) {
        let status = terminal.terminal_status();
        let detail = match (&reason, status) {
            (Some(reason), _) => reason.clone(),
            (None, Some(status)) => status.as_str().to_string(),
            (None, None) => terminal.as_str().to_string(),
        };
        info!(terminal = %terminal, detail = %detail, "workflow finished");
        self.state.audit_log.push(AuditEntry::new(terminal, detail));
        self.state.status = status;
        self.state.reason = reason;
        self.stage = terminal;
    }
}
