//! Inference service adapter.
//!
//! [`Inference`] is the contract the workflow steps call for planning,
//! validation, debugging and summarization. [`AgentInference`] fulfils it by
//! running an agent process per call: it renders a prompt, hands the agent a
//! JSON Schema for its answer, and validates what comes back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Action, DebugAnalysis, ExecutionResult, ValidationOutcome};
use crate::io::config::InferenceConfig;
use crate::io::executor::{ExecRequest, Executor, execute_and_load_json};
use crate::io::prompt::PromptEngine;

const PLAN_OUTPUT_SCHEMA: &str = include_str!("../../schemas/plan_output.schema.json");
const VALIDATE_OUTPUT_SCHEMA: &str = include_str!("../../schemas/validate_output.schema.json");
const DEBUG_OUTPUT_SCHEMA: &str = include_str!("../../schemas/debug_output.schema.json");
const SUMMARIZE_OUTPUT_SCHEMA: &str = include_str!("../../schemas/summarize_output.schema.json");

/// Rows shown to the validator.
pub const VALIDATE_SAMPLE_ROWS: usize = 5;
/// Rows shown to the summarizer.
pub const SUMMARIZE_SAMPLE_ROWS: usize = 20;

/// Planner output. The workflow target is attached by the Plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub statement: String,
    #[serde(default)]
    pub explanation: String,
    pub sensitive: bool,
}

impl PlannedAction {
    pub fn into_action(self, target: &str) -> Action {
        Action {
            statement: self.statement,
            sensitive: self.sensitive,
            target: target.to_string(),
            explanation: self.explanation,
        }
    }
}

/// Contract for the external reasoning service.
///
/// Errors mean the call itself failed (transport, malformed output); a
/// negative judgement is a normal [`ValidationOutcome`].
pub trait Inference {
    fn plan(
        &self,
        request: &str,
        target: &str,
        schema: &str,
        prior_debug: Option<&DebugAnalysis>,
    ) -> Result<PlannedAction>;

    fn validate(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
    ) -> Result<ValidationOutcome>;

    fn debug(
        &self,
        request: &str,
        schema: &str,
        action: &Action,
        result: &ExecutionResult,
        validation: Option<&ValidationOutcome>,
    ) -> Result<DebugAnalysis>;

    fn summarize(&self, request: &str, action: &Action, result: &ExecutionResult)
    -> Result<String>;
}

impl<T: Inference + ?Sized> Inference for Arc<T> {
    fn plan(
        &self,
        request: &str,
        target: &str,
        schema: &str,
        prior_debug: Option<&DebugAnalysis>,
    ) -> Result<PlannedAction> {
        (**self).plan(request, target, schema, prior_debug)
    }

    fn validate(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
    ) -> Result<ValidationOutcome> {
        (**self).validate(request, action, result)
    }

    fn debug(
        &self,
        request: &str,
        schema: &str,
        action: &Action,
        result: &ExecutionResult,
        validation: Option<&ValidationOutcome>,
    ) -> Result<DebugAnalysis> {
        (**self).debug(request, schema, action, result, validation)
    }

    fn summarize(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
    ) -> Result<String> {
        (**self).summarize(request, action, result)
    }
}

#[derive(Debug, Deserialize)]
struct DebugOutput {
    root_cause: String,
    revised_statement: String,
    #[serde(default)]
    explanation: String,
    sensitive: bool,
    #[serde(default)]
    changes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SummarizeOutput {
    answer: String,
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Plan,
    Validate,
    Debug,
    Summarize,
}

impl Endpoint {
    fn as_str(self) -> &'static str {
        match self {
            Endpoint::Plan => "plan",
            Endpoint::Validate => "validate",
            Endpoint::Debug => "debug",
            Endpoint::Summarize => "summarize",
        }
    }

    fn schema(self) -> &'static str {
        match self {
            Endpoint::Plan => PLAN_OUTPUT_SCHEMA,
            Endpoint::Validate => VALIDATE_OUTPUT_SCHEMA,
            Endpoint::Debug => DEBUG_OUTPUT_SCHEMA,
            Endpoint::Summarize => SUMMARIZE_OUTPUT_SCHEMA,
        }
    }
}

/// Inference backed by an agent process behind an [`Executor`].
pub struct AgentInference<E> {
    executor: E,
    prompts: PromptEngine,
    work_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    transport_retries: u32,
    calls: AtomicU64,
}

impl<E: Executor> AgentInference<E> {
    pub fn new(executor: E, config: &InferenceConfig) -> Result<Self> {
        Ok(Self {
            executor,
            prompts: PromptEngine::new()?,
            work_dir: config.work_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            transport_retries: config.transport_retries,
            calls: AtomicU64::new(0),
        })
    }

    /// Per-call directory holding the prompt, schema, output and executor log.
    fn call_dir(&self, endpoint: Endpoint) -> PathBuf {
        let seq = self.calls.fetch_add(1, Ordering::Relaxed);
        self.work_dir.join(format!(
            "{}-{seq}-{}",
            std::process::id(),
            endpoint.as_str()
        ))
    }

    #[instrument(skip_all, fields(endpoint = endpoint.as_str()))]
    fn call<T: DeserializeOwned>(&self, endpoint: Endpoint, prompt: String) -> Result<T> {
        let dir = self.call_dir(endpoint);
        fs::create_dir_all(&dir).with_context(|| format!("create call dir {}", dir.display()))?;
        let schema_path = dir.join("output.schema.json");
        write_text(&schema_path, endpoint.schema())?;
        write_text(&dir.join("prompt.md"), &prompt)?;

        let workdir = std::env::current_dir().context("resolve working directory")?;
        let mut last_err = None;
        for attempt in 0..=self.transport_retries {
            let request = ExecRequest {
                workdir: workdir.clone(),
                prompt: prompt.clone(),
                output_schema_path: schema_path.clone(),
                output_path: dir.join(format!("output.{attempt}.json")),
                executor_log_path: dir.join(format!("executor.{attempt}.log")),
                timeout: self.timeout,
                output_limit_bytes: self.output_limit_bytes,
            };
            match execute_and_load_json(&self.executor, &request) {
                Ok(output) => {
                    debug!(attempt, "inference call succeeded");
                    return Ok(output);
                }
                Err(err) => {
                    warn!(attempt, err = %format!("{err:#}"), "inference call failed");
                    last_err = Some(err);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no inference attempts were made"));
        Err(err.context(format!(
            "{} call failed after {} attempt(s)",
            endpoint.as_str(),
            self.transport_retries + 1
        )))
    }
}

impl<E: Executor> Inference for AgentInference<E> {
    fn plan(
        &self,
        request: &str,
        target: &str,
        schema: &str,
        prior_debug: Option<&DebugAnalysis>,
    ) -> Result<PlannedAction> {
        let prompt = self
            .prompts
            .render_plan(request, target, schema, prior_debug)?;
        let planned: PlannedAction = self.call(Endpoint::Plan, prompt)?;
        info!(sensitive = planned.sensitive, "planned action");
        Ok(planned)
    }

    fn validate(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
    ) -> Result<ValidationOutcome> {
        let prompt =
            self.prompts
                .render_validate(request, action, result, VALIDATE_SAMPLE_ROWS)?;
        self.call(Endpoint::Validate, prompt)
    }

    fn debug(
        &self,
        request: &str,
        schema: &str,
        action: &Action,
        result: &ExecutionResult,
        validation: Option<&ValidationOutcome>,
    ) -> Result<DebugAnalysis> {
        let prompt = self
            .prompts
            .render_debug(request, schema, action, result, validation)?;
        let output: DebugOutput = self.call(Endpoint::Debug, prompt)?;
        Ok(DebugAnalysis {
            root_cause: output.root_cause,
            revised_action: Action {
                statement: output.revised_statement,
                sensitive: output.sensitive,
                target: action.target.clone(),
                explanation: output.explanation,
            },
            changes: output.changes,
        })
    }

    fn summarize(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
    ) -> Result<String> {
        let prompt =
            self.prompts
                .render_summarize(request, action, result, SUMMARIZE_SAMPLE_ROWS)?;
        let output: SummarizeOutput = self.call(Endpoint::Summarize, prompt)?;
        Ok(output.answer)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
