//! Prompt rendering for the inference endpoints.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Action, DebugAnalysis, ExecutionResult, Row, ValidationOutcome};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const VALIDATE_TEMPLATE: &str = include_str!("prompts/validate.md");
const DEBUG_TEMPLATE: &str = include_str!("prompts/debug.md");
const SUMMARIZE_TEMPLATE: &str = include_str!("prompts/summarize.md");

/// Descriptions longer than this are cut before rendering.
pub const DEFAULT_SCHEMA_BUDGET_BYTES: usize = 16_000;

#[derive(Debug, Clone, Serialize)]
struct PriorDebugContext<'a> {
    root_cause: &'a str,
    statement: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    schema_budget_bytes: usize,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("validate", VALIDATE_TEMPLATE)
            .context("load validate template")?;
        env.add_template("debug", DEBUG_TEMPLATE)
            .context("load debug template")?;
        env.add_template("summarize", SUMMARIZE_TEMPLATE)
            .context("load summarize template")?;
        Ok(Self {
            env,
            schema_budget_bytes: DEFAULT_SCHEMA_BUDGET_BYTES,
        })
    }

    pub fn with_schema_budget(mut self, bytes: usize) -> Self {
        self.schema_budget_bytes = bytes;
        self
    }

    pub fn render_plan(
        &self,
        request: &str,
        target: &str,
        schema: &str,
        prior_debug: Option<&DebugAnalysis>,
    ) -> Result<String> {
        let prior_debug = prior_debug.map(|debug| PriorDebugContext {
            root_cause: debug.root_cause.trim(),
            statement: debug.revised_action.statement.trim(),
        });
        let template = self.env.get_template("plan")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                target => target,
                schema => self.bounded_schema(schema),
                prior_debug => prior_debug,
            })
            .context("render plan prompt")?;
        Ok(rendered)
    }

    pub fn render_validate(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
        sample_size: usize,
    ) -> Result<String> {
        let template = self.env.get_template("validate")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                statement => action.statement.trim(),
                row_count => result.row_count,
                sample_size => sample_size,
                rows => render_rows(&result.rows, sample_size)?,
            })
            .context("render validate prompt")?;
        Ok(rendered)
    }

    pub fn render_debug(
        &self,
        request: &str,
        schema: &str,
        action: &Action,
        result: &ExecutionResult,
        validation: Option<&ValidationOutcome>,
    ) -> Result<String> {
        let template = self.env.get_template("debug")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                target => action.target.as_str(),
                schema => self.bounded_schema(schema),
                statement => action.statement.trim(),
                errors => collect_errors(result, validation),
            })
            .context("render debug prompt")?;
        Ok(rendered)
    }

    pub fn render_summarize(
        &self,
        request: &str,
        action: &Action,
        result: &ExecutionResult,
        sample_size: usize,
    ) -> Result<String> {
        let template = self.env.get_template("summarize")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                statement => action.statement.trim(),
                row_count => result.row_count,
                sample_size => sample_size,
                rows => render_rows(&result.rows, sample_size)?,
            })
            .context("render summarize prompt")?;
        Ok(rendered)
    }

    fn bounded_schema(&self, schema: &str) -> String {
        let schema = schema.trim();
        if schema.len() <= self.schema_budget_bytes {
            return schema.to_string();
        }
        let mut cut = self.schema_budget_bytes;
        while !schema.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n[truncated]", &schema[..cut])
    }
}

/// Execution error first, then validator issues.
pub fn collect_errors(
    result: &ExecutionResult,
    validation: Option<&ValidationOutcome>,
) -> Vec<String> {
    let mut errors = Vec::new();
    if !result.success {
        let message = result.error_message.as_deref().unwrap_or("unknown error");
        errors.push(format!("Execution error: {message}"));
    }
    if let Some(validation) = validation.filter(|v| !v.valid) {
        errors.extend(validation.issues.iter().cloned());
    }
    errors
}

fn render_rows(rows: &[Row], sample_size: usize) -> Result<String> {
    let sample = &rows[..rows.len().min(sample_size)];
    serde_json::to_string_pretty(sample).context("serialize row sample")
}
