//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the inference adapter from the actual
//! agent process. Tests use fake executors that write predetermined outputs
//! without spawning anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_with_timeout;

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the executor process.
    pub workdir: PathBuf,
    /// Prompt text to feed to the agent on stdin.
    pub prompt: String,
    /// Path to the JSON Schema that constrains agent output.
    pub output_schema_path: PathBuf,
    /// Path where the agent must write its output JSON.
    pub output_path: PathBuf,
    /// Path to write executor stdout/stderr log.
    pub executor_log_path: PathBuf,
    pub timeout: Duration,
    /// Truncate executor output logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run the agent with the given request. Must write output to `request.output_path`.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

/// Executor that spawns a configured agent command (e.g. `codex exec`).
///
/// The command prefix comes from config; schema and output flags plus `-`
/// (prompt on stdin) are appended.
#[derive(Debug, Clone)]
pub struct AgentCommandExecutor {
    argv: Vec<String>,
}

impl AgentCommandExecutor {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self { argv })
    }
}

impl Executor for AgentCommandExecutor {
    #[instrument(skip_all, fields(program = %self.argv[0], timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting agent");

        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run agent")?;

        write_executor_log(
            &request.executor_log_path,
            &output.render_log("executor"),
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent failed with status {:?}",
                output.status.code()
            ));
        }

        debug!("agent completed successfully");
        Ok(())
    }
}

/// Execute the agent, validate its output against the request's schema and
/// deserialize it as `T`.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load_json<E: Executor + ?Sized, T: DeserializeOwned>(
    executor: &E,
    request: &ExecRequest,
) -> Result<T> {
    executor.exec(request)?;
    ensure_output_exists(&request.output_path)?;
    let value = read_output_json(&request.output_path)?;
    validate_output(&request.output_schema_path, &value)?;
    serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", request.output_path.display()))
}

fn ensure_output_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing executor output {}", path.display()));
    }
    Ok(())
}

fn read_output_json(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read agent output {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Validate an agent output against a JSON Schema (Draft 2020-12).
fn validate_output(schema_path: &Path, instance: &Value) -> Result<()> {
    let schema_contents = fs::read_to_string(schema_path)
        .with_context(|| format!("read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_contents)
        .with_context(|| format!("parse schema {}", schema_path.display()))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "agent output failed schema validation: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn write_executor_log(path: &Path, log: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    if log.len() > output_limit {
        let mut cut = output_limit;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &log[..cut], log.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()));
    }
    fs::write(path, log).with_context(|| format!("write executor log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const SCHEMA: &str = r#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["summary"],
        "properties": {"summary": {"type": "string"}},
        "additionalProperties": false
    }"#;

    #[derive(Debug, Deserialize)]
    struct Summary {
        summary: String,
    }

    struct FakeExecutor {
        output: Option<&'static str>,
    }

    impl Executor for FakeExecutor {
        fn exec(&self, request: &ExecRequest) -> Result<()> {
            if let Some(output) = self.output {
                fs::write(&request.output_path, output)?;
            }
            Ok(())
        }
    }

    fn request(dir: &Path) -> ExecRequest {
        fs::write(dir.join("schema.json"), SCHEMA).expect("write schema");
        ExecRequest {
            workdir: dir.to_path_buf(),
            prompt: "prompt".to_string(),
            output_schema_path: dir.join("schema.json"),
            output_path: dir.join("output.json"),
            executor_log_path: dir.join("executor.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1000,
        }
    }

    #[test]
    fn execute_and_load_reads_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeExecutor {
            output: Some(r#"{"summary": "ok"}"#),
        };
        let output: Summary = execute_and_load_json(&fake, &request(temp.path())).expect("load");
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn execute_and_load_errors_on_missing_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeExecutor { output: None };
        let err = execute_and_load_json::<_, Summary>(&fake, &request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("missing executor output"));
    }

    #[test]
    fn execute_and_load_rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeExecutor {
            output: Some(r#"{"summary": 7}"#),
        };
        let err = execute_and_load_json::<_, Summary>(&fake, &request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn agent_command_receives_prompt_and_writes_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Stand-in agent: ignores flags, echoes a fixed answer to the output path ($4).
        let executor = AgentCommandExecutor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"cat >/dev/null; printf '{"summary":"from agent"}' > "$4""#.to_string(),
            "agent".to_string(),
        ])
        .expect("executor");
        let request = request(temp.path());
        let output: Summary = execute_and_load_json(&executor, &request).expect("load");
        assert_eq!(output.summary, "from agent");
        assert!(request.executor_log_path.exists());
    }

    #[test]
    fn agent_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = AgentCommandExecutor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat >/dev/null; exit 3".to_string(),
        ])
        .expect("executor");
        let err = executor.exec(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("agent failed"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(AgentCommandExecutor::new(Vec::new()).is_err());
    }
}
