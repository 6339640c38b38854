//! Run artifacts under `<log_dir>/<run_id>/`.
//!
//! These are product output, written for every CLI run regardless of
//! `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::core::state::WorkflowRequest;
use crate::engine::WorkflowOutput;

/// Default log directory, relative to the working directory.
pub const DEFAULT_LOG_DIR: &str = ".fixloop/runs";

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub request_path: PathBuf,
    pub output_path: PathBuf,
    pub audit_path: PathBuf,
}

impl RunPaths {
    pub fn new(log_dir: &Path, run_id: &str) -> Self {
        let dir = log_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            dir: dir.clone(),
            request_path: dir.join("request.json"),
            output_path: dir.join("output.json"),
            audit_path: dir.join("audit.log"),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestRecord<'a> {
    request: &'a str,
    target: &'a str,
    max_retries: u32,
}

/// Short content hash (first 8 bytes of SHA-256, hex).
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// `run-<hash of target and request>`, suffixed until unused under `log_dir`.
pub fn generate_run_id(log_dir: &Path, request: &WorkflowRequest) -> Result<String> {
    let hash = content_hash(&format!("{}\n{}", request.target, request.request));
    let base = format!("run-{hash}");
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !log_dir.join(&id).exists() {
            return Ok(id);
        }
    }
    Err(anyhow!(
        "unable to generate unique run id from base '{base}' (too many existing runs)"
    ))
}

/// Persist one finished workflow.
pub fn write_run(
    log_dir: &Path,
    request: &WorkflowRequest,
    output: &WorkflowOutput,
) -> Result<RunPaths> {
    let run_id = generate_run_id(log_dir, request)?;
    let paths = RunPaths::new(log_dir, &run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(
        &paths.request_path,
        &RequestRecord {
            request: &request.request,
            target: &request.target,
            max_retries: request.max_retries,
        },
    )?;
    write_json(&paths.output_path, output)?;
    write_text(&paths.audit_path, &render_audit(output))?;

    info!(run_id = %run_id, dir = %paths.dir.display(), "wrote run log");
    Ok(paths)
}

/// One audit entry per line, then the terminal status.
pub fn render_audit(output: &WorkflowOutput) -> String {
    let mut buf = String::new();
    for entry in &output.audit_log {
        buf.push_str(&entry.to_string());
        buf.push('\n');
    }
    buf.push_str(&format!(
        "status: {} (retries consumed: {})\n",
        output.status.as_str(),
        output.retries_consumed
    ));
    buf
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AuditEntry, Stage, TerminalStatus};

    fn output() -> WorkflowOutput {
        WorkflowOutput {
            status: TerminalStatus::Success,
            answer: Some("3 users".to_string()),
            reason: None,
            last_action: None,
            last_execution: None,
            last_validation: None,
            retries_consumed: 1,
            audit_log: vec![
                AuditEntry::new(Stage::Plan, "planned read-only statement: SELECT 1"),
                AuditEntry::new(Stage::EndSuccess, "success"),
            ],
        }
    }

    #[test]
    fn content_hash_is_short_and_deterministic() {
        let a = content_hash("hello");
        assert_eq!(a.len(), 16);
        assert_eq!(a, content_hash("hello"));
        assert_ne!(a, content_hash("hello!"));
    }

    #[test]
    fn run_ids_are_unique_per_log_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = WorkflowRequest::new("how many users?", "app");
        let first = write_run(temp.path(), &request, &output()).expect("first");
        let second = write_run(temp.path(), &request, &output()).expect("second");
        assert_ne!(first.run_id, second.run_id);
        assert!(second.run_id.starts_with(&first.run_id));
        assert!(second.run_id.ends_with("-2"));
    }

    #[test]
    fn writes_output_and_audit_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = WorkflowRequest::new("how many users?", "app");
        let paths = write_run(temp.path(), &request, &output()).expect("write");

        assert!(paths.request_path.is_file());
        let saved: WorkflowOutput =
            serde_json::from_str(&fs::read_to_string(&paths.output_path).expect("read"))
                .expect("parse");
        assert_eq!(saved, output());
        let audit = fs::read_to_string(&paths.audit_path).expect("read audit");
        assert_eq!(
            audit,
            "plan: planned read-only statement: SELECT 1\nend_success: success\nstatus: success (retries consumed: 1)\n"
        );
    }
}
