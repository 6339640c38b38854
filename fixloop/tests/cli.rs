//! CLI tests for `fixloop init` and `fixloop run`.
//!
//! Spawns the fixloop binary against a shell stand-in for the agent and a
//! shell target, and verifies exit codes and run-log artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use fixloop::engine::WorkflowOutput;
use fixloop::exit_codes;
use fixloop::io::config::{
    DEFAULT_CONFIG_PATH, FixloopConfig, InferenceConfig, TargetConfig, load_config, write_config,
};

/// Agent that answers by output schema: plan prints `plan_json`, validate
/// always passes and summarize returns a fixed answer.
fn write_agent(dir: &Path, plan_json: &str) -> String {
    let script = format!(
        r#"cat > /dev/null
schema="$2"
out="$4"
if grep -q root_cause "$schema"; then
  echo "debug not expected" >&2
  exit 1
elif grep -q '"issues"' "$schema"; then
  printf '%s' '{{"valid": true, "issues": [], "suggestions": []}}' > "$out"
elif grep -q '"answer"' "$schema"; then
  printf '%s' '{{"answer": "there is 1 user"}}' > "$out"
else
  printf '%s' '{plan_json}' > "$out"
fi
"#
    );
    let path = dir.join("agent.sh");
    fs::write(&path, script).expect("write agent");
    path.display().to_string()
}

fn write_project(dir: &Path, plan_json: &str) {
    let agent = write_agent(dir, plan_json);
    let mut targets = BTreeMap::new();
    targets.insert(
        "app".to_string(),
        TargetConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; echo '[{"n": 1}]'"#.to_string(),
            ],
            ..TargetConfig::default()
        },
    );
    let cfg = FixloopConfig {
        inference: InferenceConfig {
            command: vec!["sh".to_string(), agent],
            timeout_secs: 30,
            transport_retries: 0,
            ..InferenceConfig::default()
        },
        targets,
        ..FixloopConfig::default()
    };
    write_config(&dir.join(DEFAULT_CONFIG_PATH), &cfg).expect("write config");
}

fn fixloop(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fixloop"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run fixloop")
}

fn only_run_dir(dir: &Path) -> std::path::PathBuf {
    let runs: Vec<_> = fs::read_dir(dir.join(".fixloop/runs"))
        .expect("runs dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(runs.len(), 1, "{runs:?}");
    runs.into_iter().next().expect("run dir")
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = fixloop(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let path = temp.path().join(DEFAULT_CONFIG_PATH);
    let cfg = load_config(&path).expect("load config");
    assert_eq!(cfg, FixloopConfig::default());

    fs::write(&path, "max_retries_default = 7\n").expect("edit config");
    let output = fixloop(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load").max_retries_default, 7);

    let output = fixloop(temp.path(), &["init", "--force"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load"), FixloopConfig::default());
}

#[test]
fn run_with_unknown_target_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = fixloop(temp.path(), &["run", "--target", "missing", "how many users?"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown target 'missing'"), "{stderr}");
}

#[test]
fn run_read_only_request_succeeds_and_logs_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(
        temp.path(),
        r#"{"statement": "SELECT count(*) AS n FROM users", "explanation": "count users", "sensitive": false}"#,
    );

    let output = fixloop(temp.path(), &["run", "--target", "app", "how", "many", "users?"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stdout: {stdout}\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("there is 1 user"), "{stdout}");
    assert!(stdout.contains("SELECT count(*) AS n FROM users"), "{stdout}");

    let run_dir = only_run_dir(temp.path());
    let contents = fs::read_to_string(run_dir.join("output.json")).expect("output.json");
    let logged: WorkflowOutput = serde_json::from_str(&contents).expect("parse output");
    assert_eq!(logged.answer.as_deref(), Some("there is 1 user"));
    assert_eq!(logged.retries_consumed, 0);
    let audit = fs::read_to_string(run_dir.join("audit.log")).expect("audit.log");
    assert!(audit.contains("status: success"), "{audit}");
}

#[test]
fn run_sensitive_request_with_deny_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_project(
        temp.path(),
        r#"{"statement": "DELETE FROM users", "explanation": "remove every user", "sensitive": true}"#,
    );

    let output = fixloop(
        temp.path(),
        &["run", "--target", "app", "--deny", "--json", "delete all users"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::REJECTED));
    let printed: WorkflowOutput =
        serde_json::from_slice(&output.stdout).expect("json workflow output");
    assert!(printed.last_execution.is_none());
    assert_eq!(
        printed.reason.as_deref(),
        Some("denied: sensitive actions are denied by policy")
    );
}
