//! Self-correcting execution workflow CLI.
//!
//! Plans a statement for a natural-language request, runs it against a
//! configured target, validates the result and retries through a bounded
//! debug loop. Sensitive statements go through a human approval gate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use fixloop::cache::ResultCache;
use fixloop::core::state::WorkflowRequest;
use fixloop::core::types::TerminalStatus;
use fixloop::engine::{Engine, EngineConfig, WorkflowOutput};
use fixloop::exit_codes;
use fixloop::io::approval::ApprovalPolicy;
use fixloop::io::backend::CommandBackend;
use fixloop::io::config::{DEFAULT_CONFIG_PATH, FixloopConfig, load_config, write_config};
use fixloop::io::executor::AgentCommandExecutor;
use fixloop::io::inference::AgentInference;
use fixloop::io::run_log::{DEFAULT_LOG_DIR, write_run};
use fixloop::logging;

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Self-correcting plan/execute/validate workflow with an approval gate"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.fixloop/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run one request to completion.
    Run {
        #[command(flatten)]
        opts: RunOpts,
        /// Natural-language request.
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,
    },
    /// Run one request per non-empty line of FILE concurrently, sharing one cache.
    Batch {
        #[command(flatten)]
        opts: RunOpts,
        /// Worker threads.
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunOpts {
    /// Target context from `[targets.<name>]`.
    #[arg(short, long)]
    target: String,
    /// Retry budget (defaults to `max_retries_default`).
    #[arg(long)]
    max_retries: Option<u32>,
    /// Approve every sensitive action without asking.
    #[arg(long, conflicts_with = "deny")]
    approve: bool,
    /// Reject every sensitive action without asking.
    #[arg(long)]
    deny: bool,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,
    /// Print the full workflow output as JSON.
    #[arg(long)]
    json: bool,
}

type CliEngine = Engine<CommandBackend, AgentInference<AgentCommandExecutor>, ApprovalPolicy>;

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Run { opts, request } => cmd_run(&opts, request.join(" ")),
        Command::Batch { opts, jobs, file } => cmd_batch(&opts, jobs, &file),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &FixloopConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(opts: &RunOpts, request: String) -> Result<i32> {
    let cfg = load_config(&opts.config)?;
    let engine = build_engine(&cfg, opts)?;
    let request = workflow_request(&cfg, opts, request)?;

    let output = engine.run(request.clone());
    let paths = write_run(&opts.log_dir, &request, &output)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
        eprintln!("run log: {}", paths.dir.display());
    }
    Ok(exit_code(output.status))
}

fn cmd_batch(opts: &RunOpts, jobs: usize, file: &Path) -> Result<i32> {
    let cfg = load_config(&opts.config)?;
    let engine = build_engine(&cfg, opts)?;
    let contents =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let requests = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| workflow_request(&cfg, opts, line.to_string()))
        .collect::<Result<Vec<_>>>()?;
    if requests.is_empty() {
        bail!("{} contains no requests", file.display());
    }

    let outputs = engine.run_all(requests.clone(), jobs);
    for (request, output) in requests.iter().zip(&outputs) {
        write_run(&opts.log_dir, request, output)?;
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else {
        for (request, output) in requests.iter().zip(&outputs) {
            println!("> {}", request.request);
            print_output(output);
            println!();
        }
    }
    eprintln!("cache: {}", engine.cache().stats());

    let code = outputs
        .iter()
        .map(|output| exit_code(output.status))
        .max()
        .unwrap_or(exit_codes::OK);
    Ok(code)
}

fn build_engine(cfg: &FixloopConfig, opts: &RunOpts) -> Result<CliEngine> {
    if !cfg.targets.contains_key(&opts.target) {
        bail!(
            "unknown target '{}' (add [targets.{}] to {})",
            opts.target,
            opts.target,
            opts.config.display()
        );
    }
    let executor = AgentCommandExecutor::new(cfg.inference.command.clone())?;
    let inference = AgentInference::new(executor, &cfg.inference)?;
    let backend = CommandBackend::new(cfg.targets.clone());
    let approval = ApprovalPolicy::from_flags(opts.approve, opts.deny);
    let cache = Arc::new(ResultCache::new(cfg.cache_capacity_bytes));
    Ok(
        Engine::new(cache, backend, inference, approval).with_config(EngineConfig {
            approval_timeout: cfg.approval_timeout(),
        }),
    )
}

fn workflow_request(
    cfg: &FixloopConfig,
    opts: &RunOpts,
    request: String,
) -> Result<WorkflowRequest> {
    if request.trim().is_empty() {
        bail!("request must not be empty");
    }
    let max_retries = opts.max_retries.unwrap_or(cfg.max_retries_default);
    Ok(WorkflowRequest::new(request, opts.target.clone()).with_max_retries(max_retries))
}

fn print_output(output: &WorkflowOutput) {
    match output.status {
        TerminalStatus::Success => {
            println!("{}", output.answer.as_deref().unwrap_or_default());
        }
        TerminalStatus::Rejected | TerminalStatus::Failure => {
            println!(
                "{}: {}",
                output.status.as_str(),
                output.reason.as_deref().unwrap_or("no reason recorded")
            );
        }
    }
    if let Some(action) = &output.last_action {
        println!("statement: {}", action.statement);
    }
    if output.retries_consumed > 0 {
        println!("retries: {}", output.retries_consumed);
    }
}

fn exit_code(status: TerminalStatus) -> i32 {
    match status {
        TerminalStatus::Success => exit_codes::OK,
        TerminalStatus::Rejected => exit_codes::REJECTED,
        TerminalStatus::Failure => exit_codes::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["fixloop", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false, .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["fixloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_joins_request_words() {
        let cli = Cli::parse_from([
            "fixloop",
            "run",
            "--target",
            "app",
            "--max-retries",
            "5",
            "--approve",
            "how",
            "many",
            "users?",
        ]);
        let Command::Run { opts, request } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.target, "app");
        assert_eq!(opts.max_retries, Some(5));
        assert!(opts.approve);
        assert_eq!(request.join(" "), "how many users?");
        assert_eq!(opts.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn approve_and_deny_conflict() {
        let result = Cli::try_parse_from([
            "fixloop", "run", "--target", "app", "--approve", "--deny", "q",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_batch_jobs() {
        let cli = Cli::parse_from([
            "fixloop",
            "batch",
            "--target",
            "app",
            "--jobs",
            "8",
            "requests.txt",
        ]);
        let Command::Batch { jobs, file, .. } = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(jobs, 8);
        assert_eq!(file, PathBuf::from("requests.txt"));
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_code(TerminalStatus::Success), exit_codes::OK);
        assert_eq!(exit_code(TerminalStatus::Rejected), exit_codes::REJECTED);
        assert_eq!(exit_code(TerminalStatus::Failure), exit_codes::FAILURE);
    }
}
