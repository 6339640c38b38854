//! Human approval gate for sensitive actions.
//!
//! The workflow only sees [`ApprovalProvider`]. A provider answers one
//! [`ApprovalRequest`] with an [`ApprovalResponse`]; anything but
//! [`ApprovalResponse::Approved`] rejects the action.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{info, instrument, warn};

/// What a human is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub statement: String,
    pub target: String,
    pub explanation: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResponse {
    Approved,
    Denied { reason: String },
    TimedOut,
    Cancelled,
}

impl ApprovalResponse {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalResponse::Approved)
    }
}

impl fmt::Display for ApprovalResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalResponse::Approved => f.write_str("approved"),
            ApprovalResponse::Denied { reason } => write!(f, "denied: {reason}"),
            ApprovalResponse::TimedOut => f.write_str("approval timed out"),
            ApprovalResponse::Cancelled => f.write_str("approval cancelled"),
        }
    }
}

pub trait ApprovalProvider {
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

impl<T: ApprovalProvider + ?Sized> ApprovalProvider for Arc<T> {
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        (**self).request(request)
    }
}

/// Answers every request the same way. Used for `--approve`/`--deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticApproval {
    ApproveAll,
    DenyAll,
}

impl ApprovalProvider for StaticApproval {
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        match self {
            StaticApproval::ApproveAll => {
                info!(target_context = %request.target, "auto-approved sensitive action");
                ApprovalResponse::Approved
            }
            StaticApproval::DenyAll => ApprovalResponse::Denied {
                reason: "sensitive actions are denied by policy".to_string(),
            },
        }
    }
}

/// Asks on the terminal. Only a literal `yes` approves.
///
/// Lines are read on a helper thread so the timeout can be enforced. The
/// reader is started on first use and shared by later prompts; a line typed
/// after a prompt timed out is discarded before the next prompt. The mutex
/// keeps prompts from concurrent workflows from interleaving.
#[derive(Debug, Default)]
pub struct ConsoleApproval {
    lines: Mutex<Option<Receiver<io::Result<Option<String>>>>>,
}

impl ConsoleApproval {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalProvider for ConsoleApproval {
    #[instrument(skip_all, fields(target_context = %request.target))]
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = lines.get_or_insert_with(spawn_line_reader);
        while rx.try_recv().is_ok() {}

        let mut stderr = io::stderr().lock();
        let shown = writeln!(stderr, "\n{}", render_prompt(request))
            .and_then(|()| write!(stderr, "Type 'yes' to approve, anything else to reject: "))
            .and_then(|()| stderr.flush());
        drop(stderr);
        if let Err(err) = shown {
            warn!(err = %err, "failed to show approval prompt");
            return ApprovalResponse::Cancelled;
        }

        match rx.recv_timeout(request.timeout) {
            Ok(Ok(Some(line))) => parse_answer(&line),
            Ok(Ok(None)) => ApprovalResponse::Cancelled,
            Ok(Err(err)) => {
                warn!(err = %err, "failed to read approval answer");
                ApprovalResponse::Cancelled
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_secs = request.timeout.as_secs(), "approval timed out");
                ApprovalResponse::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => ApprovalResponse::Cancelled,
        }
    }
}

/// Forward stdin lines until EOF (`None`) or a read error.
fn spawn_line_reader() -> Receiver<io::Result<Option<String>>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        loop {
            let mut line = String::new();
            let read = stdin.lock().read_line(&mut line);
            let done = !matches!(read, Ok(n) if n > 0);
            let message = read.map(|n| (n > 0).then_some(line));
            if tx.send(message).is_err() || done {
                break;
            }
        }
    });
    rx
}

/// Approval mode selected on the command line.
#[derive(Debug)]
pub enum ApprovalPolicy {
    Static(StaticApproval),
    Console(ConsoleApproval),
}

impl ApprovalPolicy {
    pub fn from_flags(approve: bool, deny: bool) -> Self {
        if approve {
            ApprovalPolicy::Static(StaticApproval::ApproveAll)
        } else if deny {
            ApprovalPolicy::Static(StaticApproval::DenyAll)
        } else {
            ApprovalPolicy::Console(ConsoleApproval::new())
        }
    }
}

impl ApprovalProvider for ApprovalPolicy {
    fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        match self {
            ApprovalPolicy::Static(provider) => provider.request(request),
            ApprovalPolicy::Console(provider) => provider.request(request),
        }
    }
}

pub fn render_prompt(request: &ApprovalRequest) -> String {
    let mut buf = String::new();
    buf.push_str("============================================================\n");
    buf.push_str("SENSITIVE ACTION REQUIRES APPROVAL\n");
    buf.push_str("============================================================\n");
    buf.push_str(&format!("Target: {}\n", request.target));
    buf.push_str(&format!("Statement: {}\n", request.statement));
    if !request.explanation.trim().is_empty() {
        buf.push_str(&format!("Explanation: {}\n", request.explanation.trim()));
    }
    buf.push_str("This action will modify state.");
    buf
}

/// Only `yes` (any case, surrounding whitespace ignored) approves.
pub fn parse_answer(line: &str) -> ApprovalResponse {
    let answer = line.trim().to_lowercase();
    if answer == "yes" {
        ApprovalResponse::Approved
    } else if answer.is_empty() {
        ApprovalResponse::Denied {
            reason: "no answer given".to_string(),
        }
    } else {
        ApprovalResponse::Denied {
            reason: format!("operator answered '{answer}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            statement: "DELETE FROM sessions".to_string(),
            target: "app".to_string(),
            explanation: "remove stale sessions".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn only_yes_approves() {
        assert_eq!(parse_answer(" YES \n"), ApprovalResponse::Approved);
        assert_eq!(
            parse_answer("y\n"),
            ApprovalResponse::Denied {
                reason: "operator answered 'y'".to_string()
            }
        );
        assert!(!parse_answer("\n").is_approved());
    }

    #[test]
    fn static_policies_answer_consistently() {
        assert!(StaticApproval::ApproveAll.request(&request()).is_approved());
        let denied = StaticApproval::DenyAll.request(&request());
        assert_eq!(
            denied.to_string(),
            "denied: sensitive actions are denied by policy"
        );
    }

    #[test]
    fn policy_from_flags() {
        assert!(matches!(
            ApprovalPolicy::from_flags(true, false),
            ApprovalPolicy::Static(StaticApproval::ApproveAll)
        ));
        assert!(matches!(
            ApprovalPolicy::from_flags(false, true),
            ApprovalPolicy::Static(StaticApproval::DenyAll)
        ));
        assert!(matches!(
            ApprovalPolicy::from_flags(false, false),
            ApprovalPolicy::Console(_)
        ));
    }

    #[test]
    fn prompt_shows_statement_and_explanation() {
        let prompt = render_prompt(&request());
        assert!(prompt.contains("Statement: DELETE FROM sessions"));
        assert!(prompt.contains("Explanation: remove stale sessions"));
        assert!(prompt.contains("Target: app"));
    }

    #[test]
    fn non_approvals_render_verbatim() {
        assert_eq!(ApprovalResponse::TimedOut.to_string(), "approval timed out");
        assert_eq!(ApprovalResponse::Cancelled.to_string(), "approval cancelled");
    }
}
