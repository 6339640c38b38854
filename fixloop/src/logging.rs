//! Diagnostic tracing for fixloop.
//!
//! Spans cover each workflow step (`stage`, `retry`) and each adapter call
//! (`target_context`, `endpoint`), so `RUST_LOG=fixloop=debug` shows every
//! routing decision, cache hit and backend failure as it happens. Nothing
//! here is persisted: the record a run leaves behind is written by
//! `io::run_log` (`request.json`, `output.json`, `audit.log` under
//! `.fixloop/runs/<run_id>/`) whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber. `RUST_LOG` selects the filter (default
/// `warn`), so stdout stays reserved for answers and `--json` output.
///
/// ```bash
/// RUST_LOG=fixloop::engine=info,fixloop::io::backend=debug fixloop run --target app "how many users?"
/// ```
pub fn init() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_for(directives.as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Invalid or missing directives fall back to `warn`.
fn filter_for(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_warn() {
        assert_eq!(filter_for(None).to_string(), "warn");
    }

    #[test]
    fn uses_rust_log_directives() {
        assert_eq!(
            filter_for(Some("fixloop::engine=info")).to_string(),
            "fixloop::engine=info"
        );
    }

    #[test]
    fn invalid_directives_fall_back_to_warn() {
        assert_eq!(filter_for(Some("fixloop=loud")).to_string(), "warn");
    }
}
