//! Self-correcting execution workflow with a bounded retry budget, a human
//! approval gate and a memory-bounded LRU result cache.
//!
//! A request is planned into an executable statement, optionally approved,
//! executed against a target context, validated, and on failure debugged and
//! retried until it succeeds or the retry budget runs out. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (entities, state merging, routing).
//!   No I/O, fully testable in isolation.
//! - **[`cache`]**: The shared, thread-safe result cache.
//! - **[`io`]**: Side-effecting adapters (backend processes, agent calls,
//!   approval prompts, config and run logs). Isolated behind traits.
//!
//! [`steps`] and [`engine`] coordinate core logic with the adapters.

pub mod cache;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
