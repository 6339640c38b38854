//! Side-effecting adapters: processes, agents, backends, approval and files.

pub mod approval;
pub mod backend;
pub mod config;
pub mod executor;
pub mod inference;
pub mod process;
pub mod prompt;
pub mod run_log;
