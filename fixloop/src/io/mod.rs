//! Side-effecting adapters: filesystem state, git, processes, providers.

pub mod config;
pub mod git;
pub mod iteration_log;
pub mod layout;
pub mod llm;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod providers;
pub mod repo_tools;
pub mod snapshot;
pub mod toolchain;
