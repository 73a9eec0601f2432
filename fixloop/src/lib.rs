//! Autonomous code-repair loop.
//!
//! Each outer iteration asks several builder agents for candidate patches, has a
//! judge pick one and a reviewer refine it, then applies, builds, and tests it.
//! Failures feed the next iteration; a green build commits and ends the run.
//!
//! - **[`core`]**: Pure, deterministic logic (budget ledger, reply classification,
//!   tool permissions, tier bookkeeping, convergence). No I/O.
//! - **[`io`]**: Side-effecting operations (git, processes, LLM transports, config,
//!   memory, iteration artifacts). Isolated behind traits for tests.
//!
//! Orchestration modules ([`session`], [`pipeline`], [`looping`], [`recovery`],
//! [`run`], [`personas`]) coordinate the two to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod personas;
pub mod pipeline;
pub mod recovery;
pub mod run;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
