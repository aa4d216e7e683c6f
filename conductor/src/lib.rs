//! Multi-stage agent pipeline orchestrator.
//!
//! Drives each issue through an ordered list of stages. An agent stage runs
//! a coding agent in a terminal session, then gates its work with
//! deterministic checks and a bounded fix loop; a checks-only stage runs the
//! gate alone. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (gate aggregation, fix
//!   attribution, transition and check-in decisions). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, processes, tmux, git,
//!   the pipeline store, the event log). Each sits behind a trait so tests
//!   can script it.
//!
//! Orchestration modules ([`gate`], [`stage`], [`orchestrator`]) combine the
//! two through the collaborator bundle in [`services`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod services;
pub mod stage;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
