//! Side-effecting adapters behind the engine's collaborator traits.

pub mod checks;
pub mod config;
pub mod context;
pub mod events;
pub mod git;
pub mod issues;
pub mod parsers;
pub mod process;
pub mod session;
pub mod store;
