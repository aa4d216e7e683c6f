//! Collaborators the engine talks to.

use crate::io::checks::CheckRunner;
use crate::io::context::ContextBuilder;
use crate::io::events::EventLog;
use crate::io::git::Workspace;
use crate::io::issues::IssueTracker;
use crate::io::session::SessionManager;
use crate::io::store::PipelineStore;

/// Borrowed trait objects for every external collaborator.
///
/// The CLI wires the shipped adapters in; tests wire scripted ones.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub sessions: &'a dyn SessionManager,
    pub checks: &'a dyn CheckRunner,
    pub store: &'a dyn PipelineStore,
    pub context: &'a dyn ContextBuilder,
    pub events: &'a dyn EventLog,
    pub issues: &'a dyn IssueTracker,
    pub workspace: &'a dyn Workspace,
}
