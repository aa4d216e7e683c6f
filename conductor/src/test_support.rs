//! Test-only scripted collaborators and a temp-dir harness.
//!
//! The store, event log, and context builder are the real file-backed
//! adapters rooted in a temp dir; sessions, checks, issues, and the
//! workspace are scripted.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::naming::session_name;
use crate::core::types::{SessionHandle, SessionMeta, SessionState, SessionStatus, WaitOutcome};
use crate::io::checks::{CheckRun, CheckRunner, TIMEOUT_SUMMARY};
use crate::io::config::{CheckConfig, PipelineConfig, parse_config};
use crate::io::context::TemplateContextBuilder;
use crate::io::events::{JsonlEventLog, PipelineEvent, read_events};
use crate::io::git::Workspace;
use crate::io::issues::{Issue, IssueTracker};
use crate::io::session::{SessionManager, SessionSpec};
use crate::io::store::FsStore;
use crate::orchestrator::Orchestrator;
use crate::services::Services;

/// One scripted check execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckScript {
    Pass,
    /// Fails with the given parser summary.
    Fail(String),
    Timeout,
    /// The check cannot be executed at all.
    Error,
}

impl CheckScript {
    pub fn fail(summary: &str) -> Self {
        CheckScript::Fail(summary.to_string())
    }
}

/// Check runner that replays per-check scripts.
///
/// Each check consumes its script front to back and then keeps repeating
/// the last entry. Unscripted checks pass.
#[derive(Debug, Default)]
pub struct ScriptedChecks {
    scripts: RefCell<BTreeMap<String, VecDeque<CheckScript>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, name: &str, script: impl IntoIterator<Item = CheckScript>) -> Self {
        self.set(name, script);
        self
    }

    pub fn set(&self, name: &str, script: impl IntoIterator<Item = CheckScript>) {
        self.scripts
            .borrow_mut()
            .insert(name.to_string(), script.into_iter().collect());
    }

    /// `run <name>` and `fix <name>` in execution order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn next(&self, name: &str) -> CheckScript {
        let mut scripts = self.scripts.borrow_mut();
        match scripts.get_mut(name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(CheckScript::Pass),
            Some(queue) => queue.front().cloned().unwrap_or(CheckScript::Pass),
            None => CheckScript::Pass,
        }
    }
}

impl CheckRunner for ScriptedChecks {
    fn run_check(&self, _workdir: &Path, check: &CheckConfig) -> Result<CheckRun> {
        self.calls.borrow_mut().push(format!("run {}", check.name));
        let (passed, timed_out, summary) = match self.next(&check.name) {
            CheckScript::Pass => (true, false, String::new()),
            CheckScript::Fail(summary) => (false, false, summary),
            CheckScript::Timeout => (false, true, TIMEOUT_SUMMARY.to_string()),
            CheckScript::Error => {
                return Err(anyhow!("execute check '{}': command not found", check.name));
            }
        };
        Ok(CheckRun {
            name: check.name.clone(),
            passed,
            exit_code: (!timed_out).then_some(if passed { 0 } else { 1 }),
            timed_out,
            duration_ms: 1,
            output: summary.clone(),
            summary,
            fix_round: 0,
            recheck: false,
        })
    }

    fn run_fix(&self, _workdir: &Path, check: &CheckConfig) -> Result<()> {
        self.calls.borrow_mut().push(format!("fix {}", check.name));
        Ok(())
    }
}

/// Delegates to scripted checks, running `during` once just before the
/// first check executes.
pub struct InterleavedChecks<'a> {
    inner: &'a ScriptedChecks,
    during: RefCell<Option<Box<dyn FnOnce() + 'a>>>,
}

impl<'a> InterleavedChecks<'a> {
    pub fn new(inner: &'a ScriptedChecks, during: impl FnOnce() + 'a) -> Self {
        Self {
            inner,
            during: RefCell::new(Some(Box::new(during))),
        }
    }
}

impl CheckRunner for InterleavedChecks<'_> {
    fn run_check(&self, workdir: &Path, check: &CheckConfig) -> Result<CheckRun> {
        let during = self.during.borrow_mut().take();
        if let Some(during) = during {
            during();
        }
        self.inner.run_check(workdir, check)
    }

    fn run_fix(&self, workdir: &Path, check: &CheckConfig) -> Result<()> {
        self.inner.run_fix(workdir, check)
    }
}

/// In-memory session manager.
///
/// `wait_idle` returns queued outcomes, then `Idle`. Nothing sleeps.
#[derive(Debug, Default)]
pub struct ScriptedSessions {
    created: RefCell<Vec<SessionMeta>>,
    states: RefCell<BTreeMap<String, SessionState>>,
    human: RefCell<BTreeMap<String, bool>>,
    waits: RefCell<VecDeque<WaitOutcome>>,
    sent: RefCell<Vec<(String, String)>>,
    steered: RefCell<Vec<(String, String)>>,
    killed: RefCell<Vec<String>>,
    fail_create: Cell<bool>,
}

impl ScriptedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_wait(&self, outcome: WaitOutcome) {
        self.waits.borrow_mut().push_back(outcome);
    }

    pub fn set_state(&self, handle: &SessionHandle, state: SessionState) {
        self.states.borrow_mut().insert(handle.0.clone(), state);
    }

    pub fn set_human(&self, handle: &SessionHandle, active: bool) {
        self.human.borrow_mut().insert(handle.0.clone(), active);
    }

    /// Make the next `create` fail as if the terminal multiplexer were gone.
    pub fn fail_next_create(&self) {
        self.fail_create.set(true);
    }

    pub fn created(&self) -> Vec<SessionMeta> {
        self.created.borrow().clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }

    pub fn steered(&self) -> Vec<(String, String)> {
        self.steered.borrow().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.borrow().clone()
    }

    fn state(&self, handle: &SessionHandle) -> SessionState {
        self.states
            .borrow()
            .get(handle.as_str())
            .copied()
            .unwrap_or(SessionState::Missing)
    }
}

impl SessionManager for ScriptedSessions {
    fn create(&self, spec: &SessionSpec) -> Result<SessionMeta> {
        if self.fail_create.replace(false) {
            return Err(anyhow!("tmux new-session failed: no server running"));
        }
        let name = session_name(&spec.issue, &spec.stage, spec.attempt, spec.fix_round);
        let meta = SessionMeta {
            handle: SessionHandle(name.clone()),
            name,
            issue: spec.issue.clone(),
            stage: spec.stage.clone(),
            attempt: spec.attempt,
            fix_round: spec.fix_round,
            created_at: Utc::now(),
        };
        self.set_state(&meta.handle, SessionState::Started);
        self.created.borrow_mut().push(meta.clone());
        Ok(meta)
    }

    fn send(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        if matches!(self.state(handle), SessionState::Exited | SessionState::Missing) {
            return Err(anyhow!("session {handle} is not running"));
        }
        self.sent.borrow_mut().push((handle.0.clone(), text.to_string()));
        self.set_state(handle, SessionState::Active);
        Ok(())
    }

    fn steer(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        self.steered
            .borrow_mut()
            .push((handle.0.clone(), text.to_string()));
        Ok(())
    }

    fn wait_idle(&self, handle: &SessionHandle, _timeout: Duration, _poll: Duration) -> Result<WaitOutcome> {
        let outcome = self.waits.borrow_mut().pop_front().unwrap_or(WaitOutcome::Idle);
        let state = match outcome {
            WaitOutcome::Idle => SessionState::Idle,
            WaitOutcome::Exited => SessionState::Exited,
            WaitOutcome::TimedOut => SessionState::Active,
        };
        self.set_state(handle, state);
        Ok(outcome)
    }

    fn kill(&self, handle: &SessionHandle) -> Result<String> {
        self.killed.borrow_mut().push(handle.0.clone());
        let existed = self.state(handle) != SessionState::Missing;
        self.set_state(handle, SessionState::Missing);
        Ok(if existed {
            format!("output of {handle}\n")
        } else {
            String::new()
        })
    }

    fn status(&self, handle: &SessionHandle) -> Result<SessionStatus> {
        Ok(SessionStatus {
            state: self.state(handle),
            started_at: None,
            last_activity: None,
        })
    }

    fn detect_human_activity(&self, handle: &SessionHandle) -> Result<bool> {
        Ok(self.human.borrow().get(handle.as_str()).copied().unwrap_or(false))
    }
}

/// Issue tracker that knows every issue id.
#[derive(Debug, Default)]
pub struct StaticIssues;

impl IssueTracker for StaticIssues {
    fn fetch(&self, id: &str) -> Result<Issue> {
        Ok(Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            body: format!("Body of issue {id}."),
        })
    }
}

/// Plain directories instead of git worktrees.
#[derive(Debug)]
pub struct FakeWorkspace {
    root: PathBuf,
    dirty: RefCell<VecDeque<bool>>,
    removed: RefCell<Vec<PathBuf>>,
}

impl FakeWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirty: RefCell::new(VecDeque::new()),
            removed: RefCell::new(Vec::new()),
        }
    }

    /// Queue the answer for the next uncommitted-changes check (default clean).
    pub fn push_dirty(&self, dirty: bool) {
        self.dirty.borrow_mut().push_back(dirty);
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.borrow().clone()
    }
}

impl Workspace for FakeWorkspace {
    fn provision(&self, issue: &str, _branch: &str) -> Result<PathBuf> {
        let path = self.root.join(issue);
        if path.exists() {
            return Err(anyhow!("working copy {} already exists", path.display()));
        }
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(path)
    }

    fn has_uncommitted_changes(&self, _workdir: &Path) -> Result<bool> {
        Ok(self.dirty.borrow_mut().pop_front().unwrap_or(false))
    }

    fn remove(&self, workdir: &Path) -> Result<()> {
        if workdir.exists() {
            fs::remove_dir_all(workdir).with_context(|| format!("remove {}", workdir.display()))?;
        }
        self.removed.borrow_mut().push(workdir.to_path_buf());
        Ok(())
    }
}

/// Everything an orchestrator needs, rooted in a temp dir.
pub struct Harness {
    pub config: PipelineConfig,
    pub sessions: ScriptedSessions,
    pub checks: ScriptedChecks,
    pub issues: StaticIssues,
    pub workspace: FakeWorkspace,
    pub store: FsStore,
    pub context: TemplateContextBuilder,
    pub events: JsonlEventLog,
    dir: TempDir,
}

impl Harness {
    /// Build a harness from TOML pipeline config text.
    pub fn new(config: &str) -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let config = parse_config(config, dir.path())?;
        let state_dir = config.state_dir();
        Ok(Self {
            sessions: ScriptedSessions::new(),
            checks: ScriptedChecks::new(),
            issues: StaticIssues,
            workspace: FakeWorkspace::new(dir.path().join("wt")),
            store: FsStore::new(&state_dir),
            context: TemplateContextBuilder::new(state_dir.join("context")),
            events: JsonlEventLog::new(&state_dir),
            config,
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            sessions: &self.sessions,
            checks: &self.checks,
            store: &self.store,
            context: &self.context,
            events: &self.events,
            issues: &self.issues,
            workspace: &self.workspace,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(self.services(), &self.config)
    }

    /// An orchestrator whose stage runs use `checks` instead of the scripted
    /// runner.
    pub fn orchestrator_with_checks<'a>(&'a self, checks: &'a dyn CheckRunner) -> Orchestrator<'a> {
        Orchestrator::new(
            Services {
                checks,
                ..self.services()
            },
            &self.config,
        )
    }

    /// Open a scripted session for a stage attempt and put it in `state`.
    pub fn attach_session(&self, issue: &str, stage: &str, attempt: u32, state: SessionState) -> SessionMeta {
        let spec = SessionSpec {
            issue: issue.to_string(),
            stage: stage.to_string(),
            attempt,
            fix_round: None,
            workdir: self.workspace.root.join(issue),
            model: None,
        };
        let meta = match self.sessions.create(&spec) {
            Ok(meta) => meta,
            Err(err) => panic!("scripted session create failed: {err:#}"),
        };
        self.sessions.set_state(&meta.handle, state);
        meta
    }

    pub fn attempt_dir(&self, issue: &str, stage: &str, attempt: u32) -> PathBuf {
        self.config
            .state_dir()
            .join("pipelines")
            .join(issue)
            .join("attempts")
            .join(format!("{stage}-{attempt}"))
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        match read_events(self.events.events_path()) {
            Ok(events) => events,
            Err(err) => panic!("read events: {err:#}"),
        }
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| event.event.as_str().to_string())
            .collect()
    }
}
