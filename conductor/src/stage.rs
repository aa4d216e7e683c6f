//! Stage Execution Engine.
//!
//! One invocation runs the current stage attempt of one pipeline to a
//! `success`/`fail` [`RunResult`]. Checks-only stages run one gate
//! (auto-fixes included) and stop. Agent stages go through:
//!
//! 1. checks-before (abort on failure, agent never started)
//! 2. agent turn (new or resumed session), plus a commit nudge
//! 3. gate over the stage's after/extra checks
//! 4. bounded fix loop, switching to fresh sessions past a threshold
//! 5. cleanup: kill the session and persist its output
//!
//! Check failures, agent exits and timeouts are outcomes, not errors. `Err`
//! is reserved for infrastructure trouble and broken setup.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::fix::{FixTracker, render_fix_prompt};
use crate::core::gate::GateResult;
use crate::core::types::{
    RunResult, SessionHandle, SessionMeta, SessionState, StageOutcome, StageType, WaitOutcome,
};
use crate::gate::{GateOptions, run_gate};
use crate::io::checks::duration_ms;
use crate::io::config::{CheckConfig, PipelineConfig, StageConfig};
use crate::io::events::{EventKind, PipelineEvent, emit, emit_check_runs};
use crate::io::session::SessionSpec;
use crate::io::store::AttemptKey;
use crate::services::Services;
use crate::state::PipelineState;

/// Steering message sent when an agent stops with uncommitted changes.
pub const COMMIT_NUDGE: &str = "You left uncommitted changes in the working tree. \
Commit them now with a descriptive message, then stop.";

/// Run the current stage attempt of `issue`.
#[instrument(skip_all, fields(issue))]
pub fn run_stage(services: &Services<'_>, config: &PipelineConfig, issue: &str) -> Result<RunResult> {
    let state = services.store.get(issue)?;
    let stage = config.stage(&state.current_stage)?;
    info!(stage = %stage.id, attempt = state.current_attempt, "running stage");
    let mut run = StageRun::new(*services, config, stage, state);
    let result = run.execute();
    run.cleanup();
    result
}

struct StageRun<'a> {
    services: Services<'a>,
    config: &'a PipelineConfig,
    stage: &'a StageConfig,
    state: PipelineState,
    key: AttemptKey,
    session: Option<SessionMeta>,
    tracker: FixTracker,
    fix_rounds: u32,
    started: Instant,
    agent_time: Duration,
}

impl<'a> StageRun<'a> {
    fn new(
        services: Services<'a>,
        config: &'a PipelineConfig,
        stage: &'a StageConfig,
        state: PipelineState,
    ) -> Self {
        let key = AttemptKey::new(&state.issue, &stage.id, state.current_attempt);
        Self {
            services,
            config,
            stage,
            state,
            key,
            session: None,
            tracker: FixTracker::new(),
            fix_rounds: 0,
            started: Instant::now(),
            agent_time: Duration::ZERO,
        }
    }

    fn execute(&mut self) -> Result<RunResult> {
        self.emit(EventKind::StageStarted, format!("type={:?}", self.stage.kind));

        let checks = self.config.checks_for(&self.stage.gate_checks())?;

        if self.stage.kind == StageType::ChecksOnly {
            let gate = self.gate(&checks, 0)?;
            self.tracker.observe(&gate);
            if gate.passed {
                return Ok(self.finish(StageOutcome::Success, None, true));
            }
            let reason = format!("checks failed: {}", gate.failing_names().join(", "));
            return Ok(self.finish(StageOutcome::Fail, Some(reason), false));
        }

        if !self.stage.checks_before.is_empty() {
            let before = self.config.checks_for(&self.stage.checks_before)?;
            let gate = self.gate(&before, 0)?;
            self.tracker.observe(&gate);
            if !gate.passed {
                let failing = gate.failing_names().join(", ");
                warn!(failing = %failing, "checks before stage failed");
                self.emit(EventKind::ChecksBeforeFailed, failing.clone());
                return Ok(self.finish(
                    StageOutcome::Fail,
                    Some(format!("checks before stage failed: {failing}")),
                    false,
                ));
            }
        }

        if let Some(reason) = self.agent_turn()? {
            return Ok(self.finish(StageOutcome::Fail, Some(reason), false));
        }

        let gate = self.gate(&checks, 0)?;
        self.tracker.observe(&gate);
        if gate.passed {
            return Ok(self.finish(StageOutcome::Success, None, true));
        }
        self.fix_loop(&checks, gate)
    }

    /// Run the main agent turn. `Some(reason)` means the attempt failed.
    fn agent_turn(&mut self) -> Result<Option<String>> {
        let sessions = self.services.sessions;
        let poll = self.config.poll_interval();
        let turn_started = Instant::now();

        let outcome = match self.resumable_session()? {
            Some((meta, SessionState::Idle)) => {
                info!(session = %meta.handle, "resumed session is idle; turn already complete");
                self.session = Some(meta);
                WaitOutcome::Idle
            }
            Some((meta, _)) => {
                info!(session = %meta.handle, "waiting on resumed session");
                let handle = meta.handle.clone();
                self.session = Some(meta);
                sessions.wait_idle(&handle, self.stage.timeout, poll)?
            }
            None => {
                let prompt = self.prompt()?;
                self.services.store.save_prompt(&self.key, &prompt)?;
                let handle = self.open_session(None)?;
                sessions.send(&handle, &prompt)?;
                sessions.wait_idle(&handle, self.stage.timeout, poll)?
            }
        };
        self.agent_time += turn_started.elapsed();

        match outcome {
            WaitOutcome::Idle => {
                self.nudge_commit();
                Ok(None)
            }
            WaitOutcome::Exited => Ok(Some("agent session exited".to_string())),
            WaitOutcome::TimedOut => Ok(Some(format!(
                "agent did not finish within {}s",
                self.stage.timeout.as_secs()
            ))),
        }
    }

    /// The prompt already built for this attempt, or a freshly built one.
    fn prompt(&self) -> Result<String> {
        let context = self.services.context;
        let earlier =
            context.read_context(&self.state.issue, &self.stage.id, self.state.current_attempt)?;
        if let Some(prompt) = earlier {
            debug!("reusing prompt built earlier for this attempt");
            return Ok(prompt);
        }
        let issue = self.services.issues.fetch(&self.state.issue)?;
        context.build(&self.state, self.stage, &issue)
    }

    /// The recorded session, if it was opened for this exact attempt and is
    /// still alive.
    fn resumable_session(&mut self) -> Result<Option<(SessionMeta, SessionState)>> {
        let Some(meta) = self.state.current_session.clone() else {
            return Ok(None);
        };
        if meta.fix_round.is_some()
            || !meta.belongs_to(&self.state.issue, &self.stage.id, self.state.current_attempt)
        {
            return Ok(None);
        }
        let status = self.services.sessions.status(&meta.handle)?;
        match status.state {
            SessionState::Idle | SessionState::Started | SessionState::Active => {
                Ok(Some((meta, status.state)))
            }
            SessionState::Exited => {
                debug!(session = %meta.handle, "recorded session exited; starting a new one");
                self.session = Some(meta);
                self.close_session();
                Ok(None)
            }
            SessionState::Missing => Ok(None),
        }
    }

    fn fix_loop(&mut self, checks: &[CheckConfig], mut gate: GateResult) -> Result<RunResult> {
        let sessions = self.services.sessions;
        let poll = self.config.poll_interval();

        for round in 1..=self.stage.max_fix_rounds {
            self.fix_rounds = round;
            self.emit(
                EventKind::FixRoundStart,
                format!("round {round}: {}", gate.failing_names().join(", ")),
            );
            let fresh = round > self.stage.fresh_session_after || self.session.is_none();
            let prompt = render_fix_prompt(&self.stage.id, round, &gate.failures, fresh);
            let turn_started = Instant::now();

            let handle = if fresh {
                self.close_session();
                self.services
                    .store
                    .save_prompt(&self.key.with_round(round), &prompt)?;
                self.open_session(Some(round))?
            } else {
                self.record_session(round)?;
                self.current_handle()?
            };
            info!(round, fresh, "fix round");
            sessions.send(&handle, &prompt)?;
            let outcome = sessions.wait_idle(&handle, self.stage.timeout, poll)?;
            self.agent_time += turn_started.elapsed();

            match outcome {
                WaitOutcome::Idle => self.nudge_commit(),
                WaitOutcome::Exited => {
                    warn!(round, "agent session exited during fix round");
                    self.close_session();
                }
                WaitOutcome::TimedOut => warn!(round, "agent did not finish fix round in time"),
            }

            gate = self.gate(checks, round)?;
            self.tracker.observe(&gate);
            if gate.passed {
                return Ok(self.finish(StageOutcome::Success, None, false));
            }
        }

        self.emit(
            EventKind::FixLoopExhausted,
            format!(
                "after {} round(s): {}",
                self.fix_rounds,
                gate.failing_names().join(", ")
            ),
        );
        Ok(self.finish(
            StageOutcome::Fail,
            Some("fix loop exhausted".to_string()),
            false,
        ))
    }

    fn gate(&self, checks: &[CheckConfig], fix_round: u32) -> Result<GateResult> {
        let run = run_gate(
            self.services.checks,
            &self.workdir(),
            checks,
            &GateOptions {
                continue_on_failure: true,
                fix_round,
            },
        )?;
        emit_check_runs(
            self.services.events,
            &self.state.issue,
            &self.stage.id,
            self.state.current_attempt,
            &run.runs,
        );
        Ok(run.result)
    }

    fn open_session(&mut self, fix_round: Option<u32>) -> Result<SessionHandle> {
        let meta = self.services.sessions.create(&SessionSpec {
            issue: self.state.issue.clone(),
            stage: self.stage.id.clone(),
            attempt: self.state.current_attempt,
            fix_round,
            workdir: self.workdir(),
            model: self.stage.model.clone(),
        })?;
        let handle = meta.handle.clone();
        self.session = Some(meta);
        self.record_session(fix_round.unwrap_or(0))?;
        Ok(handle)
    }

    /// Persist the live session and fix round so check-in ticks can see them.
    /// Fails with [`Superseded`](crate::error::Superseded) once the pipeline
    /// has left this attempt.
    fn record_session(&self, fix_round: u32) -> Result<()> {
        let session = self.session.clone();
        self.services.store.update(&self.state.issue, &mut |state| {
            state.ensure_at(&self.stage.id, self.state.current_attempt)?;
            if state.current_session != session {
                state.wrap_up_sent = false;
            }
            state.current_session = session.clone();
            state.current_fix_round = fix_round;
            Ok(())
        })?;
        Ok(())
    }

    fn current_handle(&self) -> Result<SessionHandle> {
        self.session
            .as_ref()
            .map(|meta| meta.handle.clone())
            .ok_or_else(|| anyhow::anyhow!("no live session for stage '{}'", self.stage.id))
    }

    /// Ask the agent to commit leftovers. Failures are logged, never fatal.
    fn nudge_commit(&mut self) {
        let Some(handle) = self.session.as_ref().map(|meta| meta.handle.clone()) else {
            return;
        };
        let workdir = self.workdir();
        match self.services.workspace.has_uncommitted_changes(&workdir) {
            Ok(false) => {}
            Ok(true) => {
                info!("uncommitted changes after agent turn; nudging");
                let sessions = self.services.sessions;
                let started = Instant::now();
                let waited = sessions.steer(&handle, COMMIT_NUDGE).and_then(|()| {
                    sessions.wait_idle(&handle, self.stage.timeout, self.config.poll_interval())
                });
                self.agent_time += started.elapsed();
                match waited {
                    Ok(WaitOutcome::Idle) => {}
                    Ok(other) => warn!(outcome = ?other, "agent did not settle after commit nudge"),
                    Err(err) => warn!(err = %err, "commit nudge failed"),
                }
            }
            Err(err) => warn!(err = %err, "could not inspect working tree"),
        }
    }

    /// Kill the live session, if any, and persist its output.
    fn close_session(&mut self) {
        let Some(meta) = self.session.take() else {
            return;
        };
        let key = self.key.with_round(meta.fix_round.unwrap_or(0));
        match self.services.sessions.kill(&meta.handle) {
            Ok(log) => {
                if let Err(err) = self.services.store.save_session_log(&key, &log) {
                    warn!(session = %meta.handle, err = %err, "failed to save session log");
                }
            }
            Err(err) => warn!(session = %meta.handle, err = %err, "failed to kill session"),
        }
    }

    fn cleanup(&mut self) {
        self.close_session();
    }

    fn finish(&self, outcome: StageOutcome, reason: Option<String>, checks_first_pass: bool) -> RunResult {
        let result = RunResult {
            outcome,
            checks: self.tracker.status().clone(),
            auto_fixes: self.tracker.auto_fixes().clone(),
            agent_fixes: self.tracker.agent_fixes().clone(),
            fix_rounds: self.fix_rounds,
            checks_first_pass,
            agent_duration_ms: duration_ms(self.agent_time),
            total_duration_ms: duration_ms(self.started.elapsed()),
            reason,
        };
        info!(summary = %result.summary(), "stage finished");
        result
    }

    fn workdir(&self) -> PathBuf {
        self.state.workdir.clone()
    }

    fn emit(&self, kind: EventKind, detail: String) {
        emit(
            self.services.events,
            PipelineEvent::new(&self.state.issue, kind)
                .at(&self.stage.id, self.state.current_attempt)
                .detail(detail),
        );
    }
}
