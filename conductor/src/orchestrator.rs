//! Pipeline State Machine.
//!
//! Owns the lifecycle `pending → in_progress → {completed | failed | blocked}`.
//! Every status change goes through the store's locked read-modify-write.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::checkin::{CheckInDecision, CheckInInput, SkipReason, decide_check_in};
use crate::core::transition::{Transition, TransitionInput, decide};
use crate::core::types::{PipelineStatus, RunResult, SessionState};
use crate::error::{PreconditionError, Superseded};
use crate::io::config::PipelineConfig;
use crate::io::context::Checkpoint;
use crate::io::events::{EventKind, PipelineEvent, emit};
use crate::io::store::{AttemptKey, validate_issue_id};
use crate::services::Services;
use crate::stage::run_stage;
use crate::state::{PipelineState, StageHistoryEntry};

/// Steering message for a session that ran past its stage timeout.
pub const WRAP_UP: &str = "You are over the time budget for this stage. \
Wrap up now: finish the change you are making, commit, and stop.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceAction {
    Advanced,
    Completed,
    Retry,
    Routed,
    Escalated,
    Failed,
    /// The pipeline moved on while the stage ran; the result was not applied.
    Superseded,
}

impl AdvanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AdvanceAction::Advanced => "advanced",
            AdvanceAction::Completed => "completed",
            AdvanceAction::Retry => "retry",
            AdvanceAction::Routed => "routed",
            AdvanceAction::Escalated => "escalated",
            AdvanceAction::Failed => "failed",
            AdvanceAction::Superseded => "superseded",
        }
    }
}

impl fmt::Display for AdvanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one Advance did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceReport {
    pub issue: String,
    pub action: AdvanceAction,
    /// Stage that ran (or, for a no-op, the stage the pipeline rests on).
    pub stage: String,
    pub attempt: u32,
    pub message: String,
    /// `None` when the pipeline was already terminal.
    pub run: Option<RunResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInAction {
    Skipped(SkipReason),
    Steered,
    Advanced(AdvanceReport),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInReport {
    pub issue: String,
    pub action: CheckInAction,
}

impl fmt::Display for CheckInReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            CheckInAction::Skipped(reason) => write!(f, "{}: skip ({reason})", self.issue),
            CheckInAction::Steered => write!(f, "{}: steer (wrap-up sent)", self.issue),
            CheckInAction::Advanced(report) => {
                write!(f, "{}: {} ({})", self.issue, report.action, report.message)
            }
            CheckInAction::Error(err) => write!(f, "{}: error ({err})", self.issue),
        }
    }
}

pub struct Orchestrator<'a> {
    services: Services<'a>,
    config: &'a PipelineConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(services: Services<'a>, config: &'a PipelineConfig) -> Self {
        Self { services, config }
    }

    /// Fetch the issue, provision its working copy, and persist a pending
    /// pipeline at the first stage.
    #[instrument(skip_all, fields(issue))]
    pub fn create(&self, issue: &str) -> Result<PipelineState> {
        validate_issue_id(issue)?;
        match self.services.store.get(issue) {
            Ok(_) => return Err(PreconditionError::PipelineExists(issue.to_string()).into()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
        let first = self.config.first_stage()?;
        let meta = self.services.issues.fetch(issue)?;
        let branch = self.config.branch_for(issue);
        let workdir = self.services.workspace.provision(issue, &branch)?;
        let state = PipelineState::new(
            issue,
            &meta.title,
            &branch,
            workdir,
            &first.id,
            &self.config.goal_gate_stages(),
            Utc::now(),
        );
        self.services.store.create(&state)?;
        info!(stage = %first.id, "pipeline created");
        emit(
            self.services.events,
            PipelineEvent::new(issue, EventKind::Created)
                .at(&first.id, 1)
                .detail(meta.title),
        );
        Ok(state)
    }

    /// Run the current stage once and move the pipeline accordingly.
    ///
    /// Holds the issue's advance lease for the whole run, so a second
    /// advance on the same issue fails fast with `AdvanceInProgress`.
    #[instrument(skip_all, fields(issue))]
    pub fn advance(&self, issue: &str) -> Result<AdvanceReport> {
        let Some(_lease) = self.services.store.lease(issue)? else {
            return Err(PreconditionError::AdvanceInProgress(issue.to_string()).into());
        };
        let state = self.services.store.get(issue)?;
        if state.is_terminal() {
            info!(status = %state.status, "pipeline already terminal");
            let action = if state.status == PipelineStatus::Completed {
                AdvanceAction::Completed
            } else {
                AdvanceAction::Failed
            };
            return Ok(AdvanceReport {
                issue: issue.to_string(),
                action,
                stage: state.current_stage,
                attempt: state.current_attempt,
                message: format!("pipeline already {}", state.status),
                run: None,
            });
        }

        let stage = state.current_stage.clone();
        let attempt = state.current_attempt;
        self.config.stage(&stage)?;
        self.services.store.update(issue, &mut |s| {
            s.ensure_at(&stage, attempt)?;
            s.status = PipelineStatus::InProgress;
            s.last_error = None;
            Ok(())
        })?;

        let result = run_stage(&self.services, self.config, issue)
            .and_then(|run| self.conclude(issue, &stage, attempt, run));
        match result {
            Ok(report) => Ok(report),
            Err(err) => match err.downcast::<Superseded>() {
                Ok(moved) => Ok(superseded(issue, &stage, attempt, &moved, None)),
                Err(err) => {
                    self.recover(issue, &stage, attempt, &err);
                    Err(err)
                }
            },
        }
    }

    /// Record the run and apply the resulting transition.
    fn conclude(&self, issue: &str, stage: &str, attempt: u32, run: RunResult) -> Result<AdvanceReport> {
        let finished_at = Utc::now();
        let key = AttemptKey::new(issue, stage, attempt);
        if let Err(err) = self.services.store.save_stage_outcome(&key, &run) {
            warn!(err = %err, "failed to save stage outcome");
        }
        let checkpoint = Checkpoint {
            stage: stage.to_string(),
            attempt,
            status: run.outcome,
            summary: run.summary(),
            recorded_at: finished_at,
        };
        if let Err(err) = self.services.context.checkpoint(issue, &checkpoint) {
            warn!(err = %err, "failed to record checkpoint");
        }

        let stage_config = self.config.stage(stage)?;
        let stage_ids = self.config.stage_ids();
        let entry = StageHistoryEntry::from_run(stage, attempt, &run, finished_at);
        let mut decided = None;
        let updated = self.services.store.update(issue, &mut |s| {
            s.ensure_at(stage, attempt)?;
            s.record_attempt(entry.clone());
            let transition = decide(&TransitionInput {
                stage_ids: &stage_ids,
                current_stage: stage,
                current_attempt: attempt,
                outcome: run.outcome,
                on_fail: &stage_config.on_fail,
                max_attempts: self.config.defaults.max_attempts,
                goal_gates: &s.goal_gates,
            })?;
            s.apply(&transition);
            decided = Some(transition);
            Ok(())
        });
        let updated = match updated {
            Ok(updated) => updated,
            Err(err) => match err.downcast::<Superseded>() {
                Ok(moved) => return Ok(superseded(issue, stage, attempt, &moved, Some(run))),
                Err(err) => return Err(err),
            },
        };
        let transition = decided.ok_or_else(|| anyhow::anyhow!("no transition decided"))?;

        let (action, message) = self.report_transition(issue, stage, attempt, &transition, &run);
        info!(action = %action, status = %updated.status, "advance finished");
        Ok(AdvanceReport {
            issue: issue.to_string(),
            action,
            stage: stage.to_string(),
            attempt,
            message,
            run: Some(run),
        })
    }

    fn report_transition(
        &self,
        issue: &str,
        stage: &str,
        attempt: u32,
        transition: &Transition,
        run: &RunResult,
    ) -> (AdvanceAction, String) {
        let event = |kind: EventKind, detail: String| {
            emit(
                self.services.events,
                PipelineEvent::new(issue, kind).at(stage, attempt).detail(detail),
            );
        };
        match transition {
            Transition::Advance { next_stage } => {
                event(EventKind::StageAdvanced, format!("{stage} -> {next_stage}"));
                (AdvanceAction::Advanced, format!("advanced to {next_stage}"))
            }
            Transition::Complete => {
                event(EventKind::Completed, run.summary());
                (AdvanceAction::Completed, "pipeline completed".to_string())
            }
            Transition::GoalGatesUnmet { unmet } => {
                let message = format!("unmet goal gates: {}", unmet.join(", "));
                event(EventKind::GoalGateUnmet, unmet.join(", "));
                event(EventKind::Failed, message.clone());
                (AdvanceAction::Failed, message)
            }
            Transition::Retry { next_attempt } => {
                event(EventKind::Retry, run.summary());
                (
                    AdvanceAction::Retry,
                    format!("retrying {stage} (attempt {next_attempt}): {}", run.summary()),
                )
            }
            Transition::Route { target } => {
                event(EventKind::OnFailRouted, format!("{stage} -> {target}"));
                (AdvanceAction::Routed, format!("routed to {target}: {}", run.summary()))
            }
            Transition::Escalate => {
                event(EventKind::Escalated, run.summary());
                (
                    AdvanceAction::Escalated,
                    format!("escalated: {}", run.summary()),
                )
            }
            Transition::MaxAttempts { attempts } => {
                let message = format!("stage '{stage}' failed after {attempts} attempts");
                event(EventKind::MaxAttemptsReached, run.summary());
                event(EventKind::Failed, message.clone());
                (AdvanceAction::Failed, message)
            }
        }
    }

    /// Leave the pipeline re-advanceable after an infrastructure error.
    fn recover(&self, issue: &str, stage: &str, attempt: u32, err: &anyhow::Error) {
        let message = format!("{err:#}");
        warn!(err = %message, "advance failed; resetting pipeline to pending");
        emit(
            self.services.events,
            PipelineEvent::new(issue, EventKind::StageError)
                .at(stage, attempt)
                .detail(message.clone()),
        );
        let reset = self.services.store.update(issue, &mut |s| {
            s.ensure_at(stage, attempt)?;
            s.status = PipelineStatus::Pending;
            s.clear_session();
            s.last_error = Some(message.clone());
            Ok(())
        });
        if let Err(err) = reset
            && err.downcast_ref::<Superseded>().is_none()
        {
            warn!(err = %err, "failed to reset pipeline after error");
        }
    }

    /// Manual retry: next attempt of the current stage, past the automatic
    /// cap and out of `blocked` or `failed`. A completed pipeline stays
    /// completed.
    #[instrument(skip_all, fields(issue))]
    pub fn retry(&self, issue: &str, reason: &str) -> Result<PipelineState> {
        let state = self.services.store.get(issue)?;
        reject_completed(&state)?;
        self.kill_session(&state);
        let updated = self.services.store.update(issue, &mut |s| {
            reject_completed(s)?;
            let next = s.current_attempt + 1;
            s.start_attempt(next);
            s.status = PipelineStatus::InProgress;
            s.last_error = None;
            Ok(())
        })?;
        info!(attempt = updated.current_attempt, "manual retry");
        emit(
            self.services.events,
            PipelineEvent::new(issue, EventKind::Retry)
                .at(&updated.current_stage, updated.current_attempt)
                .detail(reason),
        );
        Ok(updated)
    }

    /// Terminate out of band.
    #[instrument(skip_all, fields(issue))]
    pub fn fail(&self, issue: &str, reason: &str) -> Result<PipelineState> {
        let updated = self.terminate(issue, reason)?;
        emit(
            self.services.events,
            PipelineEvent::new(issue, EventKind::Failed)
                .at(&updated.current_stage, updated.current_attempt)
                .detail(reason),
        );
        Ok(updated)
    }

    /// Like [`Orchestrator::fail`], and also removes the working copy.
    #[instrument(skip_all, fields(issue))]
    pub fn abort(&self, issue: &str) -> Result<PipelineState> {
        let updated = self.terminate(issue, "aborted")?;
        self.services.workspace.remove(&updated.workdir)?;
        emit(
            self.services.events,
            PipelineEvent::new(issue, EventKind::Aborted)
                .at(&updated.current_stage, updated.current_attempt)
                .detail(updated.workdir.display().to_string()),
        );
        Ok(updated)
    }

    fn terminate(&self, issue: &str, reason: &str) -> Result<PipelineState> {
        let state = self.services.store.get(issue)?;
        reject_completed(&state)?;
        self.kill_session(&state);
        let updated = self.services.store.update(issue, &mut |s| {
            reject_completed(s)?;
            s.clear_session();
            s.status = PipelineStatus::Failed;
            s.last_error = Some(reason.to_string());
            Ok(())
        })?;
        info!(reason, "pipeline terminated");
        Ok(updated)
    }

    fn kill_session(&self, state: &PipelineState) {
        let Some(meta) = &state.current_session else {
            return;
        };
        match self.services.sessions.kill(&meta.handle) {
            Ok(log) => {
                let key = AttemptKey::new(&state.issue, &meta.stage, meta.attempt)
                    .with_round(meta.fix_round.unwrap_or(0));
                if let Err(err) = self.services.store.save_session_log(&key, &log) {
                    warn!(err = %err, "failed to save session log");
                }
            }
            Err(err) => warn!(session = %meta.handle, err = %err, "failed to kill session"),
        }
    }

    /// One check-in tick over every pipeline.
    ///
    /// Terminal pipelines produce no report. An error on one pipeline is
    /// reported for it and the tick moves on.
    #[instrument(skip_all)]
    pub fn check_in(&self, now: DateTime<Utc>) -> Result<Vec<CheckInReport>> {
        let mut reports = Vec::new();
        for state in self.services.store.list()? {
            if state.is_terminal() {
                continue;
            }
            let issue = state.issue.clone();
            let action = match self.check_in_one(&state, now) {
                Ok(action) => action,
                Err(err) => {
                    warn!(issue = %issue, err = %format!("{err:#}"), "check-in failed for pipeline");
                    CheckInAction::Error(format!("{err:#}"))
                }
            };
            reports.push(CheckInReport { issue, action });
        }
        info!(pipelines = reports.len(), "check-in tick finished");
        Ok(reports)
    }

    fn check_in_one(&self, state: &PipelineState, now: DateTime<Utc>) -> Result<CheckInAction> {
        let stage = self.config.stage(&state.current_stage)?;
        let sessions = self.services.sessions;
        let (session, human_active, elapsed) = match &state.current_session {
            None => (None, false, Duration::ZERO),
            Some(meta) => {
                let status = sessions.status(&meta.handle)?;
                let live = !matches!(status.state, SessionState::Exited | SessionState::Missing);
                let human = live && sessions.detect_human_activity(&meta.handle)?;
                let elapsed = (now - meta.created_at).to_std().unwrap_or_default();
                (Some(status.state), human, elapsed)
            }
        };

        let decision = decide_check_in(&CheckInInput {
            status: state.status,
            session,
            human_active,
            elapsed,
            timeout: stage.timeout,
            wrap_up_sent: state.wrap_up_sent,
        });
        match decision {
            CheckInDecision::Skip(reason) => Ok(CheckInAction::Skipped(reason)),
            CheckInDecision::Steer => {
                let Some(meta) = &state.current_session else {
                    return Ok(CheckInAction::Skipped(SkipReason::SessionActive));
                };
                sessions.steer(&meta.handle, WRAP_UP)?;
                self.services.store.update(&state.issue, &mut |s| {
                    s.wrap_up_sent = true;
                    Ok(())
                })?;
                emit(
                    self.services.events,
                    PipelineEvent::new(&state.issue, EventKind::Steered)
                        .at(&state.current_stage, state.current_attempt)
                        .detail(format!("over {}s", stage.timeout.as_secs())),
                );
                Ok(CheckInAction::Steered)
            }
            CheckInDecision::Advance => {
                if self.services.store.lease_held(&state.issue)? {
                    return Ok(CheckInAction::Skipped(SkipReason::AdvanceInProgress));
                }
                Ok(CheckInAction::Advanced(self.advance(&state.issue)?))
            }
        }
    }

    pub fn status(&self, issue: &str) -> Result<PipelineState> {
        self.services.store.get(issue)
    }

    pub fn list(&self) -> Result<Vec<PipelineState>> {
        self.services.store.list()
    }
}

fn reject_completed(state: &PipelineState) -> Result<(), PreconditionError> {
    if state.status == PipelineStatus::Completed {
        return Err(PreconditionError::PipelineTerminal {
            issue: state.issue.clone(),
            status: state.status.to_string(),
        });
    }
    Ok(())
}

fn superseded(
    issue: &str,
    stage: &str,
    attempt: u32,
    moved: &Superseded,
    run: Option<RunResult>,
) -> AdvanceReport {
    warn!(stage, attempt, now = %moved.status, "pipeline moved on during the run; result dropped");
    AdvanceReport {
        issue: issue.to_string(),
        action: AdvanceAction::Superseded,
        stage: stage.to_string(),
        attempt,
        message: moved.to_string(),
        run,
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::PipelineNotFound(_))
    )
}
