//! Durable per-issue pipeline state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::transition::{Transition, unmet_goal_gates};
use crate::core::types::{
    GoalGateStatus, PipelineStatus, RunResult, SessionMeta, StageOutcome,
};
use crate::error::Superseded;

/// One completed stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage: String,
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
    pub fix_rounds: u32,
    pub checks_first_pass: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl StageHistoryEntry {
    pub fn from_run(stage: &str, attempt: u32, run: &RunResult, finished_at: DateTime<Utc>) -> Self {
        Self {
            stage: stage.to_string(),
            attempt,
            outcome: run.outcome,
            duration_ms: run.total_duration_ms,
            fix_rounds: run.fix_rounds,
            checks_first_pass: run.checks_first_pass,
            reason: run.reason.clone(),
            finished_at,
        }
    }
}

/// Persisted state of one pipeline (`pipelines/<issue>/state.json`).
///
/// Only the orchestrator changes `status`; every change goes through the
/// store's read-modify-write update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub issue: String,
    pub title: String,
    pub branch: String,
    pub workdir: PathBuf,
    pub current_stage: String,
    pub current_attempt: u32,
    pub current_fix_round: u32,
    pub current_session: Option<SessionMeta>,
    pub status: PipelineStatus,
    pub stage_history: Vec<StageHistoryEntry>,
    pub goal_gates: BTreeMap<String, GoalGateStatus>,
    /// Set once the check-in loop has asked the current session to wrap up.
    #[serde(default)]
    pub wrap_up_sent: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(
        issue: &str,
        title: &str,
        branch: &str,
        workdir: PathBuf,
        first_stage: &str,
        goal_gate_stages: &[&str],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            issue: issue.to_string(),
            title: title.to_string(),
            branch: branch.to_string(),
            workdir,
            current_stage: first_stage.to_string(),
            current_attempt: 1,
            current_fix_round: 0,
            current_session: None,
            status: PipelineStatus::Pending,
            stage_history: Vec::new(),
            goal_gates: goal_gate_stages
                .iter()
                .map(|stage| (stage.to_string(), GoalGateStatus::Pending))
                .collect(),
            wrap_up_sent: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fails unless the pipeline is still live at `stage` attempt `attempt`.
    pub fn ensure_at(&self, stage: &str, attempt: u32) -> Result<(), Superseded> {
        if self.is_terminal() || self.current_stage != stage || self.current_attempt != attempt {
            return Err(Superseded {
                issue: self.issue.clone(),
                status: self.status.to_string(),
                stage: self.current_stage.clone(),
                attempt: self.current_attempt,
            });
        }
        Ok(())
    }

    /// Record a finished attempt and, for a successful goal-gate stage, mark
    /// the gate satisfied.
    pub fn record_attempt(&mut self, entry: StageHistoryEntry) {
        if entry.outcome == StageOutcome::Success
            && let Some(gate) = self.goal_gates.get_mut(&entry.stage)
        {
            *gate = GoalGateStatus::Success;
        }
        self.stage_history.push(entry);
    }

    pub fn unmet_goal_gates(&self) -> Vec<String> {
        unmet_goal_gates(&self.goal_gates)
    }

    /// Apply an orchestrator transition.
    pub fn apply(&mut self, transition: &Transition) {
        match transition {
            Transition::Advance { next_stage } => {
                self.enter_stage(next_stage);
                self.status = PipelineStatus::InProgress;
            }
            Transition::Route { target } => {
                self.enter_stage(target);
                self.status = PipelineStatus::InProgress;
            }
            Transition::Retry { next_attempt } => {
                self.start_attempt(*next_attempt);
                self.status = PipelineStatus::InProgress;
            }
            Transition::Complete => {
                self.clear_session();
                self.status = PipelineStatus::Completed;
            }
            Transition::GoalGatesUnmet { unmet } => {
                self.clear_session();
                self.status = PipelineStatus::Failed;
                self.last_error = Some(format!("unmet goal gates: {}", unmet.join(", ")));
            }
            Transition::MaxAttempts { attempts } => {
                self.clear_session();
                self.status = PipelineStatus::Failed;
                self.last_error = Some(format!(
                    "stage '{}' failed after {attempts} attempts",
                    self.current_stage
                ));
            }
            Transition::Escalate => {
                self.clear_session();
                self.status = PipelineStatus::Blocked;
            }
        }
    }

    /// Start the next attempt of the current stage.
    pub fn start_attempt(&mut self, attempt: u32) {
        self.current_attempt = attempt;
        self.current_fix_round = 0;
        self.clear_session();
    }

    fn enter_stage(&mut self, stage: &str) {
        self.current_stage = stage.to_string();
        self.start_attempt(1);
    }

    pub fn clear_session(&mut self) {
        self.current_session = None;
        self.wrap_up_sent = false;
    }
}
