//! Shared deterministic types for the pipeline engine.
//!
//! These types define stable contracts between core components and the
//! serialized state documents. They must not depend on external state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Escalated; waits for a human.
    Blocked,
}

impl PipelineStatus {
    /// `completed` and `failed` pipelines never advance again.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::InProgress => "in_progress",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Success,
    Fail,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::Fail => "fail",
        }
    }
}

/// Final pass/fail state of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// Goal-gate marker. Serialized as `""` until the stage reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalGateStatus {
    #[serde(rename = "")]
    Pending,
    #[serde(rename = "success")]
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    #[default]
    Agent,
    ChecksOnly,
}

/// Failure policy of a stage, resolved once when the config is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OnFail {
    /// Retry the same stage until the attempt budget runs out.
    #[default]
    Retry,
    RouteTo(String),
    Escalate,
}

/// How much prior-stage context goes into a stage prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Every checkpoint recorded so far.
    #[default]
    Full,
    /// Only the most recent checkpoint.
    Summary,
    Disabled,
}

/// Opaque handle identifying a live agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity record returned when a session is created.
///
/// The engine never recovers issue/stage/attempt by parsing session names;
/// it reads them from this record instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub handle: SessionHandle,
    pub name: String,
    pub issue: String,
    pub stage: String,
    pub attempt: u32,
    pub fix_round: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl SessionMeta {
    /// True if this session was opened for the given stage attempt.
    pub fn belongs_to(&self, issue: &str, stage: &str, attempt: u32) -> bool {
        self.issue == issue && self.stage == stage && self.attempt == attempt
    }
}

/// Observed state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no output observed yet.
    Started,
    Active,
    Idle,
    Exited,
    /// The session manager has no record of it.
    Missing,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Started | SessionState::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Result of blocking until a session goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Idle,
    Exited,
    TimedOut,
}

/// Summary of one Stage Execution Engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub outcome: StageOutcome,
    /// Final state per check name.
    pub checks: BTreeMap<String, CheckStatus>,
    pub auto_fixes: BTreeMap<String, u32>,
    pub agent_fixes: BTreeMap<String, u32>,
    pub fix_rounds: u32,
    pub checks_first_pass: bool,
    pub agent_duration_ms: u64,
    pub total_duration_ms: u64,
    /// Why the stage failed, when it did.
    pub reason: Option<String>,
}

impl RunResult {
    /// One-line description used for checkpoints and CLI output.
    pub fn summary(&self) -> String {
        let failing: Vec<&str> = self
            .checks
            .iter()
            .filter(|(_, status)| **status == CheckStatus::Fail)
            .map(|(name, _)| name.as_str())
            .collect();
        let mut line = format!(
            "{} after {} fix round(s)",
            self.outcome.as_str(),
            self.fix_rounds
        );
        if !failing.is_empty() {
            line.push_str(&format!("; failing checks: {}", failing.join(", ")));
        }
        if let Some(reason) = &self.reason {
            line.push_str(&format!("; {reason}"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_gate_status_serializes_as_empty_string_until_success() {
        let pending = serde_json::to_string(&GoalGateStatus::Pending).expect("serialize");
        let success = serde_json::to_string(&GoalGateStatus::Success).expect("serialize");
        assert_eq!(pending, "\"\"");
        assert_eq!(success, "\"success\"");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(!PipelineStatus::Blocked.is_terminal());
        assert!(!PipelineStatus::InProgress.is_terminal());
        assert!(!PipelineStatus::Pending.is_terminal());
    }

    #[test]
    fn run_summary_names_failing_checks() {
        let result = RunResult {
            outcome: StageOutcome::Fail,
            checks: BTreeMap::from([
                ("lint".to_string(), CheckStatus::Pass),
                ("test".to_string(), CheckStatus::Fail),
            ]),
            auto_fixes: BTreeMap::new(),
            agent_fixes: BTreeMap::new(),
            fix_rounds: 3,
            checks_first_pass: false,
            agent_duration_ms: 0,
            total_duration_ms: 0,
            reason: Some("fix loop exhausted".to_string()),
        };
        assert_eq!(
            result.summary(),
            "fail after 3 fix round(s); failing checks: test; fix loop exhausted"
        );
    }
}
