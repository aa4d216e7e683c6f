//! Append-only audit log of pipeline events and check runs.
//!
//! This is product output, independent of `RUST_LOG`. Writes are
//! best-effort: the engine goes through [`emit`], which logs a warning and
//! moves on when the log cannot be written.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::checks::CheckRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StageStarted,
    StageAdvanced,
    Retry,
    OnFailRouted,
    Escalated,
    MaxAttemptsReached,
    FixRoundStart,
    FixLoopExhausted,
    ChecksBeforeFailed,
    Completed,
    Failed,
    Aborted,
    Steered,
    GoalGateUnmet,
    StageError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::StageStarted => "stage_started",
            EventKind::StageAdvanced => "stage_advanced",
            EventKind::Retry => "retry",
            EventKind::OnFailRouted => "on_fail_routed",
            EventKind::Escalated => "escalated",
            EventKind::MaxAttemptsReached => "max_attempts_reached",
            EventKind::FixRoundStart => "fix_round_start",
            EventKind::FixLoopExhausted => "fix_loop_exhausted",
            EventKind::ChecksBeforeFailed => "checks_before_failed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Aborted => "aborted",
            EventKind::Steered => "steered",
            EventKind::GoalGateUnmet => "goal_gate_unmet",
            EventKind::StageError => "stage_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub ts: DateTime<Utc>,
    pub issue: String,
    pub event: EventKind,
    pub stage: Option<String>,
    pub attempt: Option<u32>,
    pub detail: String,
}

impl PipelineEvent {
    pub fn new(issue: &str, event: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            issue: issue.to_string(),
            event,
            stage: None,
            attempt: None,
            detail: String::new(),
        }
    }

    pub fn at(mut self, stage: &str, attempt: u32) -> Self {
        self.stage = Some(stage.to_string());
        self.attempt = Some(attempt);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// One executed check, as recorded in `checks.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRunEvent {
    pub ts: DateTime<Utc>,
    pub issue: String,
    pub stage: String,
    pub attempt: u32,
    pub check: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub fix_round: u32,
    pub recheck: bool,
    pub summary: String,
}

impl CheckRunEvent {
    pub fn from_run(issue: &str, stage: &str, attempt: u32, run: &CheckRun) -> Self {
        Self {
            ts: Utc::now(),
            issue: issue.to_string(),
            stage: stage.to_string(),
            attempt,
            check: run.name.clone(),
            passed: run.passed,
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            duration_ms: run.duration_ms,
            fix_round: run.fix_round,
            recheck: run.recheck,
            summary: run.summary.clone(),
        }
    }
}

pub trait EventLog {
    fn log_pipeline_event(&self, event: &PipelineEvent) -> Result<()>;

    fn log_check_run(&self, event: &CheckRunEvent) -> Result<()>;
}

/// Best-effort pipeline event write.
pub fn emit(log: &dyn EventLog, event: PipelineEvent) {
    if let Err(err) = log.log_pipeline_event(&event) {
        warn!(issue = %event.issue, event = event.event.as_str(), err = %err, "failed to write event log");
    }
}

/// Best-effort check run writes.
pub fn emit_check_runs(log: &dyn EventLog, issue: &str, stage: &str, attempt: u32, runs: &[CheckRun]) {
    for run in runs {
        if let Err(err) = log.log_check_run(&CheckRunEvent::from_run(issue, stage, attempt, run)) {
            warn!(issue, check = %run.name, err = %err, "failed to write check log");
        }
    }
}

/// JSON Lines files under the state directory.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    events_path: PathBuf,
    checks_path: PathBuf,
}

impl JsonlEventLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            events_path: dir.join("events.jsonl"),
            checks_path: dir.join("checks.jsonl"),
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }
}

impl EventLog for JsonlEventLog {
    fn log_pipeline_event(&self, event: &PipelineEvent) -> Result<()> {
        append_line(&self.events_path, event)
    }

    fn log_check_run(&self, event: &CheckRunEvent) -> Result<()> {
        append_line(&self.checks_path, event)
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read back pipeline events, oldest first.
pub fn read_events(path: &Path) -> Result<Vec<PipelineEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).with_context(|| format!("parse event in {}", path.display())))
        .collect()
}
