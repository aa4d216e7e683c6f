//! Per-pipeline decision for one check-in tick.

use std::fmt;
use std::time::Duration;

use crate::core::types::{PipelineStatus, SessionState};

/// What a check-in tick does with one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInDecision {
    Skip(SkipReason),
    /// Send the one wrap-up steering message.
    Steer,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Terminal,
    Blocked,
    /// Someone is typing into the session.
    HumanActive,
    /// The agent is still working within the stage timeout.
    SessionActive,
    /// Past the timeout, but the wrap-up message was already sent.
    AlreadySteered,
    /// Another process is running this pipeline's stage right now.
    AdvanceInProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Terminal => "terminal",
            SkipReason::Blocked => "blocked (needs a human)",
            SkipReason::HumanActive => "human activity in session",
            SkipReason::SessionActive => "session active",
            SkipReason::AlreadySteered => "session over time, wrap-up already sent",
            SkipReason::AdvanceInProgress => "advance already running",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckInInput {
    pub status: PipelineStatus,
    /// `None` when the pipeline has no current session.
    pub session: Option<SessionState>,
    pub human_active: bool,
    /// Time since the current session started.
    pub elapsed: Duration,
    pub timeout: Duration,
    pub wrap_up_sent: bool,
}

pub fn decide_check_in(input: &CheckInInput) -> CheckInDecision {
    if input.status.is_terminal() {
        return CheckInDecision::Skip(SkipReason::Terminal);
    }
    if input.status == PipelineStatus::Blocked {
        return CheckInDecision::Skip(SkipReason::Blocked);
    }
    if input.human_active {
        return CheckInDecision::Skip(SkipReason::HumanActive);
    }
    match input.session {
        Some(state) if state.is_running() => {
            if input.elapsed < input.timeout {
                CheckInDecision::Skip(SkipReason::SessionActive)
            } else if input.wrap_up_sent {
                CheckInDecision::Skip(SkipReason::AlreadySteered)
            } else {
                CheckInDecision::Steer
            }
        }
        _ => CheckInDecision::Advance,
    }
}
