//! Pipeline transition decisions after a stage attempt.

use std::collections::BTreeMap;

use crate::core::types::{GoalGateStatus, OnFail, StageOutcome};
use crate::error::PreconditionError;

/// Where the pipeline goes after a stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move to the next configured stage.
    Advance { next_stage: String },
    /// Last stage succeeded and every goal gate is satisfied.
    Complete,
    /// Last stage succeeded but some goal-gate stages never succeeded.
    GoalGatesUnmet { unmet: Vec<String> },
    /// Run the same stage again at the given attempt.
    Retry { next_attempt: u32 },
    /// `on_fail` sends the pipeline to another stage.
    Route { target: String },
    Escalate,
    /// Same-stage retries are used up.
    MaxAttempts { attempts: u32 },
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    /// Configured stage ids in pipeline order.
    pub stage_ids: &'a [&'a str],
    pub current_stage: &'a str,
    pub current_attempt: u32,
    pub outcome: StageOutcome,
    pub on_fail: &'a OnFail,
    pub max_attempts: u32,
    /// Goal gates *after* this attempt's result has been recorded.
    pub goal_gates: &'a BTreeMap<String, GoalGateStatus>,
}

/// Decide the next pipeline transition.
///
/// Errors only on broken setup: the current stage or the routing target is
/// not a configured stage.
pub fn decide(input: &TransitionInput<'_>) -> Result<Transition, PreconditionError> {
    let position = input
        .stage_ids
        .iter()
        .position(|id| *id == input.current_stage)
        .ok_or_else(|| PreconditionError::UnknownStage(input.current_stage.to_string()))?;

    match input.outcome {
        StageOutcome::Success => {
            if let Some(next) = input.stage_ids.get(position + 1) {
                return Ok(Transition::Advance {
                    next_stage: next.to_string(),
                });
            }
            let unmet = unmet_goal_gates(input.goal_gates);
            if unmet.is_empty() {
                Ok(Transition::Complete)
            } else {
                Ok(Transition::GoalGatesUnmet { unmet })
            }
        }
        StageOutcome::Fail => match input.on_fail {
            OnFail::Escalate => Ok(Transition::Escalate),
            OnFail::RouteTo(target) if target != input.current_stage => {
                if !input.stage_ids.contains(&target.as_str()) {
                    return Err(PreconditionError::InvalidOnFailTarget {
                        stage: input.current_stage.to_string(),
                        target: target.clone(),
                    });
                }
                Ok(Transition::Route {
                    target: target.clone(),
                })
            }
            OnFail::RouteTo(_) | OnFail::Retry => {
                if input.current_attempt >= input.max_attempts {
                    Ok(Transition::MaxAttempts {
                        attempts: input.current_attempt,
                    })
                } else {
                    Ok(Transition::Retry {
                        next_attempt: input.current_attempt + 1,
                    })
                }
            }
        },
    }
}

/// Goal-gate stages that have not reported success, in stage-id order.
pub fn unmet_goal_gates(goal_gates: &BTreeMap<String, GoalGateStatus>) -> Vec<String> {
    goal_gates
        .iter()
        .filter(|(_, status)| **status != GoalGateStatus::Success)
        .map(|(stage, _)| stage.clone())
        .collect()
}
