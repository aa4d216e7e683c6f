//! Fix-round bookkeeping and fix-prompt rendering.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::gate::GateResult;
use crate::core::types::CheckStatus;

/// Accumulator threaded through every gate call of one stage run.
///
/// Tracks the latest status of each check and attributes each fail→pass
/// transition to either the check's auto-fix command or the agent. A check
/// sits in the "previously failing" set from the moment it is seen failing
/// until the next time it is seen passing, so each transition counts once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixTracker {
    status: BTreeMap<String, CheckStatus>,
    previously_failing: BTreeSet<String>,
    auto_fixes: BTreeMap<String, u32>,
    agent_fixes: BTreeMap<String, u32>,
}

impl FixTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one gate result into the accumulator.
    pub fn observe(&mut self, gate: &GateResult) {
        for check in &gate.checks {
            let name = check.name.clone();
            if check.passed {
                let was_failing = self.previously_failing.remove(&name);
                if check.auto_fixed {
                    // Failed and was repaired inside this gate call.
                    *self.auto_fixes.entry(name.clone()).or_default() += 1;
                } else if was_failing {
                    *self.agent_fixes.entry(name.clone()).or_default() += 1;
                }
                self.status.insert(name, CheckStatus::Pass);
            } else {
                self.previously_failing.insert(name.clone());
                self.status.insert(name, CheckStatus::Fail);
            }
        }
    }

    pub fn status(&self) -> &BTreeMap<String, CheckStatus> {
        &self.status
    }

    pub fn auto_fixes(&self) -> &BTreeMap<String, u32> {
        &self.auto_fixes
    }

    pub fn agent_fixes(&self) -> &BTreeMap<String, u32> {
        &self.agent_fixes
    }

    pub fn failing(&self) -> &BTreeSet<String> {
        &self.previously_failing
    }
}

/// Render the message sent to the agent for a fix round.
///
/// A fresh session has no memory of the stage, so its prompt restates the
/// task from the failures alone.
pub fn render_fix_prompt(
    stage: &str,
    round: u32,
    failures: &BTreeMap<String, String>,
    fresh: bool,
) -> String {
    let mut buf = String::new();
    if fresh {
        buf.push_str(&format!(
            "You are picking up stage '{stage}' of an in-flight change. The work is already in this \
             working tree, but these checks still fail. Fix them without rewriting unrelated code, \
             then commit.\n"
        ));
    } else {
        buf.push_str(&format!(
            "Fix round {round}: the following checks failed after your changes. Fix them and commit.\n"
        ));
    }
    for (name, summary) in failures {
        buf.push_str(&format!("\n## {name}\n\n"));
        let summary = summary.trim();
        if summary.is_empty() {
            buf.push_str("(no output captured)\n");
        } else {
            buf.push_str(summary);
            buf.push('\n');
        }
    }
    buf
}
