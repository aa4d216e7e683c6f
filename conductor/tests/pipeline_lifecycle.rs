//! Orchestrator-level lifecycle tests.
//!
//! These drive `Orchestrator::advance` and `check_in` through several ticks
//! against scripted sessions and checks, with the real file-backed store and
//! event log in a temp dir.

use std::cell::RefCell;

use chrono::Utc;
use conductor::core::checkin::SkipReason;
use conductor::core::types::{
    CheckStatus, GoalGateStatus, PipelineStatus, StageOutcome, WaitOutcome,
};
use conductor::error::is_precondition;
use conductor::orchestrator::{AdvanceAction, CheckInAction};
use conductor::test_support::{CheckScript, Harness, InterleavedChecks};

fn harness(config: &str) -> Harness {
    let h = Harness::new(config).expect("harness");
    h.orchestrator().create("1").expect("create");
    h
}

const AGENT_PIPELINE: &str = r#"
[defaults]
max_fix_rounds = 2

[checks.lint]
command = "cargo clippy"
parser = "cargo"

[checks.test]
command = "cargo test"
parser = "cargo"

[[stages]]
id = "implement"
checks_after = ["lint"]

[[stages]]
id = "review"
checks_after = ["lint", "test"]
goal_gate = true

[[stages]]
id = "ship"
type = "checks_only"
checks_after = ["lint"]
"#;

/// An agent stage whose checks pass on the first gate moves straight on.
#[test]
fn first_pass_stage_advances() {
    let h = harness(AGENT_PIPELINE);
    let report = h.orchestrator().advance("1").expect("advance");

    assert_eq!(report.action, AdvanceAction::Advanced);
    assert_eq!(report.stage, "implement");
    let run = report.run.expect("run result");
    assert!(run.checks_first_pass);
    assert_eq!(run.fix_rounds, 0);

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.current_stage, "review");
    assert_eq!(state.current_attempt, 1);
    assert_eq!(state.status, PipelineStatus::InProgress);
    assert!(state.current_session.is_none());
    assert_eq!(h.event_names(), vec!["created", "stage_started", "stage_advanced"]);
}

/// Both gate checks fail, the agent fixes them in one round, and the goal
/// gate is recorded.
#[test]
fn one_fix_round_satisfies_goal_gate() {
    let h = harness(AGENT_PIPELINE);
    h.orchestrator().advance("1").expect("implement");

    h.checks.set("lint", [CheckScript::fail("warning: unused"), CheckScript::Pass]);
    h.checks.set("test", [CheckScript::fail("test a ... FAILED"), CheckScript::Pass]);
    let report = h.orchestrator().advance("1").expect("review");

    assert_eq!(report.action, AdvanceAction::Advanced);
    let run = report.run.expect("run result");
    assert_eq!(run.fix_rounds, 1);
    assert!(!run.checks_first_pass);
    assert_eq!(run.agent_fixes.get("lint"), Some(&1));
    assert_eq!(run.agent_fixes.get("test"), Some(&1));
    assert_eq!(run.checks.get("test"), Some(&CheckStatus::Pass));

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.goal_gates.get("review"), Some(&GoalGateStatus::Success));
    assert_eq!(state.current_stage, "ship");

    let report = h.orchestrator().advance("1").expect("ship");
    assert_eq!(report.action, AdvanceAction::Completed);
    assert_eq!(
        h.orchestrator().status("1").expect("status").status,
        PipelineStatus::Completed
    );
}

#[test]
fn checks_only_escalation_blocks_pipeline() {
    let h = harness(
        r#"
[checks.lint]
command = "lint"

[[stages]]
id = "verify"
type = "checks_only"
checks_after = ["lint"]
on_fail = { escalate = true }
"#,
    );
    h.checks.set("lint", [CheckScript::fail("bad")]);
    let report = h.orchestrator().advance("1").expect("advance");

    assert_eq!(report.action, AdvanceAction::Escalated);
    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Blocked);
    assert!(h.event_names().contains(&"escalated".to_string()));

    let reports = h.orchestrator().check_in(Utc::now()).expect("tick");
    assert_eq!(reports.len(), 1);
    assert!(h.sessions.created().is_empty());
}

/// B routes its failure back to A; the pipeline completes after two passes
/// through A.
#[test]
fn on_fail_route_reruns_earlier_stage() {
    let h = harness(
        r#"
[checks.a_check]
command = "a"

[checks.b_check]
command = "b"

[[stages]]
id = "a"
type = "checks_only"
checks_after = ["a_check"]

[[stages]]
id = "b"
type = "checks_only"
checks_after = ["b_check"]
on_fail = "a"
"#,
    );
    h.checks.set("b_check", [CheckScript::fail("nope"), CheckScript::Pass]);

    let actions: Vec<AdvanceAction> = (0..4)
        .map(|_| h.orchestrator().advance("1").expect("advance").action)
        .collect();
    assert_eq!(
        actions,
        vec![
            AdvanceAction::Advanced,
            AdvanceAction::Routed,
            AdvanceAction::Advanced,
            AdvanceAction::Completed,
        ]
    );

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Completed);
    let a_runs = state.stage_history.iter().filter(|entry| entry.stage == "a").count();
    assert_eq!(a_runs, 2);
    assert!(h.event_names().contains(&"on_fail_routed".to_string()));
}

const FLAKY_STAGE: &str = r#"
[checks.lint]
command = "lint"

[[stages]]
id = "verify"
type = "checks_only"
checks_after = ["lint"]
"#;

#[test]
fn max_attempts_boundary_fails_on_third_advance() {
    let h = harness(FLAKY_STAGE);
    h.checks.set("lint", [CheckScript::fail("still bad")]);

    let first = h.orchestrator().advance("1").expect("advance 1");
    assert_eq!(first.action, AdvanceAction::Retry);
    assert_eq!(h.orchestrator().status("1").expect("status").current_attempt, 2);

    let second = h.orchestrator().advance("1").expect("advance 2");
    assert_eq!(second.action, AdvanceAction::Retry);
    assert_eq!(h.orchestrator().status("1").expect("status").current_attempt, 3);

    let third = h.orchestrator().advance("1").expect("advance 3");
    assert_eq!(third.action, AdvanceAction::Failed);
    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.stage_history.len(), 3);
    assert!(h.event_names().contains(&"max_attempts_reached".to_string()));
}

#[test]
fn manual_retry_continues_past_the_cap() {
    let h = harness(FLAKY_STAGE);
    h.checks.set("lint", [CheckScript::fail("bad")]);
    for _ in 0..3 {
        h.orchestrator().advance("1").expect("advance");
    }
    assert!(h.orchestrator().status("1").expect("status").is_terminal());

    h.checks.set("lint", [CheckScript::Pass]);
    let state = h.orchestrator().retry("1", "flake fixed upstream").expect("retry");
    assert_eq!(state.current_attempt, 4);
    assert_eq!(state.status, PipelineStatus::InProgress);

    let report = h.orchestrator().advance("1").expect("advance");
    assert_eq!(report.action, AdvanceAction::Completed);
    assert_eq!(report.attempt, 4);
}

#[test]
fn check_in_ignores_terminal_pipelines() {
    let h = harness(FLAKY_STAGE);
    let report = h.orchestrator().advance("1").expect("advance");
    assert_eq!(report.action, AdvanceAction::Completed);
    h.orchestrator().create("2").expect("create 2");
    h.orchestrator().fail("2", "won't fix").expect("fail 2");

    let reports = h.orchestrator().check_in(Utc::now()).expect("tick");
    assert!(reports.is_empty());
}

#[test]
fn completion_with_unmet_goal_gate_fails() {
    let h = harness(
        r#"
[checks.lint]
command = "lint"

[checks.test]
command = "test"

[[stages]]
id = "implement"
type = "checks_only"
checks_after = ["lint"]

[[stages]]
id = "review"
type = "checks_only"
checks_after = ["test"]
goal_gate = true
on_fail = "ship"

[[stages]]
id = "ship"
type = "checks_only"
checks_after = ["lint"]
"#,
    );
    h.checks.set("test", [CheckScript::fail("1 failed")]);

    let actions: Vec<AdvanceAction> = (0..3)
        .map(|_| h.orchestrator().advance("1").expect("advance").action)
        .collect();
    assert_eq!(
        actions,
        vec![AdvanceAction::Advanced, AdvanceAction::Routed, AdvanceAction::Failed]
    );

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.goal_gates.get("review"), Some(&GoalGateStatus::Pending));
    assert!(state.last_error.as_deref().unwrap_or_default().contains("review"));
    assert!(h.event_names().contains(&"goal_gate_unmet".to_string()));
}

#[test]
fn auto_fix_and_agent_fix_are_attributed_separately() {
    let h = harness(
        r#"
[checks.fmt]
command = "fmt --check"
auto_fix = "fmt"

[[stages]]
id = "tidy"
type = "checks_only"
checks_after = ["fmt"]

[[stages]]
id = "implement"
checks_after = ["fmt"]
"#,
    );
    h.checks.set("fmt", [CheckScript::fail("diff"), CheckScript::Pass]);
    let tidy = h.orchestrator().advance("1").expect("tidy").run.expect("run");
    assert_eq!(tidy.outcome, StageOutcome::Success);
    assert_eq!(tidy.auto_fixes.get("fmt"), Some(&1));
    assert!(tidy.agent_fixes.is_empty());

    // Auto-fix does not help; the agent's fix round does.
    h.checks.set(
        "fmt",
        [CheckScript::fail("diff"), CheckScript::fail("diff"), CheckScript::Pass],
    );
    let implement = h.orchestrator().advance("1").expect("implement").run.expect("run");
    assert_eq!(implement.outcome, StageOutcome::Success);
    assert_eq!(implement.fix_rounds, 1);
    assert_eq!(implement.agent_fixes.get("fmt"), Some(&1));
    assert!(implement.auto_fixes.is_empty());
}

#[test]
fn infrastructure_error_leaves_pipeline_re_advanceable() {
    let h = harness(AGENT_PIPELINE);
    h.sessions.fail_next_create();

    let err = h.orchestrator().advance("1").unwrap_err();
    assert!(!is_precondition(&err));
    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Pending);
    assert!(state.current_session.is_none());
    assert!(state.last_error.is_some());

    let report = h.orchestrator().advance("1").expect("advance again");
    assert_eq!(report.action, AdvanceAction::Advanced);
    let state = h.orchestrator().status("1").expect("status");
    assert!(state.last_error.is_none());
}

#[test]
fn unknown_pipeline_is_a_precondition_error() {
    let h = Harness::new(FLAKY_STAGE).expect("harness");
    let err = h.orchestrator().advance("404").unwrap_err();
    assert!(is_precondition(&err));
    let err = h.orchestrator().create("../etc").unwrap_err();
    assert!(is_precondition(&err));
}

#[test]
fn abort_removes_worktree_and_rejects_completed() {
    let h = harness(FLAKY_STAGE);
    let workdir = h.orchestrator().status("1").expect("status").workdir;
    h.orchestrator().abort("1").expect("abort");
    assert_eq!(h.workspace.removed(), vec![workdir]);

    h.orchestrator().create("2").expect("create 2");
    h.orchestrator().advance("2").expect("advance");
    let err = h.orchestrator().abort("2").unwrap_err();
    assert!(is_precondition(&err));
}

#[test]
fn agent_timeout_fails_the_attempt_through_on_fail() {
    let h = harness(
        r#"
[checks.lint]
command = "lint"

[[stages]]
id = "implement"
checks_after = ["lint"]
timeout_secs = 60
on_fail = { escalate = true }
"#,
    );
    h.sessions.push_wait(WaitOutcome::TimedOut);
    let report = h.orchestrator().advance("1").expect("advance");

    assert_eq!(report.action, AdvanceAction::Escalated);
    let run = report.run.expect("run result");
    assert_eq!(run.outcome, StageOutcome::Fail);
    assert_eq!(run.reason.as_deref(), Some("agent did not finish within 60s"));
    assert!(h.checks.calls().is_empty());
    assert_eq!(h.sessions.killed(), vec!["1-implement-1".to_string()]);

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Blocked);
    assert!(state.current_session.is_none());
}

/// A check-in tick that lands while an advance is mid-gate leaves the
/// pipeline to that advance.
#[test]
fn check_in_during_running_advance_skips_pipeline() {
    let h = harness(AGENT_PIPELINE);
    let tick = RefCell::new(Vec::new());
    let checks = InterleavedChecks::new(&h.checks, || {
        *tick.borrow_mut() = h.orchestrator().check_in(Utc::now()).expect("tick");
    });
    let report = h
        .orchestrator_with_checks(&checks)
        .advance("1")
        .expect("advance");
    drop(checks);

    assert_eq!(report.action, AdvanceAction::Advanced);
    let tick = tick.into_inner();
    assert_eq!(tick.len(), 1);
    assert_eq!(
        tick[0].action,
        CheckInAction::Skipped(SkipReason::AdvanceInProgress)
    );

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.current_stage, "review");
    assert_eq!(state.stage_history.len(), 1);
    assert_eq!(h.sessions.killed(), vec!["1-implement-1".to_string()]);
}

#[test]
fn pipeline_failed_during_gate_is_not_reopened() {
    let h = harness(AGENT_PIPELINE);
    let checks = InterleavedChecks::new(&h.checks, || {
        h.orchestrator().fail("1", "operator stop").expect("fail");
    });
    let report = h
        .orchestrator_with_checks(&checks)
        .advance("1")
        .expect("advance");
    drop(checks);

    assert_eq!(report.action, AdvanceAction::Superseded);
    assert_eq!(report.run.expect("run result").outcome, StageOutcome::Success);

    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.current_stage, "implement");
    assert!(state.stage_history.is_empty());
    assert!(state.current_session.is_none());
    assert_eq!(state.last_error.as_deref(), Some("operator stop"));
    let names = h.event_names();
    assert!(!names.contains(&"stage_advanced".to_string()));
    assert!(!names.contains(&"stage_error".to_string()));
}

/// A fix round never records its session on a pipeline that was failed
/// while the gate ran.
#[test]
fn pipeline_failed_before_fix_round_is_not_reopened() {
    let h = harness(AGENT_PIPELINE);
    h.checks.set("lint", [CheckScript::fail("warning: unused"), CheckScript::Pass]);
    let checks = InterleavedChecks::new(&h.checks, || {
        h.orchestrator().fail("1", "operator stop").expect("fail");
    });
    let report = h
        .orchestrator_with_checks(&checks)
        .advance("1")
        .expect("advance");
    drop(checks);

    assert_eq!(report.action, AdvanceAction::Superseded);
    assert!(report.run.is_none());
    let state = h.orchestrator().status("1").expect("status");
    assert_eq!(state.status, PipelineStatus::Failed);
    assert!(state.current_session.is_none());
    assert_eq!(state.last_error.as_deref(), Some("operator stop"));
}

#[test]
fn retry_on_completed_pipeline_is_rejected() {
    let h = harness(FLAKY_STAGE);
    assert_eq!(
        h.orchestrator().advance("1").expect("advance").action,
        AdvanceAction::Completed
    );
    let err = h.orchestrator().retry("1", "again").unwrap_err();
    assert!(is_precondition(&err));
    assert_eq!(
        h.orchestrator().status("1").expect("status").status,
        PipelineStatus::Completed
    );
}
