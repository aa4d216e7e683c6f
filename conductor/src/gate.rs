//! Check Gate Runner.
//!
//! Runs an ordered list of checks against a working copy, gives each failing
//! check with an auto-fix command one fix-and-recheck pass, and aggregates
//! the results into a [`GateResult`].

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::gate::{CheckResult, GateResult};
use crate::io::checks::{CheckRun, CheckRunner};
use crate::io::config::CheckConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOptions {
    /// Keep evaluating later checks after one fails.
    pub continue_on_failure: bool,
    /// Fix round the gate runs in (0 = initial gate); copied onto raw runs.
    pub fix_round: u32,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            continue_on_failure: true,
            fix_round: 0,
        }
    }
}

/// Verdict plus every raw check execution, rechecks included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRun {
    pub result: GateResult,
    pub runs: Vec<CheckRun>,
}

/// Run `checks` sequentially in `workdir`.
///
/// A check that cannot be executed aborts the whole gate with an error; a
/// check that runs and fails is only a failed entry in the result. Timed-out
/// checks are never auto-fixed.
#[instrument(skip_all, fields(checks = checks.len(), fix_round = options.fix_round))]
pub fn run_gate(
    runner: &dyn CheckRunner,
    workdir: &Path,
    checks: &[CheckConfig],
    options: &GateOptions,
) -> Result<GateRun> {
    let mut results = Vec::with_capacity(checks.len());
    let mut runs = Vec::new();

    for check in checks {
        let mut run = runner.run_check(workdir, check)?;
        run.fix_round = options.fix_round;
        let mut auto_fixed = false;

        if !run.passed && !run.timed_out && check.auto_fix.is_some() {
            debug!(check = %check.name, "check failed, running auto-fix");
            runs.push(run);
            runner.run_fix(workdir, check)?;
            auto_fixed = true;
            let mut recheck = runner.run_check(workdir, check)?;
            recheck.fix_round = options.fix_round;
            recheck.recheck = true;
            run = recheck;
        }

        let passed = run.passed;
        results.push(CheckResult {
            name: check.name.clone(),
            passed,
            auto_fixed,
            summary: run.summary.clone(),
        });
        runs.push(run);

        if !passed && !options.continue_on_failure {
            debug!(check = %check.name, "stopping gate at first failure");
            break;
        }
    }

    let result = GateResult::from_checks(results);
    info!(passed = result.passed, failing = ?result.failing_names(), "gate finished");
    Ok(GateRun { result, runs })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::io::parsers::ParserKind;
    use crate::test_support::{CheckScript, ScriptedChecks};

    fn check(name: &str, auto_fix: bool) -> CheckConfig {
        CheckConfig {
            name: name.to_string(),
            command: format!("run {name}"),
            parser: ParserKind::Generic,
            timeout: Duration::from_secs(5),
            auto_fix: auto_fix.then(|| format!("fix {name}")),
        }
    }

    #[test]
    fn auto_fix_reruns_once_and_marks_check() {
        let runner = ScriptedChecks::new()
            .script("fmt", [CheckScript::fail("diff"), CheckScript::Pass])
            .script("lint", [CheckScript::fail("warning")]);
        let run = run_gate(
            &runner,
            Path::new("/wt"),
            &[check("fmt", true), check("lint", false)],
            &GateOptions::default(),
        )
        .expect("gate");

        assert!(!run.result.passed);
        assert!(run.result.checks[0].passed);
        assert!(run.result.checks[0].auto_fixed);
        assert!(!run.result.checks[1].auto_fixed);
        assert_eq!(run.result.failures.get("lint").map(String::as_str), Some("warning"));
        assert_eq!(runner.calls(), vec!["run fmt", "fix fmt", "run fmt", "run lint"]);
        assert_eq!(run.runs.len(), 3);
        assert!(run.runs[1].recheck);
    }

    #[test]
    fn auto_fixed_flag_stays_when_recheck_fails() {
        let runner = ScriptedChecks::new().script("fmt", [CheckScript::fail("a"), CheckScript::fail("b")]);
        let run = run_gate(&runner, Path::new("/wt"), &[check("fmt", true)], &GateOptions::default())
            .expect("gate");
        assert!(run.result.checks[0].auto_fixed);
        assert_eq!(run.result.failures["fmt"], "b");
    }

    #[test]
    fn timeout_is_a_failure_without_auto_fix() {
        let runner = ScriptedChecks::new().script("test", [CheckScript::Timeout]);
        let run = run_gate(&runner, Path::new("/wt"), &[check("test", true)], &GateOptions::default())
            .expect("gate");
        assert_eq!(run.result.failures["test"], "timeout");
        assert_eq!(runner.calls(), vec!["run test"]);
    }

    #[test]
    fn stops_at_first_failure_unless_continuing() {
        let runner = ScriptedChecks::new()
            .script("a", [CheckScript::fail("x")])
            .script("b", [CheckScript::Pass]);
        let options = GateOptions {
            continue_on_failure: false,
            fix_round: 2,
        };
        let run = run_gate(&runner, Path::new("/wt"), &[check("a", false), check("b", false)], &options)
            .expect("gate");
        assert_eq!(run.result.checks.len(), 1);
        assert_eq!(run.runs[0].fix_round, 2);
    }

    #[test]
    fn execution_error_aborts_gate() {
        let runner = ScriptedChecks::new()
            .script("a", [CheckScript::Error])
            .script("b", [CheckScript::Pass]);
        let err = run_gate(&runner, Path::new("/wt"), &[check("a", false), check("b", false)], &GateOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("a"));
        assert_eq!(runner.calls(), vec!["run a"]);
    }

    #[test]
    fn empty_gate_passes() {
        let run = run_gate(&ScriptedChecks::new(), Path::new("/wt"), &[], &GateOptions::default())
            .expect("gate");
        assert!(run.result.passed);
    }
}
