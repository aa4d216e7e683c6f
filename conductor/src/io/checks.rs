//! Check runner adapter.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::io::config::CheckConfig;
use crate::io::parsers::summarize;
use crate::io::process::run_shell;

pub const TIMEOUT_SUMMARY: &str = "timeout";

/// Raw result of executing one check command once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRun {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Captured output, bounded by the configured limit.
    pub output: String,
    /// Parser summary; empty when the check passed.
    pub summary: String,
    /// Gate round the run belongs to (0 = initial gate).
    pub fix_round: u32,
    /// True for the recheck after an auto-fix.
    pub recheck: bool,
}

/// Executes check and auto-fix commands.
///
/// `Err` means the check could not be executed at all; a check that ran and
/// failed (or timed out) is an `Ok` with `passed = false`.
pub trait CheckRunner {
    fn run_check(&self, workdir: &Path, check: &CheckConfig) -> Result<CheckRun>;

    /// Run the check's auto-fix command. Its exit status is ignored.
    fn run_fix(&self, workdir: &Path, check: &CheckConfig) -> Result<()>;
}

/// Runs checks as `sh -c` commands.
#[derive(Debug, Clone)]
pub struct ShellCheckRunner {
    pub output_limit_bytes: usize,
}

impl ShellCheckRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl CheckRunner for ShellCheckRunner {
    #[instrument(skip_all, fields(check = %check.name))]
    fn run_check(&self, workdir: &Path, check: &CheckConfig) -> Result<CheckRun> {
        let output = run_shell(&check.command, workdir, check.timeout, self.output_limit_bytes)
            .with_context(|| format!("execute check '{}'", check.name))?;
        let text = output.combined_text();
        let passed = output.success();
        let summary = if output.timed_out {
            TIMEOUT_SUMMARY.to_string()
        } else if passed {
            String::new()
        } else {
            summarize(check.parser, &text)
        };
        debug!(passed, timed_out = output.timed_out, "check finished");
        Ok(CheckRun {
            name: check.name.clone(),
            passed,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            duration_ms: duration_ms(output.duration),
            output: text,
            summary,
            fix_round: 0,
            recheck: false,
        })
    }

    #[instrument(skip_all, fields(check = %check.name))]
    fn run_fix(&self, workdir: &Path, check: &CheckConfig) -> Result<()> {
        let Some(fix) = &check.auto_fix else {
            return Ok(());
        };
        let output = run_shell(fix, workdir, check.timeout, self.output_limit_bytes)
            .with_context(|| format!("execute auto-fix for '{}'", check.name))?;
        if !output.success() {
            warn!(
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                "auto-fix exited unsuccessfully"
            );
        }
        Ok(())
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::parsers::ParserKind;

    fn check(command: &str, auto_fix: Option<&str>) -> CheckConfig {
        CheckConfig {
            name: "demo".to_string(),
            command: command.to_string(),
            parser: ParserKind::Generic,
            timeout: Duration::from_secs(10),
            auto_fix: auto_fix.map(str::to_string),
        }
    }

    #[test]
    fn passing_check_has_empty_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = ShellCheckRunner::new(10_000)
            .run_check(temp.path(), &check("true", None))
            .expect("run");
        assert!(run.passed);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.summary.is_empty());
    }

    #[test]
    fn failing_check_is_summarized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = ShellCheckRunner::new(10_000)
            .run_check(temp.path(), &check("echo 'bad thing'; exit 1", None))
            .expect("run");
        assert!(!run.passed);
        assert_eq!(run.summary, "bad thing");
    }

    #[test]
    fn timed_out_check_fails_with_timeout_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut slow = check("exec sleep 5", None);
        slow.timeout = Duration::from_millis(100);
        let run = ShellCheckRunner::new(10_000).run_check(temp.path(), &slow).expect("run");
        assert!(!run.passed);
        assert!(run.timed_out);
        assert_eq!(run.summary, TIMEOUT_SUMMARY);
    }

    #[test]
    fn fix_exit_status_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        ShellCheckRunner::new(10_000)
            .run_fix(temp.path(), &check("true", Some("touch fixed; exit 7")))
            .expect("fix");
        assert!(temp.path().join("fixed").exists());
    }
}
