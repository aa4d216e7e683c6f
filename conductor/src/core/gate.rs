//! Gate verdict aggregation.

use std::collections::BTreeMap;

use serde::Serialize;

/// Final result of one check within a gate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// The auto-fix command ran, whether or not the recheck passed.
    pub auto_fixed: bool,
    pub summary: String,
}

/// All-checks-considered verdict for one gate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
    /// Failure summary per check that is still failing.
    pub failures: BTreeMap<String, String>,
}

impl GateResult {
    /// Aggregate per-check results. `passed` holds iff no check is failing.
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let failures: BTreeMap<String, String> = checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| (check.name.clone(), check.summary.clone()))
            .collect();
        Self {
            passed: failures.is_empty(),
            checks,
            failures,
        }
    }

    pub fn failing_names(&self) -> Vec<&str> {
        self.failures.keys().map(String::as_str).collect()
    }
}
