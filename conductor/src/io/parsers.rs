//! Check output summarizers.
//!
//! A summarizer turns raw check output into the short failure text that
//! ends up in fix prompts. They only pick lines; they do not interpret them.

use std::sync::LazyLock;

use regex::Regex;

const MAX_SUMMARY_LINES: usize = 40;
const GENERIC_TAIL_LINES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// Tail of the combined output.
    Generic,
    /// rustc/clippy diagnostics and failed `cargo test` cases.
    Cargo,
    Pytest,
    Eslint,
}

impl ParserKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "generic" => Some(ParserKind::Generic),
            "cargo" => Some(ParserKind::Cargo),
            "pytest" => Some(ParserKind::Pytest),
            "eslint" => Some(ParserKind::Eslint),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParserKind::Generic => "generic",
            ParserKind::Cargo => "cargo",
            ParserKind::Pytest => "pytest",
            ParserKind::Eslint => "eslint",
        }
    }
}

static CARGO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(error(\[E\d+\])?:.*|test .+ \.\.\. FAILED|\s+-->\s.+|thread '.+' panicked at .+)$")
        .expect("cargo summary regex")
});
static PYTEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(FAILED|ERROR) .+").expect("pytest summary regex"));
static ESLINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s+\d+:\d+\s+error\s.+|/.+\.[cm]?[jt]sx?|✖ \d+ problems?.*)$")
        .expect("eslint summary regex")
});

/// Summarize check output for a failing check.
///
/// Falls back to the output tail when the parser recognizes nothing.
pub fn summarize(kind: ParserKind, output: &str) -> String {
    let matcher = match kind {
        ParserKind::Generic => return tail(output, GENERIC_TAIL_LINES),
        ParserKind::Cargo => &*CARGO_RE,
        ParserKind::Pytest => &*PYTEST_RE,
        ParserKind::Eslint => &*ESLINT_RE,
    };
    let picked: Vec<&str> = output
        .lines()
        .filter(|line| matcher.is_match(line))
        .take(MAX_SUMMARY_LINES)
        .collect();
    if picked.is_empty() {
        return tail(output, GENERIC_TAIL_LINES);
    }
    picked.join("\n")
}

fn tail(output: &str, lines: usize) -> String {
    let non_empty: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = non_empty.len().saturating_sub(lines);
    non_empty[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cargo_picks_diagnostics_and_failed_tests() {
        let output = "\
   Compiling demo v0.1.0
error[E0425]: cannot find value `x` in this scope
  --> src/lib.rs:3:5
running 2 tests
test tests::ok ... ok
test tests::broken ... FAILED
";
        let summary = summarize(ParserKind::Cargo, output);
        assert_eq!(
            summary,
            "error[E0425]: cannot find value `x` in this scope\n  --> src/lib.rs:3:5\ntest tests::broken ... FAILED"
        );
    }

    #[test]
    fn pytest_picks_failed_lines() {
        let output = "collected 3 items\n\nFAILED tests/test_a.py::test_x - assert 1 == 2\n1 failed, 2 passed\n";
        assert_eq!(
            summarize(ParserKind::Pytest, output),
            "FAILED tests/test_a.py::test_x - assert 1 == 2"
        );
    }

    #[test]
    fn eslint_picks_problem_lines() {
        let output = "/app/src/a.ts\n  3:7  error  'x' is unused  no-unused-vars\n\n✖ 1 problem (1 error, 0 warnings)\n";
        let summary = summarize(ParserKind::Eslint, output);
        assert!(summary.contains("/app/src/a.ts"));
        assert!(summary.contains("'x' is unused"));
        assert!(summary.contains("✖ 1 problem"));
    }

    #[test]
    fn unrecognized_output_falls_back_to_tail() {
        let output: String = (1..=50).map(|i| format!("line {i}\n")).collect();
        let summary = summarize(ParserKind::Cargo, &output);
        assert!(summary.starts_with("line 21"));
        assert!(summary.ends_with("line 50"));
    }

    #[test]
    fn parser_names_round_trip() {
        for kind in [ParserKind::Generic, ParserKind::Cargo, ParserKind::Pytest, ParserKind::Eslint] {
            assert_eq!(ParserKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ParserKind::parse("junit"), None);
    }
}
