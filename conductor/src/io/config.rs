//! Pipeline definition loaded from `conductor.toml`.
//!
//! The file is parsed into raw serde structs, merged with defaults, and
//! validated once. Everything polymorphic in the file (`on_fail`, `context`,
//! `parser`) is resolved here into typed values so the engine never inspects
//! raw config again.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ContextMode, OnFail, StageType};
use crate::error::PreconditionError;
use crate::io::parsers::ParserKind;

pub const DEFAULT_CONFIG_FILE: &str = "conductor.toml";
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Global defaults, overridable per stage where noted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Defaults {
    /// Agent program and fixed arguments started inside each session.
    pub agent_command: Vec<String>,
    /// Model passed to the agent as `--model` (per-stage override).
    pub model: Option<String>,
    /// Extra flags appended to the agent command.
    pub flags: Vec<String>,
    /// Upper bound on waiting for one agent turn (per-stage override).
    pub stage_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Automatic same-stage attempts before the pipeline fails.
    pub max_attempts: u32,
    /// Fix rounds after a failed gate (per-stage override).
    pub max_fix_rounds: u32,
    /// Rounds above this number use a fresh session (per-stage override).
    pub fresh_session_after: u32,
    /// Used for checks that do not set `timeout_secs`.
    pub check_timeout_secs: u64,
    /// Truncate captured check and session output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            agent_command: vec!["claude".to_string()],
            model: None,
            flags: Vec::new(),
            stage_timeout_secs: 30 * 60,
            poll_interval_secs: 30,
            max_attempts: 3,
            max_fix_rounds: 3,
            fresh_session_after: 2,
            check_timeout_secs: DEFAULT_CHECK_TIMEOUT.as_secs(),
            output_limit_bytes: 100_000,
        }
    }
}

/// Where state and working copies live, relative to the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub state_dir: PathBuf,
    pub worktree_dir: PathBuf,
    /// Repository the worktrees are created from.
    pub repo: PathBuf,
    pub branch_prefix: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".conductor"),
            worktree_dir: PathBuf::from(".conductor/worktrees"),
            repo: PathBuf::from("."),
            branch_prefix: "conductor/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueSource {
    /// GitHub issues via the `gh` CLI.
    #[default]
    Github,
    /// Markdown files named `<issue>.md`.
    Files,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IssuesConfig {
    pub source: IssueSource,
    /// `owner/name` for GitHub; defaults to the current repository.
    pub repo: Option<String>,
    pub dir: PathBuf,
}

impl Default for IssuesConfig {
    fn default() -> Self {
        Self {
            source: IssueSource::Github,
            repo: None,
            dir: PathBuf::from("issues"),
        }
    }
}

/// A named deterministic check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConfig {
    pub name: String,
    /// Shell command run in the working copy; exit 0 means pass.
    pub command: String,
    pub parser: ParserKind,
    pub timeout: Duration,
    /// Command run once after a failure, before one recheck.
    pub auto_fix: Option<String>,
}

/// A resolved stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub id: String,
    pub kind: StageType,
    pub checks_before: Vec<String>,
    pub checks_after: Vec<String>,
    pub extra_checks: Vec<String>,
    pub skip_checks: bool,
    pub on_fail: OnFail,
    pub goal_gate: bool,
    /// Prompt template, absolute.
    pub prompt: Option<PathBuf>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub max_fix_rounds: u32,
    pub fresh_session_after: u32,
    pub context: ContextMode,
}

impl StageConfig {
    /// De-duplicated union of after- and extra-checks, in declaration order.
    ///
    /// Empty when the stage skips checks.
    pub fn gate_checks(&self) -> Vec<String> {
        if self.skip_checks {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        self.checks_after
            .iter()
            .chain(&self.extra_checks)
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Validated, defaults-merged pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory containing the config file; relative paths resolve here.
    pub root: PathBuf,
    pub defaults: Defaults,
    pub workspace: WorkspaceConfig,
    pub issues: IssuesConfig,
    pub checks: BTreeMap<String, CheckConfig>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    defaults: Defaults,
    #[serde(default)]
    workspace: WorkspaceConfig,
    #[serde(default)]
    issues: IssuesConfig,
    #[serde(default)]
    checks: BTreeMap<String, RawCheck>,
    #[serde(default)]
    stages: Vec<RawStage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheck {
    command: String,
    #[serde(default)]
    parser: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    auto_fix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    id: String,
    #[serde(rename = "type", default)]
    kind: StageType,
    #[serde(default)]
    checks_before: Vec<String>,
    #[serde(default)]
    checks_after: Vec<String>,
    #[serde(default)]
    extra_checks: Vec<String>,
    #[serde(default)]
    skip_checks: bool,
    #[serde(default)]
    on_fail: Option<RawOnFail>,
    #[serde(default)]
    goal_gate: bool,
    #[serde(default)]
    prompt: Option<PathBuf>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    max_fix_rounds: Option<u32>,
    #[serde(default)]
    fresh_session_after: Option<u32>,
    #[serde(default)]
    context: Option<String>,
}

/// `on_fail = "escalate"`, `on_fail = "<stage>"`, or a table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOnFail {
    Name(String),
    Table(RawOnFailTable),
}

#[derive(Debug, Deserialize)]
struct RawOnFailTable {
    #[serde(default)]
    route_to: Option<String>,
    #[serde(default)]
    escalate: Option<bool>,
    /// Keys other than the two above, reported as errors.
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

/// Load and validate the pipeline definition.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    debug!(path = %path.display(), "loading pipeline config");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let root = if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    };
    parse_config(&contents, &root).with_context(|| format!("load {}", path.display()))
}

/// Parse config text; relative paths resolve against `root`.
pub fn parse_config(contents: &str, root: &Path) -> Result<PipelineConfig> {
    let raw: RawConfig = toml::from_str(contents).context("parse pipeline config toml")?;
    let config = resolve(raw, root)?;
    config.validate()?;
    debug!(stages = config.stages.len(), checks = config.checks.len(), "pipeline config loaded");
    Ok(config)
}

fn resolve(raw: RawConfig, root: &Path) -> Result<PipelineConfig, PreconditionError> {
    let defaults = raw.defaults;
    let mut checks = BTreeMap::new();
    for (name, check) in raw.checks {
        let parser = match check.parser.as_deref() {
            None => ParserKind::Generic,
            Some(value) => ParserKind::parse(value).ok_or_else(|| PreconditionError::UnknownParser {
                check: name.clone(),
                parser: value.to_string(),
            })?,
        };
        let timeout = Duration::from_secs(check.timeout_secs.unwrap_or(defaults.check_timeout_secs));
        checks.insert(
            name.clone(),
            CheckConfig {
                name,
                command: check.command,
                parser,
                timeout,
                auto_fix: check.auto_fix.filter(|cmd| !cmd.trim().is_empty()),
            },
        );
    }

    let mut stages = Vec::with_capacity(raw.stages.len());
    for stage in raw.stages {
        let on_fail = resolve_on_fail(&stage.id, stage.on_fail)?;
        let context = match stage.context.as_deref() {
            None | Some("full") => ContextMode::Full,
            Some("summary") => ContextMode::Summary,
            Some("none") => ContextMode::Disabled,
            Some(other) => {
                return Err(PreconditionError::InvalidContextMode {
                    stage: stage.id.clone(),
                    mode: other.to_string(),
                });
            }
        };
        stages.push(StageConfig {
            timeout: Duration::from_secs(stage.timeout_secs.unwrap_or(defaults.stage_timeout_secs)),
            max_fix_rounds: stage.max_fix_rounds.unwrap_or(defaults.max_fix_rounds),
            fresh_session_after: stage
                .fresh_session_after
                .unwrap_or(defaults.fresh_session_after),
            model: stage.model.or_else(|| defaults.model.clone()),
            prompt: stage.prompt.map(|p| root.join(p)),
            id: stage.id,
            kind: stage.kind,
            checks_before: stage.checks_before,
            checks_after: stage.checks_after,
            extra_checks: stage.extra_checks,
            skip_checks: stage.skip_checks,
            on_fail,
            goal_gate: stage.goal_gate,
            context,
        });
    }

    Ok(PipelineConfig {
        root: root.to_path_buf(),
        defaults,
        workspace: raw.workspace,
        issues: raw.issues,
        checks,
        stages,
    })
}

fn resolve_on_fail(stage: &str, raw: Option<RawOnFail>) -> Result<OnFail, PreconditionError> {
    let invalid = |reason: &str| PreconditionError::InvalidOnFail {
        stage: stage.to_string(),
        reason: reason.to_string(),
    };
    match raw {
        None => Ok(OnFail::Retry),
        Some(RawOnFail::Name(name)) => match name.trim() {
            "" => Err(invalid("empty value")),
            "escalate" => Ok(OnFail::Escalate),
            "retry" => Ok(OnFail::Retry),
            target => Ok(OnFail::RouteTo(target.to_string())),
        },
        Some(RawOnFail::Table(table)) => {
            if let Some(key) = table.unknown.keys().next() {
                return Err(invalid(&format!("unknown key '{key}'")));
            }
            match (table.route_to, table.escalate) {
                (Some(_), Some(true)) => Err(invalid("both route_to and escalate set")),
                (Some(target), _) => Ok(OnFail::RouteTo(target)),
                (None, Some(true)) => Ok(OnFail::Escalate),
                (None, _) => Ok(OnFail::Retry),
            }
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PreconditionError> {
        let invalid = |msg: &str| Err(PreconditionError::InvalidConfig(msg.to_string()));
        if self.stages.is_empty() {
            return invalid("at least one [[stages]] entry is required");
        }
        if self.defaults.max_attempts == 0 {
            return invalid("defaults.max_attempts must be > 0");
        }
        if self.defaults.poll_interval_secs == 0 {
            return invalid("defaults.poll_interval_secs must be > 0");
        }
        if self.defaults.output_limit_bytes == 0 {
            return invalid("defaults.output_limit_bytes must be > 0");
        }
        if self.defaults.agent_command.is_empty() || self.defaults.agent_command[0].trim().is_empty()
        {
            return invalid("defaults.agent_command must be a non-empty array");
        }
        for check in self.checks.values() {
            if check.command.trim().is_empty() {
                return Err(PreconditionError::InvalidConfig(format!(
                    "check '{}' has an empty command",
                    check.name
                )));
            }
            if check.timeout.is_zero() {
                return Err(PreconditionError::InvalidConfig(format!(
                    "check '{}' timeout must be > 0",
                    check.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return invalid("stage id must be non-empty");
            }
            if !ids.insert(stage.id.as_str()) {
                return Err(PreconditionError::DuplicateStage(stage.id.clone()));
            }
            if stage.timeout.is_zero() {
                return Err(PreconditionError::InvalidConfig(format!(
                    "stage '{}' timeout must be > 0",
                    stage.id
                )));
            }
        }
        for stage in &self.stages {
            for name in stage
                .checks_before
                .iter()
                .chain(&stage.checks_after)
                .chain(&stage.extra_checks)
            {
                if !self.checks.contains_key(name) {
                    return Err(PreconditionError::UnknownCheck(name.clone()));
                }
            }
            if let OnFail::RouteTo(target) = &stage.on_fail
                && !ids.contains(target.as_str())
            {
                return Err(PreconditionError::InvalidOnFailTarget {
                    stage: stage.id.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn stage(&self, id: &str) -> Result<&StageConfig, PreconditionError> {
        self.stages
            .iter()
            .find(|stage| stage.id == id)
            .ok_or_else(|| PreconditionError::UnknownStage(id.to_string()))
    }

    pub fn first_stage(&self) -> Result<&StageConfig, PreconditionError> {
        self.stages
            .first()
            .ok_or_else(|| PreconditionError::InvalidConfig("no stages configured".to_string()))
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.id.as_str()).collect()
    }

    pub fn goal_gate_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| stage.goal_gate)
            .map(|stage| stage.id.as_str())
            .collect()
    }

    /// Resolve check names to their definitions, preserving order.
    pub fn checks_for(&self, names: &[String]) -> Result<Vec<CheckConfig>, PreconditionError> {
        names
            .iter()
            .map(|name| {
                self.checks
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PreconditionError::UnknownCheck(name.clone()))
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.defaults.poll_interval_secs)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.workspace.state_dir)
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.root.join(&self.workspace.worktree_dir)
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join(&self.workspace.repo)
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.root.join(&self.issues.dir)
    }

    pub fn branch_for(&self, issue: &str) -> String {
        format!("{}{issue}", self.workspace.branch_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
model = "sonnet"
max_fix_rounds = 4

[checks.lint]
command = "cargo clippy -- -D warnings"
parser = "cargo"
auto_fix = "cargo clippy --fix --allow-dirty"

[checks.test]
command = "cargo test"
timeout_secs = 600

[[stages]]
id = "implement"
checks_after = ["lint", "test"]
extra_checks = ["lint"]
prompt = "prompts/implement.md"

[[stages]]
id = "review"
checks_after = ["lint"]
goal_gate = true
on_fail = { route_to = "implement" }
context = "summary"
fresh_session_after = 1

[[stages]]
id = "verify"
type = "checks_only"
checks_after = ["test"]
on_fail = "escalate"
"#;

    fn parse(contents: &str) -> Result<PipelineConfig> {
        parse_config(contents, Path::new("/repo"))
    }

    fn precondition(err: anyhow::Error) -> PreconditionError {
        err.downcast::<PreconditionError>().expect("precondition error")
    }

    #[test]
    fn parses_and_merges_defaults() {
        let cfg = parse(SAMPLE).expect("parse");
        assert_eq!(cfg.stage_ids(), vec!["implement", "review", "verify"]);

        let implement = cfg.stage("implement").expect("implement");
        assert_eq!(implement.kind, StageType::Agent);
        assert_eq!(implement.max_fix_rounds, 4);
        assert_eq!(implement.fresh_session_after, 2);
        assert_eq!(implement.model.as_deref(), Some("sonnet"));
        assert_eq!(implement.timeout, Duration::from_secs(1800));
        assert_eq!(implement.on_fail, OnFail::Retry);
        assert_eq!(implement.prompt, Some(PathBuf::from("/repo/prompts/implement.md")));

        let review = cfg.stage("review").expect("review");
        assert_eq!(review.on_fail, OnFail::RouteTo("implement".to_string()));
        assert_eq!(review.context, ContextMode::Summary);
        assert_eq!(review.fresh_session_after, 1);

        let verify = cfg.stage("verify").expect("verify");
        assert_eq!(verify.kind, StageType::ChecksOnly);
        assert_eq!(verify.on_fail, OnFail::Escalate);

        assert_eq!(cfg.goal_gate_stages(), vec!["review"]);
        assert_eq!(cfg.checks["lint"].parser, ParserKind::Cargo);
        assert_eq!(cfg.checks["lint"].timeout, DEFAULT_CHECK_TIMEOUT);
        assert_eq!(cfg.checks["test"].timeout, Duration::from_secs(600));
        assert_eq!(cfg.checks["test"].parser, ParserKind::Generic);
    }

    #[test]
    fn gate_checks_are_deduplicated_in_order() {
        let cfg = parse(SAMPLE).expect("parse");
        let implement = cfg.stage("implement").expect("implement");
        assert_eq!(implement.gate_checks(), vec!["lint".to_string(), "test".to_string()]);

        let mut skipping = implement.clone();
        skipping.skip_checks = true;
        assert!(skipping.gate_checks().is_empty());
    }

    #[test]
    fn unknown_check_is_rejected() {
        let err = parse(
            r#"
[[stages]]
id = "a"
checks_after = ["nope"]
"#,
        )
        .unwrap_err();
        assert_eq!(precondition(err), PreconditionError::UnknownCheck("nope".to_string()));
    }

    #[test]
    fn unknown_route_target_is_rejected() {
        let err = parse(
            r#"
[[stages]]
id = "a"
on_fail = "b"
"#,
        )
        .unwrap_err();
        assert_eq!(
            precondition(err),
            PreconditionError::InvalidOnFailTarget {
                stage: "a".to_string(),
                target: "b".to_string()
            }
        );
    }

    #[test]
    fn invalid_context_mode_is_rejected() {
        let err = parse(
            r#"
[[stages]]
id = "a"
context = "everything"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            precondition(err),
            PreconditionError::InvalidContextMode { .. }
        ));
    }

    #[test]
    fn on_fail_table_forms() {
        let cfg = parse(
            r#"
[[stages]]
id = "a"
on_fail = { escalate = true }

[[stages]]
id = "b"
on_fail = {}
"#,
        )
        .expect("parse");
        assert_eq!(cfg.stage("a").expect("a").on_fail, OnFail::Escalate);
        assert_eq!(cfg.stage("b").expect("b").on_fail, OnFail::Retry);
    }

    #[test]
    fn misspelled_on_fail_key_is_rejected() {
        let err = parse("[[stages]]\nid = \"a\"\non_fail = { escalte = true }\n").unwrap_err();
        assert_eq!(
            precondition(err),
            PreconditionError::InvalidOnFail {
                stage: "a".to_string(),
                reason: "unknown key 'escalte'".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_stage_and_empty_pipeline_are_rejected() {
        let err = parse("[[stages]]\nid = \"a\"\n\n[[stages]]\nid = \"a\"\n").unwrap_err();
        assert_eq!(precondition(err), PreconditionError::DuplicateStage("a".to_string()));

        let err = parse("").unwrap_err();
        assert!(matches!(precondition(err), PreconditionError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_parser_is_rejected() {
        let err = parse(
            r#"
[checks.lint]
command = "x"
parser = "yaml"

[[stages]]
id = "a"
"#,
        )
        .unwrap_err();
        assert!(matches!(precondition(err), PreconditionError::UnknownParser { .. }));
    }

    #[test]
    fn load_resolves_paths_against_config_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "[[stages]]\nid = \"only\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.state_dir(), temp.path().join(".conductor"));
        assert_eq!(cfg.branch_for("12"), "conductor/12");
    }
}
