//! Stage prompt rendering and cross-stage checkpoints.
//!
//! Each finished attempt leaves a checkpoint (`context/<issue>.jsonl`). Later
//! prompts include all of them, the latest one, or none, depending on the
//! stage's context mode. Rendered prompts are kept under
//! `context/<issue>/<stage>-<attempt>.md` so a restarted attempt gets the
//! same prompt back.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{ContextMode, StageOutcome};
use crate::io::config::StageConfig;
use crate::io::issues::Issue;
use crate::io::store::{validate_issue_id, write_atomic};
use crate::state::PipelineState;

const DEFAULT_STAGE_TEMPLATE: &str = include_str!("../../templates/stage.md");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: String,
    pub attempt: u32,
    pub status: StageOutcome,
    pub summary: String,
    pub recorded_at: DateTime<Utc>,
}

pub trait ContextBuilder {
    /// Render and keep the prompt for the pipeline's current stage attempt.
    fn build(&self, state: &PipelineState, stage: &StageConfig, issue: &Issue) -> Result<String>;

    fn checkpoint(&self, issue: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// The prompt previously built for this stage attempt, if any.
    fn read_context(&self, issue: &str, stage: &str, attempt: u32) -> Result<Option<String>>;

    /// Checkpoints recorded before the given stage attempt, oldest first.
    fn checkpoints_before(&self, issue: &str, stage: &str, attempt: u32) -> Result<Vec<Checkpoint>>;
}

/// minijinja-rendered prompts with JSONL checkpoints.
#[derive(Debug, Clone)]
pub struct TemplateContextBuilder {
    dir: PathBuf,
}

impl TemplateContextBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn checkpoint_path(&self, issue: &str) -> Result<PathBuf> {
        validate_issue_id(issue)?;
        Ok(self.dir.join(format!("{issue}.jsonl")))
    }

    fn prompt_path(&self, issue: &str, stage: &str, attempt: u32) -> Result<PathBuf> {
        validate_issue_id(issue)?;
        Ok(self.dir.join(issue).join(format!("{stage}-{attempt}.md")))
    }
}

impl ContextBuilder for TemplateContextBuilder {
    #[instrument(skip_all, fields(issue = %state.issue, stage = %stage.id))]
    fn build(&self, state: &PipelineState, stage: &StageConfig, issue: &Issue) -> Result<String> {
        let template = match &stage.prompt {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read prompt template {}", path.display()))?,
            None => DEFAULT_STAGE_TEMPLATE.to_string(),
        };
        let checkpoints = select_context(
            stage.context,
            self.checkpoints_before(&state.issue, &stage.id, state.current_attempt)?,
        );
        let prompt = render_stage_prompt(&template, state, stage, issue, &checkpoints)?;
        debug!(bytes = prompt.len(), checkpoints = checkpoints.len(), "prompt rendered");
        write_atomic(
            &self.prompt_path(&state.issue, &stage.id, state.current_attempt)?,
            &prompt,
        )?;
        Ok(prompt)
    }

    fn checkpoint(&self, issue: &str, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(issue)?;
        fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        let mut line = serde_json::to_string(checkpoint)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("append checkpoint {}", path.display()))
    }

    fn read_context(&self, issue: &str, stage: &str, attempt: u32) -> Result<Option<String>> {
        let path = self.prompt_path(issue, stage, attempt)?;
        if !path.exists() {
            return Ok(None);
        }
        let prompt =
            fs::read_to_string(&path).with_context(|| format!("read prompt {}", path.display()))?;
        Ok(Some(prompt))
    }

    fn checkpoints_before(&self, issue: &str, stage: &str, attempt: u32) -> Result<Vec<Checkpoint>> {
        let path = self.checkpoint_path(issue)?;
        let all = read_checkpoints(&path)?;
        Ok(all
            .into_iter()
            .filter(|cp| !(cp.stage == stage && cp.attempt == attempt))
            .collect())
    }
}

fn read_checkpoints(path: &Path) -> Result<Vec<Checkpoint>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("parse checkpoint in {}", path.display()))
        })
        .collect()
}

/// Apply a stage's context mode to the recorded checkpoints.
pub fn select_context(mode: ContextMode, mut checkpoints: Vec<Checkpoint>) -> Vec<Checkpoint> {
    match mode {
        ContextMode::Full => checkpoints,
        ContextMode::Summary => checkpoints.pop().into_iter().collect(),
        ContextMode::Disabled => Vec::new(),
    }
}

#[derive(Serialize)]
struct CheckpointView<'a> {
    stage: &'a str,
    attempt: u32,
    status: &'static str,
    summary: &'a str,
}

pub fn render_stage_prompt(
    template: &str,
    state: &PipelineState,
    stage: &StageConfig,
    issue: &Issue,
    checkpoints: &[Checkpoint],
) -> Result<String> {
    let views: Vec<CheckpointView<'_>> = checkpoints
        .iter()
        .map(|cp| CheckpointView {
            stage: &cp.stage,
            attempt: cp.attempt,
            status: cp.status.as_str(),
            summary: cp.summary.trim(),
        })
        .collect();
    let env = Environment::new();
    let rendered = env
        .render_str(
            template,
            context! {
                issue => context! {
                    id => issue.id.as_str(),
                    title => issue.title.as_str(),
                    body => issue.body.trim(),
                },
                stage => context! {
                    id => stage.id.as_str(),
                    attempt => state.current_attempt,
                },
                branch => state.branch.as_str(),
                workdir => state.workdir.to_string_lossy(),
                context => views,
                checks => stage.gate_checks(),
            },
        )
        .with_context(|| format!("render prompt for stage '{}'", stage.id))?;
    Ok(rendered)
}
