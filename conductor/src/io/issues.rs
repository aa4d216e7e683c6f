//! Issue tracker clients.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::store::validate_issue_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub body: String,
}

pub trait IssueTracker {
    fn fetch(&self, id: &str) -> Result<Issue>;
}

/// GitHub issues through the `gh` CLI.
#[derive(Debug, Clone, Default)]
pub struct GhIssueTracker {
    repo: Option<String>,
}

impl GhIssueTracker {
    pub fn new(repo: Option<String>) -> Self {
        Self { repo }
    }
}

#[derive(Deserialize)]
struct GhIssue {
    title: String,
    #[serde(default)]
    body: Option<String>,
}

impl IssueTracker for GhIssueTracker {
    #[instrument(skip_all, fields(issue = id))]
    fn fetch(&self, id: &str) -> Result<Issue> {
        let mut cmd = Command::new("gh");
        cmd.args(["issue", "view", id, "--json", "title,body"]);
        if let Some(repo) = &self.repo {
            cmd.args(["--repo", repo]);
        }
        let output = cmd.output().context("spawn gh issue view")?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh issue view {id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let issue = parse_gh_issue(id, &String::from_utf8_lossy(&output.stdout))?;
        debug!(title = %issue.title, "fetched issue");
        Ok(issue)
    }
}

fn parse_gh_issue(id: &str, json: &str) -> Result<Issue> {
    let raw: GhIssue = serde_json::from_str(json).context("parse gh issue json")?;
    Ok(Issue {
        id: id.to_string(),
        title: raw.title,
        body: raw.body.unwrap_or_default(),
    })
}

/// Markdown files named `<id>.md`; the first line is the title.
#[derive(Debug, Clone)]
pub struct FileIssueTracker {
    dir: PathBuf,
}

impl FileIssueTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl IssueTracker for FileIssueTracker {
    fn fetch(&self, id: &str) -> Result<Issue> {
        validate_issue_id(id)?;
        let path = self.dir.join(format!("{id}.md"));
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read issue {}", path.display()))?;
        Ok(parse_issue_file(id, &contents))
    }
}

fn parse_issue_file(id: &str, contents: &str) -> Issue {
    let (first, rest) = contents.split_once('\n').unwrap_or((contents, ""));
    Issue {
        id: id.to_string(),
        title: first.trim().trim_start_matches('#').trim().to_string(),
        body: rest.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gh_json_with_null_body() {
        let issue = parse_gh_issue("12", r#"{"title":"Crash on start","body":null}"#).expect("parse");
        assert_eq!(issue.title, "Crash on start");
        assert_eq!(issue.body, "");
    }

    #[test]
    fn file_issue_uses_heading_as_title() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("7.md"), "# Add retries\n\nRetry failed uploads.\n").expect("write");
        let issue = FileIssueTracker::new(temp.path()).fetch("7").expect("fetch");
        assert_eq!(issue.title, "Add retries");
        assert_eq!(issue.body, "Retry failed uploads.");
    }

    #[test]
    fn missing_issue_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(FileIssueTracker::new(temp.path()).fetch("404").is_err());
    }
}
