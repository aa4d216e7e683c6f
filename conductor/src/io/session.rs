//! Agent session manager.
//!
//! The engine drives interactive agents through [`SessionManager`]. The
//! shipped adapter runs each agent in a detached tmux session and keeps a
//! small sidecar file per session (last engine message, last pane hash) so
//! idleness and human activity can be judged across separate invocations.

use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::session_name;
use crate::core::types::{SessionHandle, SessionMeta, SessionState, SessionStatus, WaitOutcome};
use crate::io::process::run_command_with_timeout;
use crate::io::store::write_atomic;

const TMUX_TIMEOUT: Duration = Duration::from_secs(10);
/// Client input this long after the engine's last message counts as a human.
const HUMAN_GRACE_SECS: i64 = 2;

/// What to start a session for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub issue: String,
    pub stage: String,
    pub attempt: u32,
    /// Set for fresh sessions opened by the fix loop.
    pub fix_round: Option<u32>,
    pub workdir: PathBuf,
    pub model: Option<String>,
}

pub trait SessionManager {
    fn create(&self, spec: &SessionSpec) -> Result<SessionMeta>;

    /// Deliver a prompt as if typed by the user.
    fn send(&self, handle: &SessionHandle, text: &str) -> Result<()>;

    /// Deliver an advisory message to a running agent.
    fn steer(&self, handle: &SessionHandle, text: &str) -> Result<()>;

    /// Block until the session goes quiet, exits, or `timeout` passes.
    fn wait_idle(&self, handle: &SessionHandle, timeout: Duration, poll: Duration)
    -> Result<WaitOutcome>;

    /// Terminate the session and return its captured output.
    ///
    /// Killing a session that no longer exists returns an empty log.
    fn kill(&self, handle: &SessionHandle) -> Result<String>;

    fn status(&self, handle: &SessionHandle) -> Result<SessionStatus>;

    /// True if someone other than the engine typed into the session since
    /// the engine's last message.
    fn detect_human_activity(&self, handle: &SessionHandle) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    last_sent_at: Option<DateTime<Utc>>,
    capture_hash: Option<u64>,
    last_activity: Option<DateTime<Utc>>,
}

/// tmux-backed session manager.
#[derive(Debug, Clone)]
pub struct TmuxSessions {
    sidecar_dir: PathBuf,
    agent_command: Vec<String>,
    flags: Vec<String>,
    output_limit_bytes: usize,
}

impl TmuxSessions {
    pub fn new(
        sidecar_dir: impl Into<PathBuf>,
        agent_command: Vec<String>,
        flags: Vec<String>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            sidecar_dir: sidecar_dir.into(),
            agent_command,
            flags,
            output_limit_bytes,
        }
    }

    fn command_line(&self, model: Option<&str>) -> String {
        let mut words = self.agent_command.clone();
        if let Some(model) = model {
            words.push("--model".to_string());
            words.push(model.to_string());
        }
        words.extend(self.flags.iter().cloned());
        shell_words::join(words)
    }

    fn sidecar_path(&self, handle: &SessionHandle) -> PathBuf {
        self.sidecar_dir.join(format!("{}.json", handle.as_str()))
    }

    fn read_sidecar(&self, handle: &SessionHandle) -> Result<Sidecar> {
        let path = self.sidecar_path(handle);
        if !path.exists() {
            return Ok(Sidecar::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    fn write_sidecar(&self, handle: &SessionHandle, sidecar: &Sidecar) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(sidecar)?;
        buf.push('\n');
        write_atomic(&self.sidecar_path(handle), &buf)
    }

    fn has_session(&self, handle: &SessionHandle) -> Result<bool> {
        Ok(tmux(&["has-session", "-t", handle.as_str()])?.status.success())
    }

    fn paste(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        let name = handle.as_str();
        let mut load = Command::new("tmux");
        load.args(["load-buffer", "-b", name, "-"]);
        let output = run_command_with_timeout(load, Some(text.as_bytes()), TMUX_TIMEOUT, 4096)
            .context("tmux load-buffer")?;
        if !output.success() {
            return Err(anyhow!(
                "tmux load-buffer failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        tmux_checked(&["paste-buffer", "-d", "-p", "-b", name, "-t", name])?;
        tmux_checked(&["send-keys", "-t", name, "Enter"])?;

        let mut sidecar = self.read_sidecar(handle)?;
        sidecar.last_sent_at = Some(Utc::now());
        sidecar.capture_hash = None;
        self.write_sidecar(handle, &sidecar)
    }
}

impl SessionManager for TmuxSessions {
    #[instrument(skip_all, fields(issue = %spec.issue, stage = %spec.stage, attempt = spec.attempt))]
    fn create(&self, spec: &SessionSpec) -> Result<SessionMeta> {
        let name = session_name(&spec.issue, &spec.stage, spec.attempt, spec.fix_round);
        let handle = SessionHandle(name.clone());
        if self.has_session(&handle)? {
            warn!(session = %name, "replacing stale session");
            tmux_checked(&["kill-session", "-t", &name])?;
        }
        let workdir = spec.workdir.to_string_lossy();
        let command = self.command_line(spec.model.as_deref());
        tmux_checked(&[
            "new-session",
            "-d",
            "-s",
            &name,
            "-c",
            &workdir,
            "-x",
            "220",
            "-y",
            "50",
            &command,
            ";",
            "set-window-option",
            "-t",
            &name,
            "remain-on-exit",
            "on",
        ])
        .with_context(|| format!("start session {name}"))?;

        let now = Utc::now();
        self.write_sidecar(
            &handle,
            &Sidecar {
                last_sent_at: None,
                capture_hash: None,
                last_activity: Some(now),
            },
        )?;
        info!(session = %name, "session started");
        Ok(SessionMeta {
            handle,
            name,
            issue: spec.issue.clone(),
            stage: spec.stage.clone(),
            attempt: spec.attempt,
            fix_round: spec.fix_round,
            created_at: now,
        })
    }

    #[instrument(skip_all, fields(session = %handle))]
    fn send(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        debug!(bytes = text.len(), "sending prompt");
        self.paste(handle, text)
    }

    #[instrument(skip_all, fields(session = %handle))]
    fn steer(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        info!("steering session");
        self.paste(handle, text)
    }

    #[instrument(skip_all, fields(session = %handle, timeout_secs = timeout.as_secs()))]
    fn wait_idle(
        &self,
        handle: &SessionHandle,
        timeout: Duration,
        poll: Duration,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(poll.min(remaining));
            match self.status(handle)?.state {
                SessionState::Idle => return Ok(WaitOutcome::Idle),
                SessionState::Exited | SessionState::Missing => return Ok(WaitOutcome::Exited),
                SessionState::Started | SessionState::Active => {}
            }
            if Instant::now() >= deadline {
                warn!("session did not go idle before timeout");
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    #[instrument(skip_all, fields(session = %handle))]
    fn kill(&self, handle: &SessionHandle) -> Result<String> {
        let sidecar = self.sidecar_path(handle);
        if !self.has_session(handle)? {
            debug!("session already gone");
            let _ = fs::remove_file(&sidecar);
            return Ok(String::new());
        }
        let name = handle.as_str();
        let log = tmux_checked(&["capture-pane", "-p", "-J", "-S", "-", "-t", name])
            .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
            .unwrap_or_else(|err| {
                warn!(err = %err, "failed to capture session output");
                String::new()
            });
        tmux_checked(&["kill-session", "-t", name])?;
        if let Err(err) = fs::remove_file(&sidecar) {
            debug!(err = %err, "no sidecar to remove");
        }
        info!("session killed");
        Ok(tail_bytes(&log, self.output_limit_bytes).to_string())
    }

    fn status(&self, handle: &SessionHandle) -> Result<SessionStatus> {
        if !self.has_session(handle)? {
            return Ok(SessionStatus {
                state: SessionState::Missing,
                started_at: None,
                last_activity: None,
            });
        }
        let name = handle.as_str();
        let out = tmux_checked(&[
            "display-message",
            "-p",
            "-t",
            name,
            "#{pane_dead}|#{session_created}",
        ])?;
        let (pane_dead, created) = parse_pane_info(&String::from_utf8_lossy(&out.stdout))?;
        let capture = tmux_checked(&["capture-pane", "-p", "-t", name])?;
        let screen = String::from_utf8_lossy(&capture.stdout);
        let hash = screen_hash(&screen);

        let mut sidecar = self.read_sidecar(handle)?;
        let state = classify(pane_dead, sidecar.capture_hash, hash, !screen.trim().is_empty());
        if sidecar.capture_hash != Some(hash) {
            sidecar.capture_hash = Some(hash);
            sidecar.last_activity = Some(Utc::now());
            self.write_sidecar(handle, &sidecar)?;
        }
        debug!(session = %name, state = ?state, "session status");
        Ok(SessionStatus {
            state,
            started_at: DateTime::from_timestamp(created, 0),
            last_activity: sidecar.last_activity,
        })
    }

    fn detect_human_activity(&self, handle: &SessionHandle) -> Result<bool> {
        if !self.has_session(handle)? {
            return Ok(false);
        }
        let out = tmux_checked(&["list-clients", "-t", handle.as_str(), "-F", "#{client_activity}"])?;
        let Some(client_activity) = latest_client_activity(&String::from_utf8_lossy(&out.stdout))
        else {
            return Ok(false);
        };
        let sidecar = self.read_sidecar(handle)?;
        let Some(baseline) = sidecar.last_sent_at.or(sidecar.last_activity) else {
            return Ok(true);
        };
        Ok(client_activity > baseline.timestamp() + HUMAN_GRACE_SECS)
    }
}

fn classify(
    pane_dead: bool,
    previous_hash: Option<u64>,
    current_hash: u64,
    has_output: bool,
) -> SessionState {
    if pane_dead {
        SessionState::Exited
    } else if !has_output {
        SessionState::Started
    } else if previous_hash == Some(current_hash) {
        SessionState::Idle
    } else {
        SessionState::Active
    }
}

fn parse_pane_info(line: &str) -> Result<(bool, i64)> {
    let (dead, created) = line
        .trim()
        .split_once('|')
        .ok_or_else(|| anyhow!("unexpected tmux pane info '{}'", line.trim()))?;
    let created = created
        .parse::<i64>()
        .with_context(|| format!("parse session_created '{created}'"))?;
    Ok((dead == "1", created))
}

fn latest_client_activity(output: &str) -> Option<i64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<i64>().ok())
        .max()
}

fn screen_hash(screen: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    screen.hash(&mut hasher);
    hasher.finish()
}

fn tail_bytes(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn tmux(args: &[&str]) -> Result<Output> {
    Command::new("tmux")
        .args(args)
        .output()
        .with_context(|| format!("spawn tmux {}", args.first().copied().unwrap_or_default()))
}

fn tmux_checked(args: &[&str]) -> Result<Output> {
    let output = tmux(args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        ));
    }
    Ok(output)
}
