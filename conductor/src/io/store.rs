//! Durable pipeline state with schema validation on load.
//!
//! Layout under the state directory:
//!
//! ```text
//! pipelines/<issue>/state.json
//! pipelines/<issue>/state.lock
//! pipelines/<issue>/advance.lock
//! pipelines/<issue>/attempts/<stage>-<attempt>/{prompt.md, session.log, outcome.json}
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::RunResult;
use crate::error::PreconditionError;
use crate::state::PipelineState;

const STATE_SCHEMA: &str = include_str!("../../schemas/pipeline_state.schema.json");
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY: Duration = Duration::from_millis(50);
/// State updates are short; a state lock held longer than this is abandoned.
const STATE_LOCK_MAX_HOLD: Duration = Duration::from_secs(10);
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(5);

static STATE_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(STATE_SCHEMA).map_err(|err| format!("parse state schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid state schema: {err}"))
});

/// Addresses the artifacts of one stage attempt.
///
/// `round` is 0 for the main agent turn and the fix round number for fresh
/// fix-loop sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptKey {
    pub issue: String,
    pub stage: String,
    pub attempt: u32,
    pub round: u32,
}

impl AttemptKey {
    pub fn new(issue: &str, stage: &str, attempt: u32) -> Self {
        Self {
            issue: issue.to_string(),
            stage: stage.to_string(),
            attempt,
            round: 0,
        }
    }

    pub fn with_round(&self, round: u32) -> Self {
        Self {
            round,
            ..self.clone()
        }
    }

    fn file_name(&self, base: &str, ext: &str) -> String {
        if self.round == 0 {
            format!("{base}.{ext}")
        } else {
            format!("{base}-fix-{}.{ext}", self.round)
        }
    }
}

pub trait PipelineStore {
    /// Persist a new pipeline. Fails with `PipelineExists` if one is present.
    fn create(&self, state: &PipelineState) -> Result<()>;

    /// Fails with `PipelineNotFound` if there is none.
    fn get(&self, issue: &str) -> Result<PipelineState>;

    /// Serialized read-modify-write. The mutator's error aborts the write.
    fn update(
        &self,
        issue: &str,
        mutator: &mut dyn FnMut(&mut PipelineState) -> Result<()>,
    ) -> Result<PipelineState>;

    fn list(&self) -> Result<Vec<PipelineState>>;

    /// Claim the right to run a stage for `issue`. `None` while another
    /// live advance holds it.
    fn lease(&self, issue: &str) -> Result<Option<Lease>>;

    /// True while a live advance holds the lease for `issue`.
    fn lease_held(&self, issue: &str) -> Result<bool>;

    fn delete(&self, issue: &str) -> Result<()>;

    fn save_prompt(&self, key: &AttemptKey, prompt: &str) -> Result<()>;

    fn save_session_log(&self, key: &AttemptKey, log: &str) -> Result<()>;

    fn save_stage_outcome(&self, key: &AttemptKey, result: &RunResult) -> Result<()>;
}

/// File-backed store rooted at the configured state directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pipelines_dir(&self) -> PathBuf {
        self.root.join("pipelines")
    }

    fn pipeline_dir(&self, issue: &str) -> Result<PathBuf> {
        validate_issue_id(issue)?;
        Ok(self.pipelines_dir().join(issue))
    }

    fn state_path(&self, issue: &str) -> Result<PathBuf> {
        Ok(self.pipeline_dir(issue)?.join("state.json"))
    }

    fn attempt_dir(&self, key: &AttemptKey) -> Result<PathBuf> {
        Ok(self
            .pipeline_dir(&key.issue)?
            .join("attempts")
            .join(format!("{}-{}", key.stage, key.attempt)))
    }

    fn write_artifact(&self, key: &AttemptKey, file: &str, contents: &str) -> Result<()> {
        let path = self.attempt_dir(key)?.join(file);
        write_atomic(&path, contents)
    }
}

impl PipelineStore for FsStore {
    #[instrument(skip_all, fields(issue = %state.issue))]
    fn create(&self, state: &PipelineState) -> Result<()> {
        let dir = self.pipeline_dir(&state.issue)?;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let _lock = LockFile::acquire(&dir.join("state.lock"), Some(STATE_LOCK_MAX_HOLD))?;
        let path = dir.join("state.json");
        if path.exists() {
            return Err(PreconditionError::PipelineExists(state.issue.clone()).into());
        }
        write_state(&path, state)?;
        debug!("pipeline state created");
        Ok(())
    }

    fn get(&self, issue: &str) -> Result<PipelineState> {
        let path = self.state_path(issue)?;
        if !path.exists() {
            return Err(PreconditionError::PipelineNotFound(issue.to_string()).into());
        }
        load_state(&path)
    }

    #[instrument(skip_all, fields(issue))]
    fn update(
        &self,
        issue: &str,
        mutator: &mut dyn FnMut(&mut PipelineState) -> Result<()>,
    ) -> Result<PipelineState> {
        let dir = self.pipeline_dir(issue)?;
        let path = dir.join("state.json");
        if !path.exists() {
            return Err(PreconditionError::PipelineNotFound(issue.to_string()).into());
        }
        let _lock = LockFile::acquire(&dir.join("state.lock"), Some(STATE_LOCK_MAX_HOLD))?;
        let mut state = load_state(&path)?;
        mutator(&mut state)?;
        state.updated_at = Utc::now();
        write_state(&path, &state)?;
        Ok(state)
    }

    fn list(&self) -> Result<Vec<PipelineState>> {
        let dir = self.pipelines_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut issues = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if entry.path().join("state.json").exists() {
                issues.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        issues.sort();
        issues.iter().map(|issue| self.get(issue)).collect()
    }

    fn lease(&self, issue: &str) -> Result<Option<Lease>> {
        let dir = self.pipeline_dir(issue)?;
        if !dir.join("state.json").exists() {
            return Err(PreconditionError::PipelineNotFound(issue.to_string()).into());
        }
        let lock = LockFile::try_acquire(&dir.join("advance.lock"), None)?;
        Ok(lock.map(|lock| Lease { _lock: lock }))
    }

    fn lease_held(&self, issue: &str) -> Result<bool> {
        let path = self.pipeline_dir(issue)?.join("advance.lock");
        Ok(path.exists() && !is_stale(&path, None))
    }

    fn delete(&self, issue: &str) -> Result<()> {
        let dir = self.pipeline_dir(issue)?;
        if !dir.exists() {
            return Err(PreconditionError::PipelineNotFound(issue.to_string()).into());
        }
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }

    fn save_prompt(&self, key: &AttemptKey, prompt: &str) -> Result<()> {
        self.write_artifact(key, &key.file_name("prompt", "md"), prompt)
    }

    fn save_session_log(&self, key: &AttemptKey, log: &str) -> Result<()> {
        self.write_artifact(key, &key.file_name("session", "log"), log)
    }

    fn save_stage_outcome(&self, key: &AttemptKey, result: &RunResult) -> Result<()> {
        self.write_artifact(key, "outcome.json", &to_json(result)?)
    }
}

/// Who holds a lock file. Written into the file on acquisition.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// A `create_new` lock file, removed on drop.
///
/// A lock whose holder process is gone, or that is older than `max_hold`,
/// is stale and gets broken by the next acquirer.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Wait up to [`LOCK_TIMEOUT`] for the lock.
    fn acquire(path: &Path, max_hold: Option<Duration>) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path, max_hold)? {
                return Ok(lock);
            }
            if started.elapsed() >= LOCK_TIMEOUT {
                return Err(anyhow!(
                    "timed out waiting for lock {} (remove it if no conductor is running)",
                    path.display()
                ));
            }
            thread::sleep(LOCK_RETRY);
        }
    }

    /// `None` while a live holder has the lock.
    fn try_acquire(path: &Path, max_hold: Option<Duration>) -> Result<Option<Self>> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                    };
                    let holder = LockHolder {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    serde_json::to_writer(file, &holder)
                        .with_context(|| format!("write lock {}", path.display()))?;
                    return Ok(Some(lock));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !is_stale(path, max_hold) {
                        return Ok(None);
                    }
                    warn!(path = %path.display(), "breaking stale lock");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove stale lock {}", path.display()));
                        }
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

fn is_stale(path: &Path, max_hold: Option<Duration>) -> bool {
    let holder = fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<LockHolder>(&text).ok());
    match holder {
        Some(holder) => {
            let held = (Utc::now() - holder.acquired_at).to_std().unwrap_or_default();
            !process_alive(holder.pid) || max_hold.is_some_and(|max| held > max)
        }
        // Empty or garbled: the holder died between create and write, or is
        // writing right now.
        None => fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > UNREADABLE_LOCK_GRACE),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs every holder counts as alive; only `max_hold` expires it.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Exclusive right to run a stage for one issue. Released on drop.
#[derive(Debug)]
pub struct Lease {
    _lock: LockFile,
}

/// Issue ids become directory names, so anything path-like is rejected.
pub fn validate_issue_id(issue: &str) -> Result<(), PreconditionError> {
    let bad = issue.trim().is_empty()
        || issue == "."
        || issue == ".."
        || issue.contains(['/', '\\'])
        || issue.chars().any(char::is_control);
    if bad {
        return Err(PreconditionError::InvalidIssueId(issue.to_string()));
    }
    Ok(())
}

fn load_state(path: &Path) -> Result<PipelineState> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate state {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize state {}", path.display()))
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = STATE_VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))?;
    if !validator.is_valid(value) {
        let messages = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn write_state(path: &Path, state: &PipelineState) -> Result<()> {
    debug!(path = %path.display(), status = %state.status, stage = %state.current_stage, "writing state");
    write_atomic(path, &to_json(state)?)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    Ok(buf)
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::types::{PipelineStatus, StageOutcome};
    use crate::error::is_precondition;

    fn state(issue: &str) -> PipelineState {
        PipelineState::new(
            issue,
            "Title",
            "conductor/1",
            PathBuf::from("/tmp/wt"),
            "implement",
            &["review"],
            Utc::now(),
        )
    }

    #[test]
    fn create_get_update_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");

        let updated = store
            .update("1", &mut |s| {
                s.status = PipelineStatus::InProgress;
                Ok(())
            })
            .expect("update");
        assert_eq!(updated.status, PipelineStatus::InProgress);
        assert_eq!(store.get("1").expect("get").status, PipelineStatus::InProgress);
        assert!(!temp.path().join("pipelines/1/state.lock").exists());
    }

    fn write_holder(path: &Path, pid: u32, acquired_at: DateTime<Utc>) {
        let holder = LockHolder { pid, acquired_at };
        fs::write(path, serde_json::to_string(&holder).expect("json")).expect("write lock");
    }

    #[test]
    fn abandoned_state_lock_is_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");
        let lock = temp.path().join("pipelines/1/state.lock");
        write_holder(&lock, std::process::id(), Utc::now() - chrono::Duration::hours(1));

        let started = Instant::now();
        store
            .update("1", &mut |s| {
                s.current_attempt = 2;
                Ok(())
            })
            .expect("update");
        assert!(started.elapsed() < LOCK_TIMEOUT);
        assert!(!lock.exists());
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");
        assert!(!store.lease_held("1").expect("held"));

        let lease = store.lease("1").expect("lease").expect("free");
        assert!(store.lease_held("1").expect("held"));
        assert!(store.lease("1").expect("lease").is_none());

        drop(lease);
        assert!(!store.lease_held("1").expect("held"));
        assert!(store.lease("1").expect("lease").is_some());
        assert!(is_precondition(&store.lease("2").unwrap_err()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lease_of_dead_process_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");
        let lock = temp.path().join("pipelines/1/advance.lock");
        write_holder(&lock, u32::MAX, Utc::now());

        assert!(!store.lease_held("1").expect("held"));
        assert!(store.lease("1").expect("lease").is_some());
    }

    #[test]
    fn duplicate_create_and_missing_get_are_preconditions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");

        let dup = store.create(&state("1")).unwrap_err();
        assert!(matches!(
            dup.downcast_ref::<PreconditionError>(),
            Some(PreconditionError::PipelineExists(_))
        ));
        assert!(is_precondition(&store.get("2").unwrap_err()));
    }

    #[test]
    fn failed_mutator_leaves_state_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");

        let err = store
            .update("1", &mut |s| {
                s.current_attempt = 9;
                Err(anyhow!("nope"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(store.get("1").expect("get").current_attempt, 1);
    }

    #[test]
    fn schema_rejects_corrupt_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("1")).expect("create");
        let path = temp.path().join("pipelines/1/state.json");
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value["status"] = Value::String("exploded".to_string());
        fs::write(&path, value.to_string()).expect("write");

        let err = store.get("1").unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn list_is_sorted_and_delete_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        store.create(&state("b")).expect("create");
        store.create(&state("a")).expect("create");

        let issues: Vec<String> = store.list().expect("list").into_iter().map(|s| s.issue).collect();
        assert_eq!(issues, vec!["a", "b"]);

        store.delete("a").expect("delete");
        assert_eq!(store.list().expect("list").len(), 1);
    }

    #[test]
    fn path_like_issue_ids_are_rejected() {
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(validate_issue_id(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_issue_id("GH-42").is_ok());
    }

    #[test]
    fn artifacts_are_addressed_by_attempt_and_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        let key = AttemptKey::new("1", "implement", 2);
        store.save_prompt(&key, "do it").expect("prompt");
        store.save_session_log(&key.with_round(3), "log").expect("log");
        store
            .save_stage_outcome(
                &key,
                &RunResult {
                    outcome: StageOutcome::Success,
                    checks: BTreeMap::new(),
                    auto_fixes: BTreeMap::new(),
                    agent_fixes: BTreeMap::new(),
                    fix_rounds: 0,
                    checks_first_pass: true,
                    agent_duration_ms: 1,
                    total_duration_ms: 2,
                    reason: None,
                },
            )
            .expect("outcome");

        let dir = temp.path().join("pipelines/1/attempts/implement-2");
        assert_eq!(fs::read_to_string(dir.join("prompt.md")).expect("read"), "do it");
        assert_eq!(fs::read_to_string(dir.join("session-fix-3.log")).expect("read"), "log");
        assert!(fs::read_to_string(dir.join("outcome.json")).expect("read").contains("\"success\""));
    }
}
