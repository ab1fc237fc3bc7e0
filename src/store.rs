use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{HarnessError, Result};
use crate::model::{Milestone, WorkspaceInfo};

/// Layout of a single SpecRun's durable state under a project root (§4.1).
pub struct Workspace {
    project_dir: PathBuf,
    root: PathBuf,
}

const WORKSPACE_INFO: &str = "workspace_info";
const MILESTONE: &str = "milestone";
const CHECKPOINT_LOG: &str = "checkpoint_log";
const APP_SPEC: &str = "app_spec";

impl Workspace {
    /// `P/.claude-agent/<spec_slug>-<spec_hash>/`
    pub fn new(project_dir: &Path, spec_slug: &str, spec_hash: &str) -> Self {
        let root = project_dir
            .join(".claude-agent")
            .join(format!("{spec_slug}-{spec_hash}"));
        Workspace {
            project_dir: project_dir.to_path_buf(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The project directory this workspace was created under, i.e. the
    /// directory quality checks and subprocesses run in.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn read_workspace_info(&self) -> Result<WorkspaceInfo> {
        let info: WorkspaceInfo = read_json(&self.path(WORKSPACE_INFO))?;
        info.validate()
            .map_err(|reason| HarnessError::schema(self.path(WORKSPACE_INFO), reason))?;
        Ok(info)
    }

    pub fn write_workspace_info(&self, info: &WorkspaceInfo) -> Result<()> {
        info.validate()
            .map_err(|reason| HarnessError::schema(self.path(WORKSPACE_INFO), reason))?;
        write_json(&self.path(WORKSPACE_INFO), info)
    }

    pub fn read_milestone(&self) -> Result<Milestone> {
        let m: Milestone = read_json(&self.path(MILESTONE))?;
        m.validate()
            .map_err(|reason| HarnessError::schema(self.path(MILESTONE), reason))?;
        Ok(m)
    }

    pub fn write_milestone(&self, milestone: &Milestone) -> Result<()> {
        milestone
            .validate()
            .map_err(|reason| HarnessError::schema(self.path(MILESTONE), reason))?;
        write_json(&self.path(MILESTONE), milestone)
    }

    pub fn read_checkpoint_log(&self) -> Result<crate::model::CheckpointLog> {
        let path = self.path(CHECKPOINT_LOG);
        if !path.exists() {
            return Ok(crate::model::CheckpointLog::default());
        }
        read_json(&path)
    }

    pub fn write_checkpoint_log(&self, log: &crate::model::CheckpointLog) -> Result<()> {
        write_json(&self.path(CHECKPOINT_LOG), log)
    }

    pub fn write_app_spec(&self, contents: &str) -> Result<()> {
        atomic_write(&self.path(APP_SPEC), contents.as_bytes())
    }

    /// Append one line to `logs/<agent_id>-<ts>.log`, timestamping it.
    /// Unlike the JSON state files this is not rewritten atomically: logs
    /// are append-only and a partial trailing line is an acceptable cost,
    /// readers tail them for humans rather than parsing them as one value.
    pub fn append_log(&self, agent_id: u64, session_started_ts: &str, message: &str) -> Result<()> {
        use std::io::Write;
        fs::create_dir_all(self.logs_dir())?;
        let log_path = self
            .logs_dir()
            .join(format!("{agent_id}-{session_started_ts}.log"));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn log_path(&self, agent_id: u64, session_started_ts: &str) -> PathBuf {
        self.logs_dir().join(format!("{agent_id}-{session_started_ts}.log"))
    }
}

/// Read a JSON file and deserialize it, mapping I/O-not-found into
/// `HarnessError::NotFound` and malformed content into `HarnessError::Json`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HarnessError::not_found(path.display().to_string())
        } else {
            HarnessError::Io(e)
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|source| HarnessError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a value to `path` atomically: serialize to a sibling temp file,
/// fsync it, then rename over the destination. Readers never observe a
/// half-written file (I6).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| HarnessError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &bytes)
}

static TMP_WRITE_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Write raw bytes to `path` atomically (write-temp, fsync, rename). The
/// shared atomic-write primitive that every C1 writer routes through, per
/// the I6 requirement that no caller build its own ad hoc write path.
///
/// The temp filename carries a per-call counter in addition to the pid:
/// two writers in the same process hitting the same path (a client's
/// `resolve` racing a supervisor's `complete` on one `checkpoint_log`)
/// must not collide on the same temp name.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let nonce = TMP_WRITE_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let tmp_path = path.with_extension(format!("tmp.{}.{nonce}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        use std::io::Write;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
