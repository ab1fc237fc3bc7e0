//! The daemon's own durable state: the set of `AgentRecord`s, persisted
//! as a single JSON file so a restart reloads the same agents a client
//! was talking to before (P6). Grounded on the same atomic-write
//! discipline as the per-run workspace store, but scoped to the daemon's
//! own data directory rather than any one project.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{AgentRecord, AgentStatus};
use crate::store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    next_agent_id: u64,
    agents: BTreeMap<u64, AgentRecord>,
}

pub struct Registry {
    path: PathBuf,
    state: RwLock<RegistrySnapshot>,
}

impl Registry {
    /// Load (or initialize) the registry at `path`. Any agent whose `pid`
    /// is not a live process is reconciled to a terminal status (P6) —
    /// the daemon that owned it died without updating the record.
    pub fn load(path: PathBuf) -> Result<Self> {
        let mut snapshot = if path.exists() {
            store::read_json::<RegistrySnapshot>(&path)?
        } else {
            RegistrySnapshot::default()
        };
        for record in snapshot.agents.values_mut() {
            if let Some(pid) = record.pid {
                if !pid_is_alive(pid) && record.status == AgentStatus::Running {
                    record.status = AgentStatus::Stopped;
                    record.pid = None;
                    record.last_event_at = Utc::now();
                }
            }
        }
        if !snapshot.agents.is_empty() || path.exists() {
            store::write_json(&path, &snapshot)?;
        }
        Ok(Registry {
            path,
            state: RwLock::new(snapshot),
        })
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        self.state.read().await.agents.values().cloned().collect()
    }

    pub async fn get(&self, agent_id: u64) -> Option<AgentRecord> {
        self.state.read().await.agents.get(&agent_id).cloned()
    }

    pub async fn insert(&self, mut record: AgentRecord) -> Result<AgentRecord> {
        let mut state = self.state.write().await;
        let id = state.next_agent_id.max(record.agent_id + 1);
        state.next_agent_id = id;
        record.agent_id = record.agent_id.max(1);
        state.agents.insert(record.agent_id, record.clone());
        store::write_json(&self.path, &*state)?;
        Ok(record)
    }

    /// Allocate the next agent id without inserting a record yet.
    pub async fn next_id(&self) -> u64 {
        let mut state = self.state.write().await;
        state.next_agent_id += 1;
        state.next_agent_id
    }

    pub async fn update<F>(&self, agent_id: u64, mutator: F) -> Result<Option<AgentRecord>>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let mut state = self.state.write().await;
        let Some(record) = state.agents.get_mut(&agent_id) else {
            return Ok(None);
        };
        mutator(record);
        record.last_event_at = Utc::now();
        let updated = record.clone();
        store::write_json(&self.path, &*state)?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, agent_id: u64) -> Result<Option<AgentRecord>> {
        let mut state = self.state.write().await;
        let removed = state.agents.remove(&agent_id);
        if removed.is_some() {
            store::write_json(&self.path, &*state)?;
        }
        Ok(removed)
    }
}

fn pid_is_alive(pid: u32) -> bool {
    // `kill(pid, 0)` only tests existence/permission; it sends no signal.
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs no action beyond an existence check.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModeFlags, Phase};

    fn sample_record(agent_id: u64, pid: Option<u32>, status: AgentStatus) -> AgentRecord {
        AgentRecord {
            agent_id,
            spec_slug: "demo".into(),
            project_dir: PathBuf::from("/tmp/demo"),
            feature_branch: "agent/demo".into(),
            target_branch: "main".into(),
            auto_accept: false,
            mode_flags: ModeFlags::default(),
            log_path: PathBuf::from("/tmp/demo/log"),
            pid,
            status,
            phase: Phase::Initializer,
            last_event_at: Utc::now(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn insert_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::load(path).unwrap();
        registry
            .insert(sample_record(1, Some(std::process::id()), AgentStatus::Running))
            .await
            .unwrap();
        let agents = registry.list().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, 1);
    }

    #[tokio::test]
    async fn restart_reconciles_dead_pid_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = Registry::load(path.clone()).unwrap();
            // A pid vanishingly unlikely to be alive in the test sandbox.
            registry
                .insert(sample_record(1, Some(999_999), AgentStatus::Running))
                .await
                .unwrap();
        }
        let reloaded = Registry::load(path).unwrap();
        let record = reloaded.get(1).await.unwrap();
        assert_eq!(record.status, AgentStatus::Stopped);
        assert!(record.pid.is_none());
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::load(path.clone()).unwrap();
        registry
            .insert(sample_record(1, None, AgentStatus::Idle))
            .await
            .unwrap();
        registry
            .update(1, |r| r.status = AgentStatus::Running)
            .await
            .unwrap();

        let reloaded = Registry::load(path).unwrap();
        assert_eq!(reloaded.get(1).await.unwrap().status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn remove_running_agent_caller_must_stop_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::load(path).unwrap();
        registry
            .insert(sample_record(1, None, AgentStatus::Stopped))
            .await
            .unwrap();
        let removed = registry.remove(1).await.unwrap();
        assert!(removed.is_some());
        assert!(registry.get(1).await.is_none());
    }
}
