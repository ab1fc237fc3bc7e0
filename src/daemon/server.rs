//! The daemon's socket server and per-agent supervision (C4). Adapted
//! from the accept-loop-spawns-handler pattern of a reference JSON-RPC
//! service, but framed per §6 (length-prefixed, not newline-delimited)
//! and simplified to the flat `{ok, value|error}` response shape instead
//! of numeric JSON-RPC error codes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::daemon::protocol::{read_frame, write_frame, Request, Response, StreamEvent};
use crate::daemon::registry::Registry;
use crate::error::{HarnessError, Result};
use crate::integrations::LocalGitHost;
use crate::model::{AgentRecord, AgentStatus, ModeFlags, Phase};
use crate::orchestrator::{self, SessionOutcome};
use crate::store::Workspace;

pub struct Daemon {
    registry: Arc<Registry>,
    events: broadcast::Sender<StreamEvent>,
}

impl Daemon {
    pub fn new(registry: Registry) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Daemon {
            registry: Arc::new(registry),
            events: tx,
        }
    }

    /// Bind `socket_path`, reclaiming it if a previous daemon died
    /// without cleaning up, and serve connections until the process is
    /// killed.
    pub async fn serve(self: Arc<Self>, socket_path: &Path) -> Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        tracing::info!(path = %socket_path.display(), "daemon listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = daemon.handle_connection(stream).await {
                    tracing::warn!(error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let request: Request = match read_frame(&mut stream).await? {
                Some(r) => r,
                None => return Ok(()),
            };
            if let Request::Subscribe { agent_id } = request {
                return self.stream_events(stream, agent_id).await;
            }
            let response = self.dispatch(request).await;
            write_frame(&mut stream, &response).await?;
        }
    }

    async fn stream_events(&self, mut stream: UnixStream, agent_id: Option<u64>) -> Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let matches = match (&event, agent_id) {
                        (StreamEvent::StatusChanged { agent }, Some(id)) => agent.agent_id == id,
                        (StreamEvent::LogLine { agent_id: eid, .. }, Some(id)) => *eid == id,
                        _ => true,
                    };
                    if matches && write_frame(&mut stream, &event).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::List => Response::ok(&self.registry.list().await),
            Request::Start(config) => match self.start_agent(config).await {
                Ok(record) => Response::ok(&record),
                Err(e) => e.into(),
            },
            Request::Stop { agent_id } => match self.stop_agent(agent_id).await {
                Ok(Some(record)) => Response::ok(&record),
                Ok(None) => Response::err(format!("no such agent {agent_id}")),
                Err(e) => e.into(),
            },
            Request::Status { agent_id } => match self.registry.get(agent_id).await {
                Some(record) => Response::ok(&record),
                None => Response::err(format!("no such agent {agent_id}")),
            },
            Request::Remove { agent_id } => match self.remove_agent(agent_id).await {
                Ok(record) => Response::ok(&record),
                Err(e) => e.into(),
            },
            Request::Subscribe { .. } => {
                Response::err("subscribe must be the only request on a connection")
            }
            Request::ResolveCheckpoint {
                agent_id,
                checkpoint_id,
                verdict,
                modifications,
                human_notes,
            } => match self
                .resolve_checkpoint(agent_id, &checkpoint_id, verdict, modifications, human_notes)
                .await
            {
                Ok(()) => Response::ok(&true),
                Err(e) => e.into(),
            },
        }
    }

    async fn start_agent(&self, config: crate::model::AgentConfig) -> Result<AgentRecord> {
        // Refuse a conflicting (project_dir, spec_slug) with a running agent (§5).
        for existing in self.registry.list().await {
            if existing.project_dir == config.project_dir
                && existing.spec_slug == config.spec_slug
                && existing.status == AgentStatus::Running
            {
                return Err(HarnessError::invariant(format!(
                    "an agent is already running for {} in {}",
                    config.spec_slug,
                    config.project_dir.display()
                )));
            }
        }
        guard_project_root(&config.project_dir, &config.project_dir)?;

        let agent_id = self.registry.next_id().await;
        let spec_hash = short_hash(&format!("{}{}", config.spec_slug, agent_id));
        let workspace = Workspace::new(&config.project_dir, &config.spec_slug, &spec_hash);
        workspace.ensure_dirs()?;

        let spec_contents = std::fs::read_to_string(&config.spec_path)?;
        workspace.write_app_spec(&spec_contents)?;

        let feature_branch = format!("agent/{}-{}", config.spec_slug, spec_hash);
        let info = crate::model::WorkspaceInfo {
            spec_slug: config.spec_slug.clone(),
            spec_hash: spec_hash.clone(),
            feature_branch: feature_branch.clone(),
            target_branch: config.target_branch.clone(),
            auto_accept: config.auto_accept,
            mode_flags: config.mode_flags.clone(),
        };
        workspace.write_workspace_info(&info)?;

        let record = AgentRecord {
            agent_id,
            spec_slug: config.spec_slug.clone(),
            project_dir: config.project_dir.clone(),
            feature_branch,
            target_branch: config.target_branch.clone(),
            auto_accept: config.auto_accept,
            mode_flags: config.mode_flags.clone(),
            log_path: workspace.logs_dir(),
            pid: Some(std::process::id()),
            status: AgentStatus::Running,
            phase: Phase::Initializer,
            last_event_at: Utc::now(),
            last_error: None,
        };
        let record = self.registry.insert(record).await?;
        let _ = self.events.send(StreamEvent::StatusChanged { agent: record.clone() });

        self.spawn_supervisor(agent_id, config, workspace);
        Ok(record)
    }

    /// One task per running agent (§4.4 "Supervision"): drives sessions
    /// until the SpecRun reaches `done`, fails, or is stopped, updating
    /// the registry (and broadcasting) after every session.
    fn spawn_supervisor(&self, agent_id: u64, config: crate::model::AgentConfig, workspace: Workspace) {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        tokio::spawn(async move {
            let host = LocalGitHost {
                repo_dir: config.project_dir.clone(),
            };
            let mut phase = Phase::Initializer;
            loop {
                let outcome = orchestrator::run_session(agent_id, &workspace, &config, phase, &host).await;
                let (status, next_phase, error) = match outcome {
                    Ok(SessionOutcome::WaitingCheckpoint) => (AgentStatus::WaitingCheckpoint, phase, None),
                    Ok(SessionOutcome::Advanced { next_phase }) => (AgentStatus::Running, next_phase, None),
                    Ok(SessionOutcome::Done) => (AgentStatus::Idle, Phase::Done, None),
                    Ok(SessionOutcome::Stopped) => (AgentStatus::Stopped, phase, None),
                    Ok(SessionOutcome::Failed { reason }) => (AgentStatus::Failed, phase, Some(reason)),
                    Err(e) => (AgentStatus::Failed, phase, Some(e.to_string())),
                };
                let updated = registry
                    .update(agent_id, |r| {
                        r.status = status;
                        r.phase = next_phase;
                        r.last_error = error.clone();
                        if matches!(status, AgentStatus::Stopped | AgentStatus::Failed | AgentStatus::Idle) {
                            r.pid = None;
                        }
                    })
                    .await
                    .ok()
                    .flatten();
                if let Some(record) = updated {
                    let _ = events.send(StreamEvent::StatusChanged { agent: record });
                }
                phase = next_phase;
                if matches!(status, AgentStatus::WaitingCheckpoint | AgentStatus::Stopped | AgentStatus::Failed)
                    || next_phase == Phase::Done
                {
                    break;
                }
            }
        });
    }

    async fn stop_agent(&self, agent_id: u64) -> Result<Option<AgentRecord>> {
        if let Some(record) = self.registry.get(agent_id).await {
            let spec_hash = short_hash(&format!("{}{}", record.spec_slug, agent_id));
            let workspace = Workspace::new(&record.project_dir, &record.spec_slug, &spec_hash);
            orchestrator::request_stop(workspace.root())?;
        }
        self.registry
            .update(agent_id, |r| {
                r.status = AgentStatus::Stopped;
                r.pid = None;
            })
            .await
    }

    async fn remove_agent(&self, agent_id: u64) -> Result<AgentRecord> {
        let Some(record) = self.registry.get(agent_id).await else {
            return Err(HarnessError::not_found(format!("agent {agent_id}")));
        };
        if record.status == AgentStatus::Running {
            return Err(HarnessError::invariant("cannot remove a running agent"));
        }
        self.registry
            .remove(agent_id)
            .await?
            .ok_or_else(|| HarnessError::not_found(format!("agent {agent_id}")))
    }

    async fn resolve_checkpoint(
        &self,
        agent_id: u64,
        checkpoint_id: &str,
        verdict: crate::model::Verdict,
        modifications: Option<serde_json::Value>,
        human_notes: Option<String>,
    ) -> Result<()> {
        let record = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| HarnessError::not_found(format!("agent {agent_id}")))?;
        let workspace = Workspace::new(
            &record.project_dir,
            &record.spec_slug,
            &short_hash(&format!("{}{}", record.spec_slug, agent_id)),
        );
        crate::checkpoint::Checkpoints::new(&workspace).resolve(checkpoint_id, verdict, modifications, human_notes)
    }
}

/// Refuse paths that escape `root` via `..` traversal (§4.4 "Security").
fn guard_project_root(root: &Path, candidate: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| HarnessError::invariant(format!("project dir {}: {e}", root.display())))?;
    let canonical_candidate = candidate.canonicalize().unwrap_or_else(|_| candidate.to_path_buf());
    if !canonical_candidate.starts_with(&canonical_root) {
        return Err(HarnessError::invariant(format!(
            "{} escapes project root {}",
            candidate.display(),
            root.display()
        )));
    }
    Ok(())
}

fn short_hash(seed: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    format!("{:x}", hasher.finish())[..8].to_string()
}

pub fn default_socket_path() -> PathBuf {
    std::env::var_os("HARNESS_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("harness"))
        .join("daemon.sock")
}

pub fn default_registry_path() -> PathBuf {
    std::env::var_os("HARNESS_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("harness"))
        .join("registry.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_project_root_accepts_self() {
        let dir = tempfile::tempdir().unwrap();
        guard_project_root(dir.path(), dir.path()).unwrap();
    }

    #[test]
    fn guard_project_root_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().parent().unwrap();
        assert!(guard_project_root(dir.path(), outside).is_err());
    }

    #[test]
    fn short_hash_is_stable_and_eight_chars() {
        let a = short_hash("demo1");
        let b = short_hash("demo1");
        let c = short_hash("demo2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn start_refuses_duplicate_running_agent() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(runtime_dir.path().join("registry.json")).unwrap();
        let daemon = Daemon::new(registry);

        let project_dir = tempfile::tempdir().unwrap();
        std::fs::write(project_dir.path().join("spec.md"), "# Demo spec\n").unwrap();
        let config = crate::model::AgentConfig {
            project_dir: project_dir.path().to_path_buf(),
            spec_path: project_dir.path().join("spec.md"),
            spec_slug: "demo".into(),
            target_branch: "main".into(),
            auto_accept: true,
            mode_flags: ModeFlags::default(),
            command: Some(vec!["true".into()]),
        };
        daemon.start_agent(config.clone()).await.unwrap();
        let err = daemon.start_agent(config).await.unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[tokio::test]
    async fn remove_running_agent_is_refused() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(runtime_dir.path().join("registry.json")).unwrap();
        let daemon = Daemon::new(registry);
        let project_dir = tempfile::tempdir().unwrap();
        std::fs::write(project_dir.path().join("spec.md"), "# Demo spec\n").unwrap();
        let config = crate::model::AgentConfig {
            project_dir: project_dir.path().to_path_buf(),
            spec_path: project_dir.path().join("spec.md"),
            spec_slug: "demo".into(),
            target_branch: "main".into(),
            auto_accept: true,
            mode_flags: ModeFlags::default(),
            command: Some(vec!["true".into()]),
        };
        let record = daemon.start_agent(config).await.unwrap();
        let err = daemon.remove_agent(record.agent_id).await.unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[tokio::test]
    async fn start_agent_copies_spec_contents_into_workspace() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(runtime_dir.path().join("registry.json")).unwrap();
        let daemon = Daemon::new(registry);
        let project_dir = tempfile::tempdir().unwrap();
        std::fs::write(project_dir.path().join("spec.md"), "# Demo spec\n\nBuild a thing.\n").unwrap();
        let config = crate::model::AgentConfig {
            project_dir: project_dir.path().to_path_buf(),
            spec_path: project_dir.path().join("spec.md"),
            spec_slug: "demo".into(),
            target_branch: "main".into(),
            auto_accept: true,
            mode_flags: ModeFlags::default(),
            command: Some(vec!["true".into()]),
        };
        let record = daemon.start_agent(config).await.unwrap();
        let spec_hash = short_hash(&format!("demo{}", record.agent_id));
        let workspace = Workspace::new(project_dir.path(), "demo", &spec_hash);
        let stored = std::fs::read_to_string(workspace.root().join("app_spec")).unwrap();
        assert_eq!(stored, "# Demo spec\n\nBuild a thing.\n");
    }
}
