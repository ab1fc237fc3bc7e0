use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-SpecRun configuration. Created once by the client at `start` and
/// read by every subsequent session; never mutated after creation except
/// for `auto_accept`, which can be toggled between sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceInfo {
    pub spec_slug: String,
    pub spec_hash: String,
    pub feature_branch: String,
    pub target_branch: String,
    pub auto_accept: bool,
    pub mode_flags: ModeFlags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModeFlags {
    #[serde(default)]
    pub file_only_mode: bool,
    #[serde(default)]
    pub skip_mr_creation: bool,
    #[serde(default)]
    pub skip_puppeteer: bool,
    #[serde(default)]
    pub skip_test_suite: bool,
    #[serde(default)]
    pub skip_regression_testing: bool,
}

impl WorkspaceInfo {
    /// Validate the required-field contract from the store's schema check.
    /// Missing required fields are never silently defaulted.
    pub fn validate(&self) -> Result<(), String> {
        if self.spec_slug.trim().is_empty() {
            return Err("spec_slug must not be empty".into());
        }
        if self.spec_hash.trim().is_empty() {
            return Err("spec_hash must not be empty".into());
        }
        if self.feature_branch.trim().is_empty() {
            return Err("feature_branch must not be empty".into());
        }
        if self.target_branch.trim().is_empty() {
            return Err("target_branch must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub iid: u64,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub enrichment: Option<IssueEnrichment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueEnrichment {
    pub decision: EnrichmentDecision,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub recommended_research_types: Vec<String>,
    pub estimated_complexity: String,
    #[serde(default)]
    pub preliminary_research: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentDecision {
    NeedsEnrichment,
    Sufficient,
}

/// Per-session record of files the current agent subprocess has modified.
/// Reset at the start of every session (I5). The push-discipline invariant
/// (I4) is enforced against `tracked` by the integration layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionFiles {
    pub tracked: Vec<String>,
    pub session_started: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SessionFiles {
    pub fn reset(now: DateTime<Utc>) -> Self {
        SessionFiles {
            tracked: Vec::new(),
            session_started: Some(now),
            last_updated: Some(now),
        }
    }

    pub fn record(&mut self, path: impl Into<String>, now: DateTime<Utc>) {
        let path = path.into();
        if !self.tracked.contains(&path) {
            self.tracked.push(path);
        }
        self.last_updated = Some(now);
    }

    pub fn owns(&self, path: &str) -> bool {
        self.tracked.iter().any(|p| p == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    #[serde(default)]
    pub external_project_id: Option<String>,
    #[serde(default)]
    pub external_milestone_id: Option<String>,
    pub title: String,
    pub issues: Vec<Issue>,
    pub all_issues_closed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_request_iid: Option<u64>,
    #[serde(default)]
    pub merge_request_url: Option<String>,
    #[serde(default)]
    pub session_files: SessionFiles,
}

impl Milestone {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("milestone title must not be empty".into());
        }
        Ok(())
    }

    pub fn recompute_all_closed(&mut self) {
        self.all_issues_closed = !self.issues.is_empty()
            && self
                .issues
                .iter()
                .all(|i| i.status == IssueStatus::Closed);
    }

    pub fn issue_mut(&mut self, iid: u64) -> Option<&mut Issue> {
        self.issues.iter_mut().find(|i| i.iid == iid)
    }
}

/// Phases of the session orchestrator's state machine (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializer,
    Coding,
    Mr,
    Done,
}

/// The full catalogue of checkpoint kinds (§4.2). Each kind owns its own
/// context/modifications shape and continuation semantics; the handler
/// registry in `orchestrator` is keyed exhaustively on this enum so a new
/// kind cannot be half-wired in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ProjectVerification,
    SpecToIssues,
    IssueEnrichment,
    IssueSelection,
    IssueClosure,
    RegressionApproval,
    MrPhaseTransition,
    MrReview,
}

/// Either the global scope or a specific issue's scope. Serialized as the
/// literal string `"global"` or the iid's decimal string, matching the
/// CheckpointLog's key representation (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    Issue(u64),
}

impl Scope {
    pub fn as_key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Issue(iid) => iid.to_string(),
        }
    }

    pub fn from_key(key: &str) -> Self {
        if key == "global" {
            Scope::Global
        } else {
            key.parse::<u64>().map(Scope::Issue).unwrap_or(Scope::Global)
        }
    }
}

impl Serialize for Scope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_key())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Scope::from_key(&s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Modified,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Modified,
    Rejected,
}

impl From<Verdict> for CheckpointStatus {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Approved => CheckpointStatus::Approved,
            Verdict::Modified => CheckpointStatus::Modified,
            Verdict::Rejected => CheckpointStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub kind: CheckpointKind,
    pub scope: Scope,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub modifications: Option<serde_json::Value>,
    #[serde(default)]
    pub human_notes: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_pending_open(&self) -> bool {
        self.status == CheckpointStatus::Pending && !self.completed
    }
}

/// A mapping from scope key to an ordered, append-only list of Checkpoints.
/// The single source of truth for gate state (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointLog {
    #[serde(default)]
    pub by_scope: BTreeMap<String, Vec<Checkpoint>>,
}

impl CheckpointLog {
    pub fn entries_for(&self, scope: Scope) -> &[Checkpoint] {
        self.by_scope
            .get(&scope.as_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entries_for_mut(&mut self, scope: Scope) -> &mut Vec<Checkpoint> {
        self.by_scope.entry(scope.as_key()).or_default()
    }

    pub fn all(&self) -> impl Iterator<Item = &Checkpoint> {
        self.by_scope.values().flatten()
    }

    pub fn find_mut(&mut self, checkpoint_id: &str) -> Option<&mut Checkpoint> {
        self.by_scope
            .values_mut()
            .flatten()
            .find(|c| c.checkpoint_id == checkpoint_id)
    }

    pub fn find(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.by_scope
            .values()
            .flatten()
            .find(|c| c.checkpoint_id == checkpoint_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    WaitingCheckpoint,
    Stopped,
    Failed,
}

/// Daemon-owned record of a single running or finished agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub agent_id: u64,
    pub spec_slug: String,
    pub project_dir: std::path::PathBuf,
    pub feature_branch: String,
    pub target_branch: String,
    pub auto_accept: bool,
    pub mode_flags: ModeFlags,
    pub log_path: std::path::PathBuf,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub phase: Phase,
    pub last_event_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Client-supplied configuration for a new agent, sent over the socket
/// with the `start` command. The core never hardcodes the concrete AI CLI
/// binary; it is supplied here (or defaulted from the environment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub project_dir: std::path::PathBuf,
    pub spec_path: std::path::PathBuf,
    pub spec_slug: String,
    pub target_branch: String,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default)]
    pub mode_flags: ModeFlags,
    /// Command used to spawn the AI subprocess, e.g. `["claude", "--print"]`.
    /// Defaults to `HARNESS_AGENT_COMMAND` env var split on whitespace, or
    /// `claude --print` if unset.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// A single structured line appended to a session log (§3a).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub agent_id: u64,
    pub session_seq: u64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_roundtrip() {
        assert_eq!(Scope::Global.as_key(), "global");
        assert_eq!(Scope::from_key("global"), Scope::Global);
        assert_eq!(Scope::Issue(7).as_key(), "7");
        assert_eq!(Scope::from_key("7"), Scope::Issue(7));
    }

    #[test]
    fn session_files_record_is_idempotent() {
        let now = Utc::now();
        let mut sf = SessionFiles::reset(now);
        sf.record("a.rs", now);
        sf.record("a.rs", now);
        assert_eq!(sf.tracked, vec!["a.rs".to_string()]);
        assert!(sf.owns("a.rs"));
        assert!(!sf.owns("b.rs"));
    }

    #[test]
    fn milestone_all_closed_requires_nonempty() {
        let mut m = Milestone {
            external_project_id: None,
            external_milestone_id: None,
            title: "M1".into(),
            issues: vec![],
            all_issues_closed: false,
            completed_at: None,
            merge_request_iid: None,
            merge_request_url: None,
            session_files: SessionFiles::default(),
        };
        m.recompute_all_closed();
        assert!(!m.all_issues_closed);

        m.issues.push(Issue {
            iid: 1,
            title: "t".into(),
            description: "d".into(),
            status: IssueStatus::Closed,
            labels: vec![],
            enrichment: None,
        });
        m.recompute_all_closed();
        assert!(m.all_issues_closed);
    }

    #[test]
    fn workspace_info_rejects_empty_fields() {
        let wi = WorkspaceInfo {
            spec_slug: "".into(),
            spec_hash: "abc".into(),
            feature_branch: "f".into(),
            target_branch: "main".into(),
            auto_accept: false,
            mode_flags: ModeFlags::default(),
        };
        assert!(wi.validate().is_err());
    }
}
