use chrono::Utc;
use serde_json::Value;

use crate::error::{HarnessError, Result};
use crate::model::{Checkpoint, CheckpointKind, CheckpointLog, CheckpointStatus, Scope, Verdict};
use crate::store::Workspace;

/// The checkpoint engine: the only way a session can seek human judgment,
/// and a hard synchronization barrier (§4.2). All operations load the log
/// fresh from the store and write it back atomically, so there is no
/// in-memory state shared across calls — callers re-open a `Checkpoints`
/// per operation (or per session), matching I5's freshness discipline.
pub struct Checkpoints<'a> {
    workspace: &'a Workspace,
}

/// A monotonic-ish opaque id: current time plus a short counter-derived
/// suffix. No heavyweight id-generation dependency is pulled in for this;
/// the crate's dependency stack has no use for one elsewhere.
fn generate_id(kind: CheckpointKind, scope: Scope) -> String {
    let now = Utc::now();
    format!(
        "ckpt-{:?}-{}-{}",
        kind,
        scope.as_key(),
        now.timestamp_nanos_opt().unwrap_or_default()
    )
    .to_lowercase()
}

impl<'a> Checkpoints<'a> {
    pub fn new(workspace: &'a Workspace) -> Self {
        Checkpoints { workspace }
    }

    /// Append a new pending Checkpoint under `scope`. Fails under I1 if a
    /// pending, un-completed Checkpoint already exists in that scope, and
    /// under the "verification loops required within a session" gate if
    /// `kind` is terminal (`issue_closure`/`mr_review`) and quality checks
    /// have not passed.
    pub fn create(&self, kind: CheckpointKind, scope: Scope, context: Value) -> Result<String> {
        if matches!(kind, CheckpointKind::IssueClosure | CheckpointKind::MrReview) {
            let info = self.workspace.read_workspace_info()?;
            let passed = crate::orchestrator::gate_terminal_checkpoint(
                self.workspace.project_dir(),
                &info.mode_flags,
            )?;
            if !passed {
                return Err(HarnessError::invariant(format!(
                    "cannot create {:?} checkpoint: quality checks have not passed",
                    kind
                )));
            }
        }
        let mut log = self.workspace.read_checkpoint_log()?;
        let entries = log.entries_for_mut(scope);
        if entries.iter().any(|c| c.is_pending_open()) {
            return Err(HarnessError::invariant(format!(
                "scope {:?} already has a pending checkpoint (I1)",
                scope
            )));
        }
        let checkpoint_id = generate_id(kind, scope);
        entries.push(Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            kind,
            scope,
            context,
            created_at: Utc::now(),
            status: CheckpointStatus::Pending,
            modifications: None,
            human_notes: None,
            completed: false,
            completed_at: None,
        });
        self.workspace.write_checkpoint_log(&log)?;
        Ok(checkpoint_id)
    }

    /// Return the newest pending, un-completed Checkpoint, optionally
    /// restricted to a scope. Under auto-accept this resolves it to the
    /// kind's auto-verdict before returning (§4.2 "Auto-accept mode"),
    /// persisting the resolution so completion follows the normal path.
    pub fn load_pending(&self, scope: Option<Scope>, auto_accept: bool) -> Result<Option<Checkpoint>> {
        let mut log = self.workspace.read_checkpoint_log()?;
        let candidate_key = {
            let iter: Box<dyn Iterator<Item = &Checkpoint>> = match scope {
                Some(s) => Box::new(log.entries_for(s).iter()),
                None => Box::new(log.all()),
            };
            iter.filter(|c| c.is_pending_open())
                .max_by_key(|c| c.created_at)
                .map(|c| c.checkpoint_id.clone())
        };
        let Some(id) = candidate_key else {
            return Ok(None);
        };
        if auto_accept {
            let (verdict, modifications) = auto_verdict_for(log.find(&id).expect("just located"));
            self.resolve_in(&mut log, &id, verdict, modifications, None)?;
            self.workspace.write_checkpoint_log(&log)?;
        }
        Ok(log.find(&id).cloned())
    }

    /// Return the most recent Checkpoint matching `kind`, regardless of
    /// status.
    pub fn latest_of_kind(&self, kind: CheckpointKind) -> Result<Option<Checkpoint>> {
        let log = self.workspace.read_checkpoint_log()?;
        Ok(log
            .all()
            .filter(|c| c.kind == kind)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    /// Mutate a pending Checkpoint's status/modifications/notes. Enforces
    /// I2 (no transition except `pending -> {approved,modified,rejected}`)
    /// and the optimistic-concurrency check: a second resolver racing the
    /// first observes the now-non-pending status and fails.
    pub fn resolve(
        &self,
        checkpoint_id: &str,
        verdict: Verdict,
        modifications: Option<Value>,
        human_notes: Option<String>,
    ) -> Result<()> {
        let mut log = self.workspace.read_checkpoint_log()?;
        self.resolve_in(&mut log, checkpoint_id, verdict, modifications, human_notes)?;
        self.workspace.write_checkpoint_log(&log)
    }

    fn resolve_in(
        &self,
        log: &mut CheckpointLog,
        checkpoint_id: &str,
        verdict: Verdict,
        modifications: Option<Value>,
        human_notes: Option<String>,
    ) -> Result<()> {
        if modifications.is_some() && verdict != Verdict::Modified {
            return Err(HarnessError::invariant(
                "modifications may only be set when verdict is `modified`",
            ));
        }
        let checkpoint = log
            .find_mut(checkpoint_id)
            .ok_or_else(|| HarnessError::not_found(format!("checkpoint {checkpoint_id}")))?;
        if checkpoint.status != CheckpointStatus::Pending {
            return Err(HarnessError::invariant(format!(
                "checkpoint {checkpoint_id} is not pending (current status {:?}); concurrent resolution?",
                checkpoint.status
            )));
        }
        checkpoint.status = verdict.into();
        checkpoint.modifications = modifications;
        checkpoint.human_notes = human_notes;
        Ok(())
    }

    /// Mark a resolved Checkpoint `completed`, meaning the agent has
    /// carried out the verdict's consequences (I3). May only be called
    /// once the status has left `pending`.
    pub fn complete(&self, checkpoint_id: &str) -> Result<()> {
        let mut log = self.workspace.read_checkpoint_log()?;
        let checkpoint = log
            .find_mut(checkpoint_id)
            .ok_or_else(|| HarnessError::not_found(format!("checkpoint {checkpoint_id}")))?;
        if checkpoint.status == CheckpointStatus::Pending {
            return Err(HarnessError::invariant(format!(
                "checkpoint {checkpoint_id} cannot be completed while still pending"
            )));
        }
        if checkpoint.completed {
            return Err(HarnessError::invariant(format!(
                "checkpoint {checkpoint_id} is already completed"
            )));
        }
        checkpoint.completed = true;
        checkpoint.completed_at = Some(Utc::now());
        self.workspace.write_checkpoint_log(&log)
    }
}

/// The default verdict applied to a pending Checkpoint of any `kind` when
/// `auto_accept` is set: plain approval, with no `modifications` attached
/// (§4.2 — every kind's auto-accept default is `approved`, including
/// `issue_enrichment`/`issue_selection`/`regression_approval`, whose
/// recommended order or default decision is read directly from `context`
/// by the continuation step rather than stashed into `modifications` here,
/// since `resolve_in` only allows `modifications` alongside `modified`).
fn auto_verdict_for(_checkpoint: &Checkpoint) -> (Verdict, Option<Value>) {
    (Verdict::Approved, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModeFlags, WorkspaceInfo};
    use crate::store::Workspace;

    fn workspace(dir: &std::path::Path) -> Workspace {
        let ws = Workspace::new(dir, "demo", "abcd12");
        ws.ensure_dirs().unwrap();
        ws.write_workspace_info(&WorkspaceInfo {
            spec_slug: "demo".into(),
            spec_hash: "abcd12".into(),
            feature_branch: "agent/demo".into(),
            target_branch: "main".into(),
            auto_accept: false,
            mode_flags: ModeFlags::default(),
        })
        .unwrap();
        ws
    }

    #[test]
    fn create_then_load_pending_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let id = cp
            .create(
                CheckpointKind::ProjectVerification,
                Scope::Global,
                serde_json::json!({"title": "M1"}),
            )
            .unwrap();
        let pending = cp.load_pending(None, false).unwrap().unwrap();
        assert_eq!(pending.checkpoint_id, id);
        assert_eq!(pending.status, CheckpointStatus::Pending);
    }

    #[test]
    fn duplicate_pending_in_scope_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap();
        let err = cp
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[test]
    fn different_scopes_may_each_have_a_pending_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap();
        cp.create(CheckpointKind::IssueClosure, Scope::Issue(2), serde_json::json!({}))
            .unwrap();
    }

    #[test]
    fn resolve_then_complete_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let id = cp
            .create(CheckpointKind::MrReview, Scope::Global, serde_json::json!({}))
            .unwrap();
        cp.resolve(&id, Verdict::Approved, None, Some("lgtm".into())).unwrap();
        cp.complete(&id).unwrap();
        let latest = cp.latest_of_kind(CheckpointKind::MrReview).unwrap().unwrap();
        assert_eq!(latest.status, CheckpointStatus::Approved);
        assert!(latest.completed);
    }

    #[test]
    fn cannot_complete_while_pending() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let id = cp
            .create(CheckpointKind::MrReview, Scope::Global, serde_json::json!({}))
            .unwrap();
        let err = cp.complete(&id).unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[test]
    fn cannot_resolve_twice_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let id = cp
            .create(CheckpointKind::MrReview, Scope::Global, serde_json::json!({}))
            .unwrap();
        cp.resolve(&id, Verdict::Approved, None, None).unwrap();
        let err = cp.resolve(&id, Verdict::Rejected, None, None).unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[test]
    fn modifications_require_modified_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let id = cp
            .create(CheckpointKind::RegressionApproval, Scope::Global, serde_json::json!({}))
            .unwrap();
        let err = cp
            .resolve(&id, Verdict::Approved, Some(serde_json::json!({"x": 1})), None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[test]
    fn auto_accept_resolves_regression_approval_to_approved() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(
            CheckpointKind::RegressionApproval,
            Scope::Global,
            serde_json::json!({"issue": 7}),
        )
        .unwrap();
        let resolved = cp.load_pending(None, true).unwrap().unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert!(resolved.modifications.is_none());
    }

    #[test]
    fn auto_accept_resolves_issue_enrichment_to_approved() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(
            CheckpointKind::IssueEnrichment,
            Scope::Global,
            serde_json::json!({"recommended_enrichment_order": [3, 1, 2]}),
        )
        .unwrap();
        let resolved = cp.load_pending(None, true).unwrap().unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert!(resolved.modifications.is_none());
    }

    #[test]
    fn auto_accept_resolves_issue_selection_to_approved() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(
            CheckpointKind::IssueSelection,
            Scope::Global,
            serde_json::json!({"recommended_issue_order": [2, 1]}),
        )
        .unwrap();
        let resolved = cp.load_pending(None, true).unwrap().unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert!(resolved.modifications.is_none());
    }

    #[test]
    fn auto_accept_defaults_to_approved_without_recommendation() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        cp.create(CheckpointKind::ProjectVerification, Scope::Global, serde_json::json!({}))
            .unwrap();
        let resolved = cp.load_pending(None, true).unwrap().unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
    }

    #[test]
    fn terminal_checkpoint_blocked_while_quality_checks_fail() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        std::fs::create_dir_all(dir.path().join("scripts/verify")).unwrap();
        std::fs::write(dir.path().join("scripts/verify/run.sh"), "echo 'tests fail'\nexit 1\n").unwrap();
        let cp = Checkpoints::new(&ws);
        let err = cp
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }

    #[test]
    fn rejection_round_trip_creates_a_fresh_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let cp = Checkpoints::new(&ws);
        let first = cp
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap();
        cp.resolve(&first, Verdict::Rejected, None, Some("missing test".into()))
            .unwrap();
        cp.complete(&first).unwrap();

        // Scope is free again because the rejected one is completed.
        let second = cp
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), serde_json::json!({}))
            .unwrap();
        assert_ne!(first, second);
        cp.resolve(&second, Verdict::Approved, None, None).unwrap();
        cp.complete(&second).unwrap();
    }
}
