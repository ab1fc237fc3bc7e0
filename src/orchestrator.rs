//! Session Orchestrator (C3): drives one agent through the Initializer /
//! Coding-loop / MR phase state machine, one fresh subprocess per session
//! (§4.3). Grounded on the teacher's `run_single_agent` session loop: a
//! stop-sentinel check, an all-done check, a spawn-and-stream-to-log step,
//! then a post-session verification/sync pass before looping again.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use serde_json::Value;

use crate::checkpoint::Checkpoints;
use crate::error::{HarnessError, Result};
use crate::integrations::{run_quality_checks, IssueHost};
use crate::model::{
    AgentConfig, Checkpoint, CheckpointKind, CheckpointStatus, Issue, IssueStatus, Milestone,
    Phase, Scope, SessionFiles,
};
use crate::store::Workspace;

/// Outcome of driving a single session to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The subprocess created a pending checkpoint and exited; no further
    /// sessions can run until it is resolved.
    WaitingCheckpoint,
    /// The session advanced the phase or finished the current phase's work.
    Advanced { next_phase: Phase },
    /// The whole SpecRun has reached its terminal phase.
    Done,
    /// The subprocess failed (non-zero exit or detected protocol breach).
    Failed { reason: String },
    /// A stop was requested before the subprocess was spawned.
    Stopped,
}

/// Sentinel-file stop request, matching the teacher's `request_stop` /
/// `stop_requested` mechanism: a plain marker file under the workspace
/// root, checked at the top of every session.
pub fn stop_requested(workspace_root: &Path) -> bool {
    workspace_root.join("STOP").exists()
}

pub fn request_stop(workspace_root: &Path) -> Result<()> {
    std::fs::create_dir_all(workspace_root)?;
    std::fs::write(workspace_root.join("STOP"), b"")?;
    Ok(())
}

pub fn clear_stop(workspace_root: &Path) {
    let _ = std::fs::remove_file(workspace_root.join("STOP"));
}

/// Drives exactly one session of `agent_id` against `workspace`. Returns
/// once the subprocess exits (or is skipped because Step 0 found a
/// pending checkpoint).
pub async fn run_session(
    agent_id: u64,
    workspace: &Workspace,
    config: &AgentConfig,
    phase: Phase,
    host: &dyn IssueHost,
) -> Result<SessionOutcome> {
    if stop_requested(workspace.root()) {
        return Ok(SessionOutcome::Stopped);
    }

    let checkpoints = Checkpoints::new(workspace);

    // Step 0: the resumption gate (§4.3).
    if let Some(pending) = checkpoints.load_pending(None, config.auto_accept)? {
        match pending.status {
            CheckpointStatus::Pending => {
                return Ok(SessionOutcome::WaitingCheckpoint);
            }
            CheckpointStatus::Approved | CheckpointStatus::Modified => {
                return continue_from_checkpoint(workspace, config, host, &pending).await;
            }
            CheckpointStatus::Rejected => {
                return handle_rejection(workspace, &pending.checkpoint_id, pending.kind).await;
            }
        }
    }

    run_subprocess_session(agent_id, workspace, config, phase, host).await
}

/// The data a continuation should act on: a human's explicit override
/// (`modifications`) when present, otherwise the proposal the checkpoint
/// was created with (`context`). `auto_verdict_for` never attaches
/// `modifications` to an `Approved` verdict (§4.2, I2), so the approved
/// auto-accept path always falls through to `context` here.
fn effective_payload(checkpoint: &Checkpoint) -> &Value {
    checkpoint.modifications.as_ref().unwrap_or(&checkpoint.context)
}

/// Continuation for an `approved`/`modified` checkpoint: carry out the
/// kind-specific consequence, then mark the checkpoint completed (I3).
async fn continue_from_checkpoint(
    workspace: &Workspace,
    config: &AgentConfig,
    host: &dyn IssueHost,
    checkpoint: &Checkpoint,
) -> Result<SessionOutcome> {
    let checkpoints = Checkpoints::new(workspace);
    let next_phase = match checkpoint.kind {
        CheckpointKind::ProjectVerification => Phase::Initializer,
        CheckpointKind::SpecToIssues | CheckpointKind::IssueEnrichment => Phase::Initializer,
        CheckpointKind::IssueSelection | CheckpointKind::IssueClosure | CheckpointKind::RegressionApproval => {
            Phase::Coding
        }
        CheckpointKind::MrPhaseTransition => Phase::Mr,
        CheckpointKind::MrReview => Phase::Done,
    };

    let effective = effective_payload(checkpoint);

    match checkpoint.kind {
        CheckpointKind::ProjectVerification => {
            let title = effective
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(config.spec_slug.as_str())
                .to_string();
            let external_id = host.create_milestone(&title).await?;
            workspace.write_milestone(&Milestone {
                external_project_id: None,
                external_milestone_id: Some(external_id),
                title,
                issues: Vec::new(),
                all_issues_closed: false,
                completed_at: None,
                merge_request_iid: None,
                merge_request_url: None,
                session_files: SessionFiles::default(),
            })?;
        }
        CheckpointKind::SpecToIssues => {
            let mut milestone = workspace.read_milestone()?;
            let proposed = effective
                .get("issues")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in proposed {
                let title = item
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("untitled")
                    .to_string();
                let description = item
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let labels: Vec<String> = item
                    .get("labels")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|l| l.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let remote = host.create_issue(&title, &description, &labels).await?;
                milestone.issues.push(Issue {
                    iid: remote.iid,
                    title,
                    description,
                    status: IssueStatus::Open,
                    labels,
                    enrichment: None,
                });
            }
            workspace.write_milestone(&milestone)?;
        }
        CheckpointKind::IssueEnrichment => {
            let mut milestone = workspace.read_milestone()?;
            if let Some(enrichments) = checkpoint.context.get("enrichments").and_then(Value::as_array) {
                for item in enrichments {
                    let Some(iid) = item.get("iid").and_then(Value::as_u64) else {
                        continue;
                    };
                    if let Ok(enrichment) = serde_json::from_value::<crate::model::IssueEnrichment>(item.clone()) {
                        if let Some(issue) = milestone.issue_mut(iid) {
                            issue.enrichment = Some(enrichment);
                        }
                    }
                }
            }
            workspace.write_milestone(&milestone)?;
        }
        CheckpointKind::IssueSelection => {
            let mut milestone = workspace.read_milestone()?;
            let order = checkpoint
                .modifications
                .as_ref()
                .and_then(|m| m.get("issue_order"))
                .or_else(|| checkpoint.context.get("recommended_issue_order"))
                .and_then(Value::as_array);
            let claimed = order.and_then(|o| o.first()).and_then(Value::as_u64);
            if let Some(iid) = claimed {
                if let Some(issue) = milestone.issue_mut(iid) {
                    issue.status = IssueStatus::InProgress;
                }
            }
            workspace.write_milestone(&milestone)?;
        }
        CheckpointKind::IssueClosure => {
            let mut milestone = workspace.read_milestone()?;
            if let Scope::Issue(iid) = checkpoint.scope {
                if let Some(issue) = milestone.issue_mut(iid) {
                    issue.status = IssueStatus::Closed;
                }
            }
            milestone.recompute_all_closed();
            workspace.write_milestone(&milestone)?;
        }
        CheckpointKind::RegressionApproval => {
            // No C1 state mutation: `human_decision` (read from
            // `modifications`, defaulting to `fix_now` under auto-accept)
            // only shapes what the next session's subprocess attempts.
        }
        CheckpointKind::MrPhaseTransition => {}
        CheckpointKind::MrReview => {
            let mut milestone = workspace.read_milestone()?;
            let info = workspace.read_workspace_info()?;
            let title = effective
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(config.spec_slug.as_str())
                .to_string();
            let description = effective
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let (iid, url) = host
                .create_merge_request(&info.feature_branch, &config.target_branch, &title, &description)
                .await?;
            milestone.merge_request_iid = Some(iid);
            milestone.merge_request_url = Some(url);
            workspace.write_milestone(&milestone)?;
        }
    }

    checkpoints.complete(&checkpoint.checkpoint_id)?;

    let outcome = if next_phase == Phase::Done {
        SessionOutcome::Done
    } else {
        SessionOutcome::Advanced { next_phase }
    };
    Ok(outcome)
}

/// `rejected` checkpoints are completed as soon as the agent has observed
/// and recorded the rejection (I3): for an `issue_closure` or similar
/// terminal gate this means "completed" immediately, since the feedback
/// itself is the acted-upon consequence. The session then ends so the
/// next session creates a fresh checkpoint addressing `human_notes`.
async fn handle_rejection(
    workspace: &Workspace,
    checkpoint_id: &str,
    kind: CheckpointKind,
) -> Result<SessionOutcome> {
    let checkpoints = Checkpoints::new(workspace);
    checkpoints.complete(checkpoint_id)?;
    match kind {
        CheckpointKind::ProjectVerification | CheckpointKind::SpecToIssues => {
            Ok(SessionOutcome::Failed {
                reason: format!("{:?} rejected; halting", kind),
            })
        }
        _ => Ok(SessionOutcome::Advanced { next_phase: Phase::Coding }),
    }
}

/// Launch the AI subprocess and stream its output into the session log
/// (§4.3a). The subprocess command line comes from `AgentConfig.command`,
/// defaulting to `HARNESS_AGENT_COMMAND` or `claude --print`.
async fn run_subprocess_session(
    agent_id: u64,
    workspace: &Workspace,
    config: &AgentConfig,
    phase: Phase,
    host: &dyn IssueHost,
) -> Result<SessionOutcome> {
    let session_started = Utc::now();
    let session_tag = session_started.format("%Y%m%dT%H%M%S%.f").to_string();

    // I5: every session starts from a freshly reset file-ownership record,
    // so a later push can never leak a prior session's edits.
    if let Ok(mut milestone) = workspace.read_milestone() {
        milestone.session_files = SessionFiles::reset(session_started);
        workspace.write_milestone(&milestone)?;
    }

    let (cmd, args) = resolve_command(config);
    let prompt = build_session_prompt(config, phase);

    let mut child = Command::new(&cmd)
        .args(&args)
        .arg(&prompt)
        .current_dir(&config.project_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("HARNESS_AGENT_ID", agent_id.to_string())
        .spawn()
        .map_err(|e| HarnessError::ChildProcess(format!("failed to spawn {cmd}: {e}")))?;

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
            workspace.append_log(agent_id, &session_tag, &line)?;
        }
    }
    if let Some(stderr) = child.stderr.take() {
        for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
            workspace.append_log(agent_id, &session_tag, &format!("stderr: {line}"))?;
        }
    }

    let status = child
        .wait()
        .map_err(|e| HarnessError::ChildProcess(format!("failed to wait on {cmd}: {e}")))?;

    if !status.success() {
        return Ok(SessionOutcome::Failed {
            reason: format!("{cmd} exited with {status}"),
        });
    }

    if !config.mode_flags.file_only_mode {
        push_session_changes(workspace, config, host, agent_id, &session_tag).await?;
    }

    // A session that ends without creating any checkpoint and without
    // finishing its phase's work is itself a protocol violation; callers
    // poll `load_pending`/workspace state on their next tick to decide.
    Ok(SessionOutcome::Advanced { next_phase: phase })
}

/// Detect the files the subprocess just touched (via git), record them into
/// `Milestone.session_files` (I5's "reset, then record" half), and push
/// only that exact set to the external host (I4/P5) — never whatever else
/// happens to be dirty in the working tree. A no-op before any milestone
/// exists (the Initializer phase, before `project_verification` approval).
async fn push_session_changes(
    workspace: &Workspace,
    config: &AgentConfig,
    host: &dyn IssueHost,
    agent_id: u64,
    session_tag: &str,
) -> Result<()> {
    let Ok(mut milestone) = workspace.read_milestone() else {
        return Ok(());
    };
    let changed =
        crate::git::changed_files(&config.project_dir).map_err(HarnessError::ExternalPermanent)?;
    if changed.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    for path in &changed {
        milestone.session_files.record(path.clone(), now);
    }
    workspace.write_milestone(&milestone)?;

    let info = workspace.read_workspace_info()?;
    host.create_branch(&info.feature_branch).await?;
    host.push_files(
        &info.feature_branch,
        &format!("harness: agent {agent_id} session {session_tag}"),
        &milestone.session_files,
        &changed,
    )
    .await
}

fn resolve_command(config: &AgentConfig) -> (String, Vec<String>) {
    if let Some(parts) = &config.command {
        if let Some((head, tail)) = parts.split_first() {
            return (head.clone(), tail.to_vec());
        }
    }
    if let Ok(env_cmd) = std::env::var("HARNESS_AGENT_COMMAND") {
        let mut parts = env_cmd.split_whitespace().map(str::to_string);
        if let Some(head) = parts.next() {
            return (head, parts.collect());
        }
    }
    ("claude".to_string(), vec!["--print".to_string()])
}

fn build_session_prompt(config: &AgentConfig, phase: Phase) -> String {
    format!(
        "phase={:?} spec_slug={} target_branch={}",
        phase, config.spec_slug, config.target_branch
    )
}

/// Before a terminal checkpoint (`issue_closure`, `mr_review`) may be
/// created, the quality checks must have passed (§4.3 "Verification loops
/// required within a session"). Returns the report so callers can refuse
/// the creation when it is missing or failing.
pub fn gate_terminal_checkpoint(project_dir: &Path, mode_flags: &crate::model::ModeFlags) -> Result<bool> {
    if mode_flags.skip_test_suite {
        return Ok(true);
    }
    let report = run_quality_checks(project_dir)?;
    Ok(report.all_pass())
}
