//! Contracts for the core's external collaborators (§6): the issue/MR
//! host, the quality-check runner, and the retry policy that wraps
//! transient failures of the former. The core never talks to a concrete
//! issue tracker directly — it only calls through `IssueHost`.

use std::future::Future;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::model::SessionFiles;

/// Run `call` up to `max_attempts` times with exponential backoff between
/// attempts (`2^attempt` seconds), matching the session orchestrator's
/// retry policy for transient external-integration failures (§4.3).
/// Only errors the closure marks transient (`HarnessError::is_transient`)
/// are retried; anything else returns immediately.
pub async fn retry_with_backoff<T, F, Fut>(max_attempts: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..max_attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                last_error = Some(e.to_string());
                let wait = Duration::from_secs(2u64.pow(attempt));
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(HarnessError::ExternalTransient {
                    attempts: attempt + 1,
                    reason: last_error.unwrap_or_else(|| e.to_string()),
                });
            }
        }
    }
    unreachable!("loop always returns on its last iteration")
}

/// A single created or updated issue-tracker item, kept host-agnostic.
#[derive(Debug, Clone)]
pub struct RemoteIssue {
    pub iid: u64,
    pub title: String,
    pub state: String,
}

/// Abstract contract for the issue/MR host the core consumes (§6). A
/// concrete implementation backs either a real code-host API or the
/// file-only mode's local JSON store; both must be feature-equivalent for
/// issue tracking, per the spec's file-only-mode requirement.
#[async_trait::async_trait]
pub trait IssueHost: Send + Sync {
    async fn create_milestone(&self, title: &str) -> Result<String>;
    async fn create_issue(&self, title: &str, description: &str, labels: &[String]) -> Result<RemoteIssue>;
    async fn update_issue_state(&self, iid: u64, state: &str) -> Result<()>;
    async fn add_note(&self, iid: u64, note: &str) -> Result<()>;
    async fn create_branch(&self, branch: &str) -> Result<()>;

    /// Push only the files in `files`. Enforces I4 by refusing anything
    /// not present in `tracked` before it ever reaches git.
    async fn push_files(&self, branch: &str, commit_msg: &str, tracked: &SessionFiles, files: &[String]) -> Result<()>;

    async fn create_merge_request(&self, source: &str, target: &str, title: &str, description: &str) -> Result<(u64, String)>;
    async fn get_merge_request(&self, iid: u64) -> Result<Option<String>>;
}

/// Local git + filesystem backed `IssueHost`, used by file-only mode and
/// by tests. Issue state lives in the workspace's `milestone` file (via
/// the caller), so this implementation only owns the git side of things.
pub struct LocalGitHost {
    pub repo_dir: std::path::PathBuf,
}

#[async_trait::async_trait]
impl IssueHost for LocalGitHost {
    async fn create_milestone(&self, title: &str) -> Result<String> {
        Ok(title.to_string())
    }

    async fn create_issue(&self, title: &str, _description: &str, _labels: &[String]) -> Result<RemoteIssue> {
        Ok(RemoteIssue {
            iid: 0,
            title: title.to_string(),
            state: "open".to_string(),
        })
    }

    async fn update_issue_state(&self, _iid: u64, _state: &str) -> Result<()> {
        Ok(())
    }

    async fn add_note(&self, _iid: u64, _note: &str) -> Result<()> {
        Ok(())
    }

    async fn create_branch(&self, branch: &str) -> Result<()> {
        crate::git::create_branch(&self.repo_dir, branch).map_err(HarnessError::ExternalPermanent)
    }

    async fn push_files(&self, _branch: &str, commit_msg: &str, tracked: &SessionFiles, files: &[String]) -> Result<()> {
        for f in files {
            if !tracked.owns(f) {
                return Err(HarnessError::invariant(format!(
                    "refusing to push untracked file {f} (I4)"
                )));
            }
        }
        crate::git::add_and_commit(&self.repo_dir, commit_msg).map_err(HarnessError::ExternalPermanent)?;
        let pushed = crate::git::push(&self.repo_dir).map_err(HarnessError::ExternalPermanent)?;
        if !pushed {
            return Err(HarnessError::ExternalTransient {
                attempts: 1,
                reason: "git push rejected (non-fast-forward?)".into(),
            });
        }
        Ok(())
    }

    async fn create_merge_request(&self, _source: &str, _target: &str, title: &str, _description: &str) -> Result<(u64, String)> {
        Ok((0, title.to_string()))
    }

    async fn get_merge_request(&self, _iid: u64) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Outcome of a single quality-check invocation (§6 "Quality-check
/// runner"): lint/format/types/tests each pass or fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityCheckReport {
    pub lint: bool,
    pub format: bool,
    pub types: bool,
    pub tests: bool,
}

impl QualityCheckReport {
    pub fn all_pass(&self) -> bool {
        self.lint && self.format && self.types && self.tests
    }
}

/// Run the project's check script (`scripts/verify/run.sh` by convention)
/// and fold its textual pass/fail lines into a `QualityCheckReport`. A
/// missing script is treated as all-pass with no checks configured, since
/// a project may reasonably have nothing to verify yet.
pub fn run_quality_checks(project_dir: &Path) -> Result<QualityCheckReport> {
    let script = project_dir.join("scripts/verify/run.sh");
    if !script.exists() {
        return Ok(QualityCheckReport {
            lint: true,
            format: true,
            types: true,
            tests: true,
        });
    }
    let output = Command::new("bash")
        .arg(&script)
        .current_dir(project_dir)
        .output()
        .map_err(|e| HarnessError::ChildProcess(format!("failed to run {}: {e}", script.display())))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let passed = |name: &str| -> bool {
        stdout
            .lines()
            .find(|l| l.contains(name))
            .map(|l| l.contains("pass"))
            .unwrap_or(output.status.success())
    };
    Ok(QualityCheckReport {
        lint: passed("lint"),
        format: passed("format"),
        types: passed("types"),
        tests: passed("tests"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HarnessError::ExternalTransient {
                        attempts: 1,
                        reason: "timeout".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let result: Result<()> = retry_with_backoff(3, || async {
            Err(HarnessError::ExternalTransient {
                attempts: 1,
                reason: "still down".into(),
            })
        })
        .await;
        match result {
            Err(HarnessError::ExternalTransient { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ExternalTransient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_does_not_retry_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(HarnessError::ExternalPermanent("forbidden".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quality_check_report_all_pass() {
        let report = QualityCheckReport {
            lint: true,
            format: true,
            types: true,
            tests: true,
        };
        assert!(report.all_pass());
        let failing = QualityCheckReport { tests: false, ..report };
        assert!(!failing.all_pass());
    }

    #[tokio::test]
    async fn push_files_rejects_untracked_paths() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalGitHost {
            repo_dir: dir.path().to_path_buf(),
        };
        let tracked = SessionFiles::default();
        let err = host
            .push_files("agent/demo", "msg", &tracked, &["escaped.rs".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Invariant(_)));
    }
}
