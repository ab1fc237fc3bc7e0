use std::path::Path;
use std::process::Command;

/// Check if the repo has a remote configured.
fn has_remote(dir: &Path) -> bool {
    Command::new("git")
        .args(["remote"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false)
}

/// Stage all changes and commit. Returns false if nothing to commit.
pub fn add_and_commit(dir: &Path, message: &str) -> Result<bool, String> {
    // Stage all
    Command::new("git")
        .args(["add", "-A"])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git add failed: {e}"))?;

    // Check for staged changes
    let status = Command::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(dir)
        .status()
        .map_err(|e| format!("git diff failed: {e}"))?;

    if status.success() {
        return Ok(false); // nothing staged
    }

    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git commit failed: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git commit failed: {stderr}"));
    }
    Ok(true)
}

/// Push to remote. No-op if no remote. Returns false if push fails (e.g. conflict).
pub fn push(dir: &Path) -> Result<bool, String> {
    if !has_remote(dir) {
        return Ok(true);
    }
    let output = Command::new("git")
        .args(["push"])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git push failed: {e}"))?;
    Ok(output.status.success())
}

/// Create a branch (checked out in `dir`) if it doesn't already exist.
pub fn create_branch(dir: &Path, branch: &str) -> Result<(), String> {
    let output = Command::new("git")
        .args(["checkout", "-B", branch])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git checkout -B failed: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git checkout -B failed: {stderr}"));
    }
    Ok(())
}

/// Paths with uncommitted changes (tracked or untracked) relative to `dir`,
/// the set of files a session's subprocess actually touched.
pub fn changed_files(dir: &Path) -> Result<Vec<String>, String> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir)
        .output()
        .map_err(|e| format!("git status failed: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git status failed: {stderr}"));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| line.get(3..))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        Command::new("git")
            .args(["init"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .unwrap();
        // Initial commit so HEAD exists
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn has_remote_false_for_local() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(!has_remote(dir.path()));
    }

    #[test]
    fn create_branch_checks_out_new_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        create_branch(dir.path(), "agent/demo").unwrap();
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "agent/demo");
    }

    #[test]
    fn add_and_commit_works() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        // Nothing to commit
        assert!(!add_and_commit(dir.path(), "empty").unwrap());

        // Create file and commit
        std::fs::write(dir.path().join("test.txt"), "hello").unwrap();
        assert!(add_and_commit(dir.path(), "add test").unwrap());

        // Nothing to commit again
        assert!(!add_and_commit(dir.path(), "empty again").unwrap());
    }

    #[test]
    fn push_noop_without_remote() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(push(dir.path()).unwrap());
    }

    #[test]
    fn changed_files_lists_new_and_modified_paths() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("README.md"), "# test\nedited\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "fresh").unwrap();
        let mut changed = changed_files(dir.path()).unwrap();
        changed.sort();
        assert_eq!(changed, vec!["README.md".to_string(), "new.txt".to_string()]);
    }

    #[test]
    fn changed_files_empty_on_clean_tree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(changed_files(dir.path()).unwrap().is_empty());
    }
}
