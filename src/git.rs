//! Git adapter.
//!
//! Thin porcelain wrapper bound to a working directory with a per-operation
//! timeout. Operations never retry on their own; retry policy belongs to the
//! caller. A merge that reports a conflict is surfaced as
//! [`GitError::Conflict`] so the caller can abort and requeue.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GitError;
use crate::subprocess::Tool;

/// Default timeout for a single git operation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for worktree removal, which may delete large trees.
pub const WORKTREE_TIMEOUT: Duration = Duration::from_secs(120);

/// Working-tree status summary.
#[derive(Debug, Clone)]
pub struct GitStatus {
    pub clean: bool,
    pub branch: String,
}

/// git client bound to a repository working directory.
pub struct Git {
    work_dir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_with_timeout(args, self.timeout)
    }

    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let output = Tool::new("git")
            .current_dir(&self.work_dir)
            .timeout(timeout)
            .args(args)
            .run()
            .map_err(|e| GitError::Failed(e.to_string()))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            let msg = if output.stderr.trim().is_empty() {
                format!("git {} failed", args.join(" "))
            } else {
                output.stderr.trim().to_string()
            };
            Err(GitError::Failed(msg))
        }
    }

    pub fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.run(&["fetch", remote]).map(|_| ())
    }

    pub fn fetch_branch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["fetch", remote, branch]).map(|_| ())
    }

    pub fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["checkout", branch]).map(|_| ())
    }

    pub fn pull(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["pull", remote, branch]).map(|_| ())
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|s| s.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let output = Tool::new("git")
            .current_dir(&self.work_dir)
            .timeout(self.timeout)
            .args(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .run()
            .map_err(|e| GitError::Failed(e.to_string()))?;
        Ok(output.success())
    }

    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GitError> {
        let stdout = self.run(&["ls-remote", "--heads", remote, branch])?;
        Ok(!stdout.trim().is_empty())
    }

    pub fn create_branch_from(&self, branch: &str, start: &str) -> Result<(), GitError> {
        self.run(&["branch", branch, start]).map(|_| ())
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, branch]).map(|_| ())
    }

    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["push", remote, "--delete", branch]).map(|_| ())
    }

    /// Merge `reference` with `--no-ff`. Conflicts come back as
    /// [`GitError::Conflict`]; the merge is left in place for the caller to
    /// abort.
    pub fn merge_no_ff(&self, reference: &str, message: &str) -> Result<(), GitError> {
        match self.run(&["merge", reference, "--no-ff", "-m", message]) {
            Ok(_) => Ok(()),
            Err(GitError::Failed(msg)) => {
                if msg.contains("CONFLICT") || msg.to_lowercase().contains("conflict") {
                    Err(GitError::Conflict(msg))
                } else {
                    Err(GitError::Failed(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn abort_merge(&self) -> Result<(), GitError> {
        self.run(&["merge", "--abort"]).map(|_| ())
    }

    pub fn reset_hard(&self, reference: &str) -> Result<(), GitError> {
        self.run(&["reset", "--hard", reference]).map(|_| ())
    }

    /// Push a branch. One attempt; callers own any retry loop.
    pub fn push(&self, remote: &str, branch: &str, force: bool) -> Result<(), GitError> {
        let result = if force {
            self.run(&["push", "--force-with-lease", remote, branch])
        } else {
            self.run(&["push", remote, branch])
        };
        result.map(|_| ()).map_err(|e| match e {
            GitError::Failed(msg) => GitError::PushFailed(msg),
            other => other,
        })
    }

    pub fn status(&self) -> Result<GitStatus, GitError> {
        let stdout = self.run(&["status", "--porcelain"])?;
        let branch = self.current_branch()?;
        Ok(GitStatus {
            clean: stdout.trim().is_empty(),
            branch,
        })
    }

    pub fn rev_parse(&self, reference: &str) -> Result<String, GitError> {
        self.run(&["rev-parse", reference])
            .map(|s| s.trim().to_string())
    }

    /// Commits on `reference` that are not on `base`.
    pub fn commits_ahead(&self, base: &str, reference: &str) -> Result<u32, GitError> {
        let stdout = self.run(&["rev-list", "--count", &format!("{base}..{reference}")])?;
        stdout
            .trim()
            .parse()
            .map_err(|_| GitError::Failed(format!("unexpected rev-list output: {stdout:?}")))
    }

    /// Creation date of a branch ref, ISO 8601.
    pub fn branch_created_date(&self, branch: &str) -> Result<String, GitError> {
        let reference = if branch.starts_with("origin/") {
            format!("refs/remotes/{branch}")
        } else {
            format!("refs/heads/{branch}")
        };
        let stdout = self.run(&[
            "for-each-ref",
            "--format=%(creatordate:iso8601-strict)",
            &reference,
        ])?;
        Ok(stdout.trim().to_string())
    }

    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let dir = path.to_string_lossy();
        self.run(&["worktree", "add", &dir, branch]).map(|_| ())
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let dir = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&dir);
        self.run_with_timeout(&args, WORKTREE_TIMEOUT).map(|_| ())
    }
}
