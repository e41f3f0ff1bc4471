//! Git adapter for the dispatcher.
//!
//! Workspace setup and remote verification only need a handful of git
//! operations, so we keep a small, explicit wrapper around `git` subprocess
//! calls rather than linking a git library.

use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the working directory is inside a git checkout.
    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// Clone `url` into this wrapper's working directory.
    #[instrument(skip_all, fields(dest = %self.workdir.display()))]
    pub async fn clone_repo(&self, url: &str) -> Result<()> {
        if let Some(parent) = self.workdir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create clone parent {}", parent.display()))?;
        }
        debug!("cloning repository");
        let output = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(&self.workdir)
            .output()
            .await
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub async fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Fetch the latest refs from `remote`, pruning deleted branches.
    #[instrument(skip_all, fields(remote))]
    pub async fn fetch(&self, remote: &str) -> Result<()> {
        debug!(remote, "fetching");
        self.run_checked(&["fetch", "--prune", remote]).await?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}")).await
    }

    /// Check whether a remote-tracking branch exists.
    pub async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/remotes/{remote}/{branch}"))
            .await
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub async fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch]).await?;
        Ok(())
    }

    /// Create a local branch tracking `upstream` (e.g. `origin/main`) and check it out.
    #[instrument(skip_all, fields(branch, upstream))]
    pub async fn checkout_tracking(&self, branch: &str, upstream: &str) -> Result<()> {
        debug!(branch, upstream, "checking out tracking branch");
        self.run_checked(&["checkout", "-b", branch, "--track", upstream])
            .await?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    /// Fast-forward the current branch to its upstream.
    pub async fn pull_ff_only(&self) -> Result<()> {
        self.run_checked(&["pull", "--ff-only"]).await?;
        Ok(())
    }

    /// Remote-tracking branches (e.g. `origin/main`) whose history contains `commit`.
    #[instrument(skip_all, fields(commit))]
    pub async fn remote_branches_containing(&self, commit: &str) -> Result<Vec<String>> {
        let out = self
            .run_capture(&["branch", "-r", "--contains", commit])
            .await?;
        Ok(parse_branch_list(&out))
    }

    async fn ref_exists(&self, reference: &str) -> Result<bool> {
        let status = self
            .run(&["show-ref", "--verify", "--quiet", reference])
            .await?
            .status;
        Ok(status.success())
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git branch` output into bare branch names.
fn parse_branch_list(out: &str) -> Vec<String> {
    out.lines()
        .map(|line| line.trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        // `origin/HEAD -> origin/main` is an alias, not a branch of its own.
        .filter(|line| !line.contains("->"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_branch_list() {
        let out = "  origin/HEAD -> origin/main\n  origin/feature\n  origin/main\n";
        assert_eq!(
            parse_branch_list(out),
            vec!["origin/feature".to_string(), "origin/main".to_string()]
        );
    }

    #[test]
    fn parses_empty_branch_list() {
        assert!(parse_branch_list("\n").is_empty());
    }

    #[test]
    fn strips_current_branch_marker() {
        assert_eq!(parse_branch_list("* main\n  dev\n"), vec!["main", "dev"]);
    }
}
