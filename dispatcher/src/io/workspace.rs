//! Working-directory preparation for the agent.
//!
//! The checkout is exclusive to the executor. Preparing it (clone if missing,
//! fetch, check out the configured branch) happens once per process; the
//! result is memoized and failed attempts are retried on the next call.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::io::git::Git;

/// One-time environment preparation required before tasks can run.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Idempotent; cheap after the first success.
    async fn prepare(&self) -> Result<()>;
}

/// Git checkout of the target repository.
#[derive(Debug)]
pub struct GitWorkspace {
    git: Git,
    url: Option<String>,
    remote: String,
    branch: String,
    ready: OnceCell<()>,
}

impl GitWorkspace {
    pub fn new(
        git: Git,
        url: Option<String>,
        remote: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            git,
            url,
            remote: remote.into(),
            branch: branch.into(),
            ready: OnceCell::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    #[instrument(skip_all, fields(workdir = %self.git.workdir().display(), branch = %self.branch))]
    async fn setup(&self) -> Result<()> {
        if !self.git.is_repo() {
            let url = self.url.as_deref().ok_or_else(|| {
                anyhow!(
                    "{} is not a git checkout and no repo.url is configured",
                    self.git.workdir().display()
                )
            })?;
            info!("cloning workspace");
            self.git.clone_repo(url).await?;
        }

        self.git.fetch(&self.remote).await?;

        if self.git.branch_exists(&self.branch).await? {
            if self.git.current_branch().await.ok().as_deref() != Some(self.branch.as_str()) {
                self.git.checkout_branch(&self.branch).await?;
            }
            if self
                .git
                .remote_branch_exists(&self.remote, &self.branch)
                .await?
            {
                self.git.pull_ff_only().await?;
            }
        } else if self
            .git
            .remote_branch_exists(&self.remote, &self.branch)
            .await?
        {
            let upstream = format!("{}/{}", self.remote, self.branch);
            self.git.checkout_tracking(&self.branch, &upstream).await?;
        } else {
            self.git.checkout_new_branch(&self.branch).await?;
        }

        debug!("workspace ready");
        Ok(())
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn prepare(&self) -> Result<()> {
        self.ready.get_or_try_init(|| self.setup()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRemote;

    #[tokio::test]
    async fn clones_and_checks_out_branch_once() {
        let remote = TestRemote::new().expect("remote");
        let workdir = remote.root().join("workspace");
        let workspace = GitWorkspace::new(
            Git::new(&workdir),
            Some(remote.url()),
            "origin",
            "main",
        );

        workspace.prepare().await.expect("prepare");
        assert!(workspace.is_ready());
        let git = Git::new(&workdir);
        assert_eq!(git.current_branch().await.expect("branch"), "main");

        // Cached: succeeds even once the remote is gone.
        remote.remove_bare().expect("remove bare");
        workspace.prepare().await.expect("prepare again");
    }

    #[tokio::test]
    async fn missing_checkout_without_url_fails_and_is_retried() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = GitWorkspace::new(
            Git::new(temp.path().join("absent")),
            None,
            "origin",
            "main",
        );

        let err = workspace.prepare().await.unwrap_err();
        assert!(err.to_string().contains("no repo.url"));
        assert!(!workspace.is_ready());
        assert!(workspace.prepare().await.is_err());
    }
}
