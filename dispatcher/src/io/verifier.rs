//! Remote-state verification for commits the agent claims to have pushed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::redact::Redactor;
use crate::io::git::Git;

/// Confirms that a commit is visible on the configured remote branch.
///
/// Verification is a confidence signal, not a gate: implementations return
/// `false` on any failure instead of erroring.
#[async_trait]
pub trait RemoteVerifier: Send + Sync {
    async fn is_on_remote(&self, commit: &str) -> bool;
}

/// Verifier that fetches the remote and asks git which remote branches contain the commit.
#[derive(Debug, Clone)]
pub struct GitRemoteVerifier {
    git: Git,
    remote: String,
    branch: String,
    redactor: Arc<Redactor>,
}

impl GitRemoteVerifier {
    /// Git failures are logged through `redactor`, since they can echo remote URLs.
    pub fn new(
        git: Git,
        remote: impl Into<String>,
        branch: impl Into<String>,
        redactor: Arc<Redactor>,
    ) -> Self {
        Self {
            git,
            remote: remote.into(),
            branch: branch.into(),
            redactor,
        }
    }

    pub fn target(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

#[async_trait]
impl RemoteVerifier for GitRemoteVerifier {
    #[instrument(skip_all, fields(commit, target = %self.target()))]
    async fn is_on_remote(&self, commit: &str) -> bool {
        if let Err(e) = self.git.fetch(&self.remote).await {
            warn!(
                err = %self.redactor.redact(&format!("{e:#}")),
                "could not fetch remote for verification"
            );
            return false;
        }
        match self.git.remote_branches_containing(commit).await {
            Ok(branches) => {
                let found = branch_listed(&branches, &self.remote, &self.branch);
                debug!(found, candidates = branches.len(), "remote verification");
                found
            }
            Err(e) => {
                warn!(
                    err = %self.redactor.redact(&format!("{e:#}")),
                    "could not verify commit on remote"
                );
                false
            }
        }
    }
}

/// True if `branches` (as printed by `git branch -r`) includes `remote/branch`.
fn branch_listed(branches: &[String], remote: &str, branch: &str) -> bool {
    let wanted = format!("{remote}/{branch}");
    branches.iter().any(|candidate| *candidate == wanted)
}
