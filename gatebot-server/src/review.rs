//! Votes back to Gerrit over its SSH command interface.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use gatebot_core::ReviewVote;

const REVIEW_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("failed to run ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("gerrit review exited with {status}: {stderr}")]
    Command {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("gerrit review timed out")]
    Timeout,
}

/// Post votes against the review server.
#[async_trait]
pub trait ReviewWriter: Send + Sync {
    /// Post a vote plus message against the revision the vote names.
    /// One-shot side effect; nothing is persisted locally.
    async fn set_review(&self, vote: &ReviewVote) -> Result<(), ReviewError>;
}

/// Sets review state by running `gerrit review` over SSH.
pub struct GerritSshReviewer {
    user: String,
    host: String,
    port: u16,
    key_path: PathBuf,
}

impl GerritSshReviewer {
    pub fn new(user: &str, host: &str, port: u16, key_path: &Path) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            key_path: key_path.to_path_buf(),
        }
    }

    /// Arguments for one `ssh ... gerrit review` invocation.
    ///
    /// The message is single-quoted because ssh joins its arguments into
    /// a remote shell command line.
    fn review_args(&self, vote: &ReviewVote) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
            "gerrit".to_string(),
            "review".to_string(),
            "-m".to_string(),
            format!("'{}'", vote.message),
        ];
        if !vote.notify {
            args.push("-n".to_string());
            args.push("NONE".to_string());
        }
        args.push("--verified".to_string());
        args.push(vote.state.label().to_string());
        args.push(vote.revision.to_string());
        args
    }
}

#[async_trait]
impl ReviewWriter for GerritSshReviewer {
    async fn set_review(&self, vote: &ReviewVote) -> Result<(), ReviewError> {
        let args = self.review_args(vote);
        debug!(revision = %vote.revision, state = %vote.state, "setting review state");

        let output = tokio::time::timeout(
            REVIEW_TIMEOUT,
            Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ReviewError::Timeout)??;

        if !output.status.success() {
            return Err(ReviewError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}
