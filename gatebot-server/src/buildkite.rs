//! Buildkite REST client and the serde model of inbound Buildkite
//! webhooks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use gatebot_core::BuildId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CI API failure: the request was rejected, timed out, or could not be
/// sent. A failed trigger aborts build creation and nothing is persisted.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("buildkite returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("buildkite request timed out")]
    Timeout,
    #[error("buildkite request failed: {0}")]
    Transport(reqwest::Error),
}

impl From<reqwest::Error> for TriggerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TriggerError::Timeout
        } else {
            TriggerError::Transport(err)
        }
    }
}

/// Request to create one build.
#[derive(Debug, Clone, Serialize)]
pub struct CreateBuild {
    pub commit: String,
    pub branch: String,
    pub author: BuildAuthor,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildAuthor {
    pub name: String,
    pub email: String,
}

/// A build accepted by the CI system.
#[derive(Debug, Clone)]
pub struct CreatedBuild {
    pub id: BuildId,
    pub web_url: String,
}

/// Result of a cancellation. An already-finished, already-cancelled, or
/// unknown build is a no-op success: the superseding path only cares that
/// the build is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

/// Create and cancel builds against the CI system.
#[async_trait]
pub trait BuildPipeline: Send + Sync {
    /// Ask the CI system for a new build. Not idempotent: calling twice
    /// creates two builds.
    async fn create_build(&self, build: &CreateBuild) -> Result<CreatedBuild, TriggerError>;

    async fn cancel_build(&self, build: &BuildId) -> Result<CancelOutcome, TriggerError>;
}

/// REST client for one Buildkite pipeline.
pub struct BuildkiteClient {
    client: reqwest::Client,
    builds_url: String,
    token: String,
}

impl BuildkiteClient {
    pub fn new(
        api_url: &str,
        org_slug: &str,
        pipeline_slug: &str,
        token: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            builds_url: format!(
                "{}/organizations/{}/pipelines/{}/builds",
                api_url.trim_end_matches('/'),
                org_slug,
                pipeline_slug
            ),
            token: token.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    number: u64,
    web_url: String,
}

#[async_trait]
impl BuildPipeline for BuildkiteClient {
    async fn create_build(&self, build: &CreateBuild) -> Result<CreatedBuild, TriggerError> {
        let response = self
            .client
            .post(&self.builds_url)
            .bearer_auth(&self.token)
            .json(build)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(TriggerError::Api { status, body });
        }

        let created: BuildResponse = response.json().await?;
        debug!(build = created.number, "created buildkite build");
        Ok(CreatedBuild {
            id: BuildId::from(created.number),
            web_url: created.web_url,
        })
    }

    async fn cancel_build(&self, build: &BuildId) -> Result<CancelOutcome, TriggerError> {
        let url = format!("{}/{}/cancel", self.builds_url, build);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(CancelOutcome::Cancelled),
            StatusCode::NOT_FOUND => Ok(CancelOutcome::NotFound),
            // Buildkite rejects cancellation of a build in a terminal
            // state with 422; the caller treats that as done.
            StatusCode::UNPROCESSABLE_ENTITY => Ok(CancelOutcome::AlreadyTerminal),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TriggerError::Api { status, body })
            }
        }
    }
}

/// One inbound Buildkite webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildkiteWebhook {
    pub event: String,
    pub build: WebhookBuild,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBuild {
    pub id: Option<String>,
    pub number: u64,
    pub state: Option<String>,
    pub web_url: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub rebuilt_from: Option<RebuiltFrom>,
}

/// Reference to the build a rebuild was created from.
#[derive(Debug, Clone, Deserialize)]
pub struct RebuiltFrom {
    pub id: Option<String>,
    pub number: u64,
    pub url: Option<String>,
}
