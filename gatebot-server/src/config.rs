use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::stream::ReconnectPolicy;

#[derive(Clone)]
pub struct Config {
    /// Gerrit SSH identity, split out of GERRIT_SSH_URL.
    pub gerrit_user: String,
    pub gerrit_host: String,
    pub gerrit_port: u16,
    pub gerrit_ssh_key_path: PathBuf,
    /// Only events for this Gerrit project are acted on.
    pub gerrit_project: String,
    pub buildkite_org_slug: String,
    pub buildkite_pipeline_slug: String,
    pub buildkite_api_url: String,
    pub buildkite_api_token: String,
    /// Feature flag for the inbound webhook path. When disabled, builds
    /// are still triggered but outcomes are never reflected back.
    pub webhook_enabled: bool,
    pub buildkite_webhook_token: Option<String>,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub reconnect_policy: ReconnectPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let ssh_url = env::var("GERRIT_SSH_URL")
            .context("GERRIT_SSH_URL environment variable is required")?;
        let (gerrit_user, gerrit_host, gerrit_port) = parse_ssh_url(&ssh_url)?;

        let gerrit_ssh_key_path = env::var("GERRIT_SSH_KEY_PATH")
            .map(PathBuf::from)
            .context("GERRIT_SSH_KEY_PATH environment variable is required")?;

        let gerrit_project = env::var("GERRIT_PROJECT")
            .context("GERRIT_PROJECT environment variable is required")?;

        let buildkite_org_slug = env::var("BUILDKITE_ORG_SLUG")
            .context("BUILDKITE_ORG_SLUG environment variable is required")?;

        let buildkite_pipeline_slug = env::var("BUILDKITE_PIPELINE_SLUG")
            .context("BUILDKITE_PIPELINE_SLUG environment variable is required")?;

        let buildkite_api_token = env::var("BUILDKITE_API_TOKEN")
            .context("BUILDKITE_API_TOKEN environment variable is required")?;

        let buildkite_api_url = env::var("BUILDKITE_API_URL")
            .unwrap_or_else(|_| "https://api.buildkite.com/v2".to_string());

        let webhook_enabled = parse_webhook_enabled(env::var("WEBHOOK_ENABLED").ok());

        let buildkite_webhook_token = env::var("BUILDKITE_WEBHOOK_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        if webhook_enabled && buildkite_webhook_token.is_none() {
            bail!("BUILDKITE_WEBHOOK_TOKEN is required while WEBHOOK_ENABLED is true");
        }

        let port = env::var("PORT")
            .unwrap_or_else(|_| "10005".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let reconnect_policy =
            parse_reconnect_policy(env::var("RECONNECT_DELAY_SECS").ok())?;

        Ok(Config {
            gerrit_user,
            gerrit_host,
            gerrit_port,
            gerrit_ssh_key_path,
            gerrit_project,
            buildkite_org_slug,
            buildkite_pipeline_slug,
            buildkite_api_url,
            buildkite_api_token,
            webhook_enabled,
            buildkite_webhook_token,
            port,
            state_dir,
            reconnect_policy,
        })
    }
}

/// Split an `ssh://user@host:port` URL into its parts. The port defaults
/// to Gerrit's standard SSH port when absent; the user is required.
pub fn parse_ssh_url(raw: &str) -> Result<(String, String, u16)> {
    let url = Url::parse(raw).with_context(|| format!("invalid gerrit ssh url: {raw}"))?;
    if url.scheme() != "ssh" {
        bail!("gerrit url must use the ssh scheme, got {}", url.scheme());
    }
    let host = url
        .host_str()
        .with_context(|| format!("gerrit ssh url is missing a host: {raw}"))?
        .to_string();
    if url.username().is_empty() {
        bail!("gerrit ssh url is missing a user: {raw}");
    }
    let port = url.port().unwrap_or(29418);
    Ok((url.username().to_string(), host, port))
}

/// Parse WEBHOOK_ENABLED. Missing or unparseable means enabled.
pub fn parse_webhook_enabled(value: Option<String>) -> bool {
    value
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(true)
}

/// Parse RECONNECT_DELAY_SECS into a policy. Absent or zero means redial
/// immediately; the SSH transport's keep-alive makes that safe.
pub fn parse_reconnect_policy(value: Option<String>) -> Result<ReconnectPolicy> {
    match value {
        None => Ok(ReconnectPolicy::Immediate),
        Some(raw) => {
            let secs = raw
                .trim()
                .parse::<u64>()
                .context("RECONNECT_DELAY_SECS must be a number of seconds")?;
            if secs == 0 {
                Ok(ReconnectPolicy::Immediate)
            } else {
                Ok(ReconnectPolicy::Fixed(Duration::from_secs(secs)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_url_full() {
        let (user, host, port) =
            parse_ssh_url("ssh://buildkite@gerrit.example.com:29418").expect("parse");
        assert_eq!(user, "buildkite");
        assert_eq!(host, "gerrit.example.com");
        assert_eq!(port, 29418);
    }

    #[test]
    fn test_parse_ssh_url_default_port() {
        let (_, _, port) = parse_ssh_url("ssh://buildkite@gerrit.example.com").expect("parse");
        assert_eq!(port, 29418);
    }

    #[test]
    fn test_parse_ssh_url_rejects_other_schemes() {
        assert!(parse_ssh_url("https://gerrit.example.com").is_err());
    }

    #[test]
    fn test_parse_ssh_url_requires_user() {
        assert!(parse_ssh_url("ssh://gerrit.example.com:29418").is_err());
    }

    #[test]
    fn test_parse_webhook_enabled() {
        assert!(parse_webhook_enabled(None));
        assert!(parse_webhook_enabled(Some("true".to_string())));
        assert!(!parse_webhook_enabled(Some("false".to_string())));
        // Unparseable falls back to the default.
        assert!(parse_webhook_enabled(Some("yes please".to_string())));
    }

    #[test]
    fn test_parse_reconnect_policy() {
        assert_eq!(
            parse_reconnect_policy(None).unwrap(),
            ReconnectPolicy::Immediate
        );
        assert_eq!(
            parse_reconnect_policy(Some("0".to_string())).unwrap(),
            ReconnectPolicy::Immediate
        );
        assert_eq!(
            parse_reconnect_policy(Some("5".to_string())).unwrap(),
            ReconnectPolicy::Fixed(Duration::from_secs(5))
        );
        assert!(parse_reconnect_policy(Some("soon".to_string())).is_err());
    }
}
