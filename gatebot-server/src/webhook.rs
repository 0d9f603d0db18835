//! Inbound Buildkite webhooks: the HTTP endpoint and the dispatcher that
//! turns build lifecycle events into review votes.
//!
//! The two halves are decoupled by a bounded queue so HTTP handlers never
//! run review-server round-trips. When the queue is full the HTTP response
//! blocks instead of dropping the event: a slow consumer pushes
//! backpressure onto Buildkite's retry behavior rather than losing
//! deliveries.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use gatebot_core::{BuildId, ReviewState, ReviewVote};

use crate::buildkite::{BuildkiteWebhook, WebhookBuild};
use crate::AppState;

/// Queue depth between the HTTP endpoint and the dispatcher.
pub const WEBHOOK_QUEUE_DEPTH: usize = 16;

const TOKEN_HEADER: &str = "X-Buildkite-Token";

struct WebhookEndpoint {
    token: String,
    queue: mpsc::Sender<BuildkiteWebhook>,
}

/// Router for the webhook endpoint: POST `/` only. Axum answers other
/// methods with 405 and other paths with 404 on its own.
pub fn webhook_router(token: String, queue: mpsc::Sender<BuildkiteWebhook>) -> Router {
    Router::new()
        .route("/", post(receive_webhook))
        .with_state(Arc::new(WebhookEndpoint { token, queue }))
}

async fn receive_webhook(
    State(endpoint): State<Arc<WebhookEndpoint>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Shared-secret header, compared byte for byte. No event is published
    // for a request that fails this check.
    let authorized = headers
        .get(TOKEN_HEADER)
        .map(|value| value.as_bytes() == endpoint.token.as_bytes())
        .unwrap_or(false);
    if !authorized {
        warn!("webhook rejected: invalid or missing token");
        return StatusCode::UNAUTHORIZED;
    }

    let webhook: BuildkiteWebhook = match serde_json::from_slice(&body) {
        Ok(webhook) => webhook,
        Err(err) => {
            warn!(error = %err, "webhook rejected: undecodable body");
            return StatusCode::BAD_REQUEST;
        }
    };

    info!(event = %webhook.event, build = webhook.build.number, "webhook received");

    if endpoint.queue.send(webhook).await.is_err() {
        error!("webhook dispatcher is gone, dropping event");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    StatusCode::OK
}

/// Consume webhook deliveries until the channel closes.
pub async fn run_dispatcher(
    state: Arc<AppState>,
    mut deliveries: mpsc::Receiver<BuildkiteWebhook>,
) {
    while let Some(webhook) = deliveries.recv().await {
        handle_webhook(&state, &webhook).await;
    }
    info!("webhook channel closed, dispatcher exiting");
}

/// Process one webhook delivery.
///
/// Never fails: a webhook naming a build this process did not trigger is
/// normal (manual builds, history predating this process) and is dropped
/// after a log line, as is any store or review failure.
pub async fn handle_webhook(state: &AppState, webhook: &BuildkiteWebhook) {
    match webhook.event.as_str() {
        "build.running" => handle_build_running(state, webhook).await,
        "build.finished" => handle_build_finished(state, webhook).await,
        "build.scheduled" => info!(build = webhook.build.number, "build scheduled"),
        "build.cancelled" => info!(build = webhook.build.number, "build cancelled"),
        other => debug!(event = other, "ignoring webhook event"),
    }
}

fn build_link(build: &WebhookBuild) -> String {
    build
        .web_url
        .clone()
        .unwrap_or_else(|| format!("build {}", build.number))
}

/// A rebuild reuses the source build's revision: copy the mapping to the
/// new build id and neutralize the previous vote.
///
/// Buildkite retries steps, so the same rebuild can be announced more
/// than once; the copy happens only when the target build is not already
/// mapped, which makes retried deliveries idempotent.
async fn handle_build_running(state: &AppState, webhook: &BuildkiteWebhook) {
    let Some(source) = webhook.build.rebuilt_from.as_ref() else {
        debug!(build = webhook.build.number, "build running");
        return;
    };

    let build = BuildId::from(webhook.build.number);
    let source_build = BuildId::from(source.number);

    let copied = {
        let _guard = state.build_lock.acquire().await;
        match state.store.get_by_build(&source_build).await {
            Ok(Some(revision)) => match state.store.get_by_build(&build).await {
                Ok(Some(_)) => None,
                Ok(None) => match state.store.put(&revision, &build).await {
                    Ok(()) => {
                        info!(%build, %source_build, %revision, "detected rebuild");
                        Some(revision)
                    }
                    Err(err) => {
                        error!(%build, error = %err, "failed to record rebuild mapping");
                        None
                    }
                },
                Err(err) => {
                    error!(%build, error = %err, "mapping lookup failed");
                    None
                }
            },
            Ok(None) => {
                info!(%source_build, "unknown source build for rebuild");
                None
            }
            Err(err) => {
                error!(%source_build, error = %err, "mapping lookup failed");
                None
            }
        }
    };

    if let Some(revision) = copied {
        post_vote(
            state,
            ReviewVote {
                revision,
                state: ReviewState::Unverified,
                message: format!("Build Started: {}", build_link(&webhook.build)),
                notify: false,
            },
        )
        .await;
    }
}

/// Reflect a finished build as a vote on the revision it was triggered
/// for. Only the "passed" state verifies; every other terminal state
/// rejects.
async fn handle_build_finished(state: &AppState, webhook: &BuildkiteWebhook) {
    let build = BuildId::from(webhook.build.number);

    let revision = {
        let _guard = state.build_lock.acquire().await;
        match state.store.get_by_build(&build).await {
            Ok(revision) => revision,
            Err(err) => {
                error!(%build, error = %err, "mapping lookup failed");
                return;
            }
        }
    };
    let Some(revision) = revision else {
        info!(%build, "finished build has no mapping");
        return;
    };

    let passed = webhook.build.state.as_deref() == Some("passed");
    let (vote_state, message) = if passed {
        (
            ReviewState::Verified,
            format!("Build Passed: {}", build_link(&webhook.build)),
        )
    } else {
        (
            ReviewState::Rejected,
            format!("Build Failed: {}", build_link(&webhook.build)),
        )
    };

    info!(%build, %revision, passed, "build finished");
    post_vote(
        state,
        ReviewVote {
            revision,
            state: vote_state,
            message,
            notify: true,
        },
    )
    .await;
}

async fn post_vote(state: &AppState, vote: ReviewVote) {
    if let Err(err) = state.reviewer.set_review(&vote).await {
        error!(revision = %vote.revision, error = %err, "failed to set review state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MappingStore;
    use crate::test_support::test_state;
    use gatebot_core::Revision;
    use serde_json::json;

    fn webhook(value: serde_json::Value) -> BuildkiteWebhook {
        serde_json::from_value(value).expect("webhook should decode")
    }

    fn finished(number: u64, build_state: &str) -> BuildkiteWebhook {
        webhook(json!({
            "event": "build.finished",
            "build": {
                "number": number,
                "state": build_state,
                "web_url": format!("https://buildkite.com/acme/widget/builds/{number}"),
                "commit": "deadbeef",
                "branch": "I8f2c9d"
            }
        }))
    }

    fn rebuild_running(number: u64, source: u64) -> BuildkiteWebhook {
        webhook(json!({
            "event": "build.running",
            "build": {
                "number": number,
                "state": "running",
                "web_url": format!("https://buildkite.com/acme/widget/builds/{number}"),
                "commit": "deadbeef",
                "branch": "I8f2c9d",
                "rebuilt_from": {"number": source}
            }
        }))
    }

    #[tokio::test]
    async fn test_finished_passed_posts_verified_vote() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        handle_webhook(&state, &finished(100, "passed")).await;

        let votes = reviewer.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].state, ReviewState::Verified);
        assert_eq!(votes[0].revision, revision);
        assert!(votes[0].message.starts_with("Build Passed: "));
        assert!(votes[0].notify);
    }

    #[tokio::test]
    async fn test_finished_non_passed_posts_rejected_vote() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        for build_state in ["failed", "canceled", "blocked"] {
            handle_webhook(&state, &finished(100, build_state)).await;
        }

        let votes = reviewer.votes.lock().unwrap();
        assert_eq!(votes.len(), 3);
        assert!(votes.iter().all(|v| v.state == ReviewState::Rejected));
    }

    #[tokio::test]
    async fn test_finished_unknown_build_posts_nothing() {
        let (state, _pipeline, reviewer, _store) = test_state(100);

        handle_webhook(&state, &finished(999, "passed")).await;

        assert!(reviewer.votes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_copies_mapping_and_neutralizes_vote() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        handle_webhook(&state, &rebuild_running(101, 100)).await;

        assert_eq!(
            store.get_by_build(&BuildId::from(101)).await.unwrap(),
            Some(revision.clone())
        );
        let votes = reviewer.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].state, ReviewState::Unverified);
        assert!(!votes[0].notify);
    }

    #[tokio::test]
    async fn test_retried_rebuild_delivery_is_idempotent() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        handle_webhook(&state, &rebuild_running(101, 100)).await;
        handle_webhook(&state, &rebuild_running(101, 100)).await;

        // One mapping write, one vote.
        assert_eq!(
            store.get_by_build(&BuildId::from(101)).await.unwrap(),
            Some(revision)
        );
        assert_eq!(reviewer.votes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_of_unknown_source_is_dropped() {
        let (state, _pipeline, reviewer, store) = test_state(100);

        handle_webhook(&state, &rebuild_running(101, 999)).await;

        assert_eq!(store.get_by_build(&BuildId::from(101)).await.unwrap(), None);
        assert!(reviewer.votes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_without_rebuilt_from_does_nothing() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        handle_webhook(
            &state,
            &webhook(json!({
                "event": "build.running",
                "build": {"number": 100, "state": "running",
                           "commit": "deadbeef", "branch": "I8f2c9d"}
            })),
        )
        .await;

        assert!(reviewer.votes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_and_cancelled_are_log_only() {
        let (state, _pipeline, reviewer, store) = test_state(100);
        let revision = Revision::new(1, 42, "deadbeef");
        store.put(&revision, &BuildId::from(100)).await.unwrap();

        for event in ["build.scheduled", "build.cancelled", "build.blocked"] {
            handle_webhook(
                &state,
                &webhook(json!({
                    "event": event,
                    "build": {"number": 100, "commit": "deadbeef", "branch": "I8f2c9d"}
                })),
            )
            .await;
        }

        assert!(reviewer.votes.lock().unwrap().is_empty());
    }

    mod endpoint {
        use super::*;

        fn endpoint_with_queue(
            depth: usize,
        ) -> (Arc<WebhookEndpoint>, mpsc::Receiver<BuildkiteWebhook>) {
            let (queue, deliveries) = mpsc::channel(depth);
            (
                Arc::new(WebhookEndpoint {
                    token: "hunter2".to_string(),
                    queue,
                }),
                deliveries,
            )
        }

        fn token_headers(token: &str) -> HeaderMap {
            let mut headers = HeaderMap::new();
            headers.insert("X-Buildkite-Token", token.parse().unwrap());
            headers
        }

        fn body() -> Bytes {
            Bytes::from(
                serde_json::to_vec(&json!({
                    "event": "build.finished",
                    "build": {"number": 100, "state": "passed",
                               "commit": "deadbeef", "branch": "I8f2c9d"}
                }))
                .unwrap(),
            )
        }

        #[tokio::test]
        async fn test_missing_token_is_unauthorized() {
            let (endpoint, mut deliveries) = endpoint_with_queue(16);

            let status =
                receive_webhook(State(endpoint), HeaderMap::new(), body()).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(deliveries.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_wrong_token_is_unauthorized() {
            let (endpoint, mut deliveries) = endpoint_with_queue(16);

            let status =
                receive_webhook(State(endpoint), token_headers("wrong"), body()).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(deliveries.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_undecodable_body_is_bad_request() {
            let (endpoint, mut deliveries) = endpoint_with_queue(16);

            let status = receive_webhook(
                State(endpoint),
                token_headers("hunter2"),
                Bytes::from_static(b"not json"),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(deliveries.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_accepted_event_is_queued() {
            let (endpoint, mut deliveries) = endpoint_with_queue(16);

            let status =
                receive_webhook(State(endpoint), token_headers("hunter2"), body()).await;
            assert_eq!(status, StatusCode::OK);

            let delivered = deliveries.try_recv().expect("event queued");
            assert_eq!(delivered.event, "build.finished");
            assert_eq!(delivered.build.number, 100);
        }
    }
}
