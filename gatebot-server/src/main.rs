use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};

use gatebot_server::buildkite::BuildkiteClient;
use gatebot_server::config::Config;
use gatebot_server::handlers::BuildLock;
use gatebot_server::review::GerritSshReviewer;
use gatebot_server::store::SqliteMappingStore;
use gatebot_server::stream::{SshEventSource, StreamSupervisor};
use gatebot_server::webhook::{run_dispatcher, webhook_router, WEBHOOK_QUEUE_DEPTH};
use gatebot_server::AppState;

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "gatebot"
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting gatebot");

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_path = config.state_dir.join("gatebot.db");
    info!("Using state database: {}", db_path.display());
    let store = SqliteMappingStore::open(&db_path)
        .context("Failed to initialize SQLite database")?;

    let pipeline = BuildkiteClient::new(
        &config.buildkite_api_url,
        &config.buildkite_org_slug,
        &config.buildkite_pipeline_slug,
        &config.buildkite_api_token,
    )
    .context("Failed to create Buildkite client")?;

    let reviewer = GerritSshReviewer::new(
        &config.gerrit_user,
        &config.gerrit_host,
        config.gerrit_port,
        &config.gerrit_ssh_key_path,
    );

    let state = Arc::new(AppState {
        project: config.gerrit_project.clone(),
        pipeline: Arc::new(pipeline),
        store: Arc::new(store),
        reviewer: Arc::new(reviewer),
        build_lock: BuildLock::new(),
    });

    if config.webhook_enabled {
        let token = config
            .buildkite_webhook_token
            .clone()
            .context("BUILDKITE_WEBHOOK_TOKEN must be set when the webhook path is enabled")?;

        let (queue, deliveries) = mpsc::channel(WEBHOOK_QUEUE_DEPTH);

        let dispatcher_state = state.clone();
        tokio::spawn(async move {
            run_dispatcher(dispatcher_state, deliveries).await;
        });

        let app = Router::new()
            .route("/health", get(health_check))
            .merge(webhook_router(token, queue))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
        info!("Webhook server listening on port {}", config.port);
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "webhook server failed");
            }
        });
    } else {
        info!("Webhook path disabled; build outcomes will not be reflected to Gerrit");
    }

    let source = SshEventSource::new(
        &config.gerrit_user,
        &config.gerrit_host,
        config.gerrit_port,
        &config.gerrit_ssh_key_path,
    );
    let supervisor = StreamSupervisor::new(Box::new(source), config.reconnect_policy);

    info!("Listening for Gerrit events");
    supervisor.run(state).await;

    Ok(())
}
