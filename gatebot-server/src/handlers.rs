//! Routing and business rules for Gerrit stream events.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use gatebot_core::{
    parse_comment, Command, GerritEvent, ReviewState, ReviewVote, Revision,
};

use crate::buildkite::{BuildAuthor, CreateBuild, CreatedBuild, TriggerError};
use crate::review::ReviewError;
use crate::store::StoreError;
use crate::AppState;

/// Serializes "trigger build + persist mapping" as one unit.
///
/// Buildkite can deliver a build.running webhook before the create call
/// has returned locally. The webhook dispatcher takes this same lock
/// before resolving mappings, so it cannot observe a build whose mapping
/// has not been written yet and misreport it as unknown.
///
/// The lock is scoped to exactly that: it is never held across review
/// annotation or cancellation round-trips.
pub struct BuildLock(Mutex<()>);

impl BuildLock {
    pub fn new() -> Self {
        BuildLock(Mutex::new(()))
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

impl Default for BuildLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("event is missing its {0} payload")]
    MalformedEvent(&'static str),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Review(#[from] ReviewError),
}

/// Per-event result captured at the dispatch boundary. One bad event can
/// never take down the dispatch task; the caller logs the outcome and
/// moves on to the next event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The event was handled to completion.
    Handled,
    /// The event was recognized but deliberately not acted on.
    Skipped(&'static str),
    /// No handler is registered for this event type. Normal traffic: the
    /// stream emits many types irrelevant to CI.
    NoHandler,
    /// The handler failed.
    Failed(HandlerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PatchsetCreated,
    RefUpdated,
    CommentAdded,
}

/// Map an event type string to its handler.
pub fn route(event_type: &str) -> Option<EventKind> {
    match event_type {
        "patchset-created" => Some(EventKind::PatchsetCreated),
        "ref-updated" => Some(EventKind::RefUpdated),
        "comment-added" => Some(EventKind::CommentAdded),
        _ => None,
    }
}

/// Route and run one stream event, capturing the handler's result.
pub async fn dispatch(state: &AppState, event: &GerritEvent) -> DispatchOutcome {
    let Some(kind) = route(&event.event_type) else {
        return DispatchOutcome::NoHandler;
    };

    let result = match kind {
        EventKind::PatchsetCreated => handle_patchset_created(state, event).await,
        EventKind::RefUpdated => handle_ref_updated(state, event).await,
        EventKind::CommentAdded => handle_comment_added(state, event).await,
    };

    match result {
        Ok(outcome) => outcome,
        Err(err) => DispatchOutcome::Failed(err),
    }
}

fn event_matches_project(state: &AppState, event: &GerritEvent) -> bool {
    event.project() == Some(state.project.as_str())
}

fn build_author(event: &GerritEvent) -> BuildAuthor {
    let account = event.build_author();
    BuildAuthor {
        name: account
            .and_then(|a| a.name.clone())
            .unwrap_or_default(),
        email: account
            .and_then(|a| a.email.clone())
            .unwrap_or_default(),
    }
}

/// A new patchset supersedes its predecessor: best-effort cancel of the
/// previous build, then trigger and record a build for this revision.
async fn handle_patchset_created(
    state: &AppState,
    event: &GerritEvent,
) -> Result<DispatchOutcome, HandlerError> {
    if !event_matches_project(state, event) {
        debug!(project = ?event.project(), "ignoring event for other project");
        return Ok(DispatchOutcome::Skipped("other project"));
    }
    let revision = event
        .revision()
        .ok_or(HandlerError::MalformedEvent("change/patchSet"))?;

    info!(%revision, sha = %revision.sha, "patchset created");

    cancel_superseded(state, &revision).await;

    let created = trigger_and_record(state, event, &revision).await?;
    announce_build_started(state, &revision, &created).await;
    Ok(DispatchOutcome::Handled)
}

/// Best-effort cancellation of the previous patchset's build.
///
/// A stale build finishing late is acceptable; a new build not being
/// triggered is not. Every failure here is logged and swallowed so the
/// trigger path always runs.
async fn cancel_superseded(state: &AppState, revision: &Revision) {
    let Some((prev_patch, change)) = revision.predecessor() else {
        return;
    };

    match state.store.get_by_revision(prev_patch, change).await {
        Ok(Some(build)) => {
            info!(%build, prev_patch, change, "cancelling superseded build");
            match state.pipeline.cancel_build(&build).await {
                Ok(outcome) => debug!(%build, ?outcome, "cancellation finished"),
                Err(err) => {
                    warn!(%build, error = %err, "failed to cancel superseded build");
                }
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(prev_patch, change, error = %err, "failed to look up previous build");
        }
    }
}

/// Create a build for `revision` and persist the mapping, held together
/// under the build lock (see [`BuildLock`]).
///
/// If the trigger fails nothing is written: there is no build record for
/// a build that was never accepted.
async fn trigger_and_record(
    state: &AppState,
    event: &GerritEvent,
    revision: &Revision,
) -> Result<CreatedBuild, HandlerError> {
    let change = event
        .change
        .as_ref()
        .ok_or(HandlerError::MalformedEvent("change"))?;

    let mut env = HashMap::new();
    env.insert(
        "GERRIT_CHANGE_NUMBER".to_string(),
        revision.change_number.to_string(),
    );
    env.insert(
        "GERRIT_PATCH_NUMBER".to_string(),
        revision.patch_number.to_string(),
    );

    let request = CreateBuild {
        commit: revision.sha.clone(),
        branch: change.id.clone(),
        author: build_author(event),
        env,
    };

    let _guard = state.build_lock.acquire().await;
    let created = state.pipeline.create_build(&request).await?;
    state.store.put(revision, &created.id).await?;
    info!(build = %created.id, %revision, "build scheduled");
    Ok(created)
}

/// Post the build link as an Unverified vote, clearing any earlier vote
/// on the revision. Best-effort, runs after the build lock is released;
/// notification email is suppressed to cut per-build spam.
async fn announce_build_started(state: &AppState, revision: &Revision, created: &CreatedBuild) {
    let vote = ReviewVote {
        revision: revision.clone(),
        state: ReviewState::Unverified,
        message: format!("Build Started: {}", created.web_url),
        notify: false,
    };
    if let Err(err) = state.reviewer.set_review(&vote).await {
        warn!(%revision, error = %err, "failed to post build-started vote");
    }
}

/// Trunk merges get a branch build with no revision attached: the mapping
/// store is not involved and no vote is ever posted for them.
async fn handle_ref_updated(
    state: &AppState,
    event: &GerritEvent,
) -> Result<DispatchOutcome, HandlerError> {
    let ref_update = event
        .ref_update
        .as_ref()
        .ok_or(HandlerError::MalformedEvent("refUpdate"))?;

    if !event_matches_project(state, event) {
        return Ok(DispatchOutcome::Skipped("other project"));
    }

    let branch = match ref_update.ref_name.as_str() {
        "refs/heads/master" => "master",
        "refs/heads/main" => "main",
        _ => {
            debug!(ref_name = %ref_update.ref_name, "ignoring non-trunk ref update");
            return Ok(DispatchOutcome::Skipped("not a trunk ref"));
        }
    };

    let commit = ref_update
        .new_rev
        .clone()
        .ok_or(HandlerError::MalformedEvent("refUpdate.newRev"))?;

    let submitter = event.submitter.as_ref();
    let request = CreateBuild {
        commit,
        branch: branch.to_string(),
        author: BuildAuthor {
            name: submitter
                .and_then(|a| a.name.clone())
                .unwrap_or_default(),
            email: submitter
                .and_then(|a| a.email.clone())
                .unwrap_or_default(),
        },
        env: HashMap::new(),
    };

    let created = state.pipeline.create_build(&request).await?;
    info!(build = %created.id, branch, "trunk build scheduled");
    Ok(DispatchOutcome::Handled)
}

/// Scan the comment against the command table; a retest re-triggers the
/// current revision only. Previous patchsets are left alone, nothing is
/// cancelled.
async fn handle_comment_added(
    state: &AppState,
    event: &GerritEvent,
) -> Result<DispatchOutcome, HandlerError> {
    if !event_matches_project(state, event) {
        return Ok(DispatchOutcome::Skipped("other project"));
    }
    let Some(comment) = event.comment.as_deref() else {
        return Ok(DispatchOutcome::Skipped("no comment body"));
    };

    match parse_comment(comment) {
        Some(Command::Retest) => {
            let revision = event
                .revision()
                .ok_or(HandlerError::MalformedEvent("change/patchSet"))?;
            info!(%revision, "retest requested");

            let created = trigger_and_record(state, event, &revision).await?;
            announce_build_started(state, &revision, &created).await;
            Ok(DispatchOutcome::Handled)
        }
        None => {
            debug!("no command found in comment");
            Ok(DispatchOutcome::Skipped("no command in comment"))
        }
    }
}
