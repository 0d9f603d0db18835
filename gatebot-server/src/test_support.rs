//! Shared mocks for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use gatebot_core::{BuildId, GerritEvent, ReviewVote};

use crate::buildkite::{
    BuildPipeline, CancelOutcome, CreateBuild, CreatedBuild, TriggerError,
};
use crate::handlers::BuildLock;
use crate::review::{ReviewError, ReviewWriter};
use crate::store::InMemoryMappingStore;
use crate::AppState;

/// Pipeline that records calls and hands out sequential build numbers.
pub(crate) struct MockPipeline {
    pub created: Mutex<Vec<CreateBuild>>,
    pub cancelled: Mutex<Vec<BuildId>>,
    pub fail_create: AtomicBool,
    pub fail_cancel: AtomicBool,
    next_number: AtomicU64,
}

impl MockPipeline {
    pub fn new(first_number: u64) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
            next_number: AtomicU64::new(first_number),
        }
    }
}

#[async_trait]
impl BuildPipeline for MockPipeline {
    async fn create_build(&self, build: &CreateBuild) -> Result<CreatedBuild, TriggerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TriggerError::Api {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "buildkite is sad".to_string(),
            });
        }
        self.created.lock().unwrap().push(build.clone());
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedBuild {
            id: BuildId::from(number),
            web_url: format!("https://buildkite.com/acme/widget/builds/{number}"),
        })
    }

    async fn cancel_build(&self, build: &BuildId) -> Result<CancelOutcome, TriggerError> {
        self.cancelled.lock().unwrap().push(build.clone());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(TriggerError::Timeout);
        }
        Ok(CancelOutcome::Cancelled)
    }
}

/// Reviewer that records every vote it is asked to post.
#[derive(Default)]
pub(crate) struct MockReviewer {
    pub votes: Mutex<Vec<ReviewVote>>,
}

#[async_trait]
impl ReviewWriter for MockReviewer {
    async fn set_review(&self, vote: &ReviewVote) -> Result<(), ReviewError> {
        self.votes.lock().unwrap().push(vote.clone());
        Ok(())
    }
}

/// App state wired to mocks, plus handles onto the mocks for assertions.
pub(crate) fn test_state(
    first_build_number: u64,
) -> (
    Arc<AppState>,
    Arc<MockPipeline>,
    Arc<MockReviewer>,
    Arc<InMemoryMappingStore>,
) {
    let pipeline = Arc::new(MockPipeline::new(first_build_number));
    let reviewer = Arc::new(MockReviewer::default());
    let store = Arc::new(InMemoryMappingStore::new());

    let state = Arc::new(AppState {
        project: "tools/widget".to_string(),
        pipeline: pipeline.clone(),
        store: store.clone(),
        reviewer: reviewer.clone(),
        build_lock: BuildLock::new(),
    });

    (state, pipeline, reviewer, store)
}

/// JSON body of a patchset-created event as Gerrit emits it.
pub(crate) fn patchset_event_json(patch: u64, change: u64, sha: &str) -> serde_json::Value {
    json!({
        "type": "patchset-created",
        "project": "tools/widget",
        "change": {
            "project": "tools/widget",
            "branch": "main",
            "id": "I8f2c9d",
            "number": change,
            "subject": "Add widget"
        },
        "patchSet": {
            "number": patch,
            "revision": sha,
            "uploader": {"name": "A. Dev", "email": "dev@example.com"},
            "author": {"name": "A. Dev", "email": "dev@example.com"}
        },
        "eventCreatedOn": 1700000000
    })
}

pub(crate) fn patchset_event(patch: u64, change: u64, sha: &str) -> GerritEvent {
    serde_json::from_value(patchset_event_json(patch, change, sha))
        .expect("event should decode")
}
