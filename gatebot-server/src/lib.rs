pub mod buildkite;
pub mod config;
pub mod handlers;
pub mod review;
pub mod store;
pub mod stream;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use crate::buildkite::BuildPipeline;
use crate::handlers::BuildLock;
use crate::review::ReviewWriter;
use crate::store::MappingStore;

/// Shared dependencies of the two ingress paths (the event stream and the
/// webhook dispatcher).
pub struct AppState {
    /// Gerrit project events must belong to.
    pub project: String,
    pub pipeline: Arc<dyn BuildPipeline>,
    pub store: Arc<dyn MappingStore>,
    pub reviewer: Arc<dyn ReviewWriter>,
    pub build_lock: BuildLock,
}
