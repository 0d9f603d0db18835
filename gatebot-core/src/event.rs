//! Serde model of the Gerrit event stream.
//!
//! Events arrive as one JSON object per line with a `type` discriminator.
//! The stream carries many event types this daemon never acts on, and
//! Gerrit adds fields across versions, so every payload field is optional
//! and unknown fields are ignored rather than rejected: a strict decode
//! here would tear down the stream on the first unmodelled field.

use serde::Deserialize;

use crate::revision::Revision;

/// A Gerrit account as it appears in event payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
}

/// One patchset of a change.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    pub number: u64,
    pub revision: String,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    pub uploader: Option<Account>,
    pub author: Option<Account>,
}

/// The change a patchset belongs to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub project: Option<String>,
    pub branch: Option<String>,
    /// The Change-Id string, stable across patchsets.
    pub id: String,
    pub number: u64,
    pub subject: Option<String>,
    pub owner: Option<Account>,
    pub url: Option<String>,
}

/// A ref having moved, e.g. a merge to the trunk branch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    pub old_rev: Option<String>,
    pub new_rev: Option<String>,
    pub ref_name: String,
    pub project: Option<String>,
}

/// One event from `gerrit stream-events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GerritEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub project: Option<String>,
    pub change: Option<Change>,
    pub patch_set: Option<PatchSet>,
    pub comment: Option<String>,
    pub ref_update: Option<RefUpdate>,
    pub uploader: Option<Account>,
    pub submitter: Option<Account>,
}

impl GerritEvent {
    /// The revision this event names, when it names one.
    pub fn revision(&self) -> Option<Revision> {
        let change = self.change.as_ref()?;
        let patch_set = self.patch_set.as_ref()?;
        Some(Revision::new(
            patch_set.number,
            change.number,
            patch_set.revision.clone(),
        ))
    }

    /// Author identity to attribute a triggered build to: the patchset
    /// author, falling back to the uploader at either level.
    pub fn build_author(&self) -> Option<&Account> {
        let patch_set = self.patch_set.as_ref();
        patch_set
            .and_then(|ps| ps.author.as_ref())
            .or_else(|| patch_set.and_then(|ps| ps.uploader.as_ref()))
            .or(self.uploader.as_ref())
    }

    /// The project an event belongs to. Patchset and comment events carry
    /// it both at the top level and inside the change; ref events carry it
    /// inside the ref update.
    pub fn project(&self) -> Option<&str> {
        self.project
            .as_deref()
            .or_else(|| self.change.as_ref().and_then(|c| c.project.as_deref()))
            .or_else(|| self.ref_update.as_ref().and_then(|r| r.project.as_deref()))
    }
}
