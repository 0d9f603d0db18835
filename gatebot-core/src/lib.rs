//! Domain types shared by the gatebot daemon: the Gerrit event model, the
//! comment-command table, and revision/build identity types.

pub mod command;
pub mod event;
pub mod revision;

pub use command::{parse_comment, Command};
pub use event::{Account, Change, GerritEvent, PatchSet, RefUpdate};
pub use revision::{BuildId, ReviewState, ReviewVote, Revision};
