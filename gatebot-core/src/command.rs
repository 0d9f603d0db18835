//! Command parsing for review comments.

use std::fmt;

/// A command recognized in a review comment body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-trigger the current revision's build.
    Retest,
}

impl Command {
    /// Whether a comment body carries this command.
    ///
    /// A command occupies a whole line of the comment: the line must equal
    /// the command word case-insensitively, with no other characters on it.
    /// The word as a substring of a longer line, or with inline leading or
    /// trailing whitespace, does not count; a bare command line inside a
    /// larger multi-line comment does.
    fn matches(&self, body: &str) -> bool {
        match self {
            Command::Retest => body.lines().any(|line| line.eq_ignore_ascii_case("retest")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Retest => write!(f, "retest"),
        }
    }
}

/// The command table, in evaluation order. First match wins; the order is
/// fixed so growing the table can never make dispatch nondeterministic.
pub const COMMANDS: &[Command] = &[Command::Retest];

/// Scan a comment body against the command table.
///
/// Returns the first command whose pattern matches, or None. Only one
/// command is expected to match any given comment.
pub fn parse_comment(body: &str) -> Option<Command> {
    COMMANDS.iter().copied().find(|command| command.matches(body))
}
