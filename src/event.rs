// src/event.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of filesystem change reported by the watcher.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Create => "CREATE",
            ChangeKind::Write => "WRITE",
            ChangeKind::Remove => "REMOVE",
            ChangeKind::Rename => "RENAME",
        };
        f.write_str(s)
    }
}

/// A change notification that triggers a rebuild.
///
/// The build loop does not look at the payload; it is carried for logging.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The path of the file or directory affected by the event.
    pub path: String,
    /// The operation performed.
    pub op: ChangeKind,
}

/// Message pushed to connected browsers over the reload websocket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadMessage {
    /// Reload the pages matching `path`. `"*"` means every page.
    Reload { path: String },
}
