//! UI commands and their outcomes.

use serde::{Deserialize, Serialize};

/// A command emitted by the UI. Ids are raw tokens as exposed by the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Create { text: String },
    ToggleCompleteAll,
    UndoComplete { id: String },
    Complete { id: String },
    UpdateText { id: String, text: String },
    Destroy { id: String },
    DestroyCompleted,
    /// Any kind this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl Command {
    /// Parse a JSON command such as `{"kind":"COMPLETE","id":"abc"}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Create { .. } => "CREATE",
            Command::ToggleCompleteAll => "TOGGLE_COMPLETE_ALL",
            Command::UndoComplete { .. } => "UNDO_COMPLETE",
            Command::Complete { .. } => "COMPLETE",
            Command::UpdateText { .. } => "UPDATE_TEXT",
            Command::Destroy { .. } => "DESTROY",
            Command::DestroyCompleted => "DESTROY_COMPLETED",
            Command::Unknown => "UNKNOWN",
        }
    }
}

/// Result of one handler processing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Accepted but nothing to do (unknown kind, missing id, unchanged value).
    NoOp,
    Rejected(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandOutcome::Rejected(_))
    }
}
