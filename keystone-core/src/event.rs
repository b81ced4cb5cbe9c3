//! Settings Change Events
//!
//! This module defines the event types dispatched by the settings cache
//! whenever a value changes, whether through a local write or a change
//! discovered by the polling loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observed change to a setting.
///
/// `before` is the value the cache held when the change was observed (None
/// when the key was uncached or confirmed absent); `after` is the value the
/// row carries now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub field: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeRecord {
    pub fn new(field: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            field: field.into(),
            before,
            after,
        }
    }
}

/// The event names the settings cache publishes.
///
/// Every dispatch carries an ordered batch of [`ChangeRecord`]s. All
/// listeners for one name are awaited before the publishing call returns,
/// preserving per-name ordering relative to later dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsEventKind {
    /// A previously unknown key was written for the first time.
    Created,
    /// A key was written locally via `set`.
    Set,
    /// A key changed, locally via `update` or discovered by polling.
    Modified,
    /// Changes were discovered by the polling loop.
    Updated,
    /// A full reload re-read every persisted row.
    Read,
}

impl SettingsEventKind {
    /// The wire name for this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsEventKind::Created => "configuration.created",
            SettingsEventKind::Set => "configuration.set",
            SettingsEventKind::Modified => "configuration.modified",
            SettingsEventKind::Updated => "configuration.updated",
            SettingsEventKind::Read => "configuration.read",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "configuration.created" => Some(SettingsEventKind::Created),
            "configuration.set" => Some(SettingsEventKind::Set),
            "configuration.modified" => Some(SettingsEventKind::Modified),
            "configuration.updated" => Some(SettingsEventKind::Updated),
            "configuration.read" => Some(SettingsEventKind::Read),
            _ => None,
        }
    }

    /// Whether a looped-back event of this kind must invalidate wildcard
    /// slots under the changed fields.
    pub fn invalidates_wildcards(&self) -> bool {
        matches!(self, SettingsEventKind::Set | SettingsEventKind::Modified)
    }
}
