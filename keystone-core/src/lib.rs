//! KEYSTONE Core - Entity Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types - no business logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod error;
pub mod event;

pub use error::{
    KeystoneError, KeystoneResult, MigrationError, StorageError, ValidationError,
};
pub use event::{ChangeRecord, SettingsEventKind};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Row identifier using UUIDv7 for timestamp-sortable IDs.
pub type RowId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// A setting's string key. Logical identity of a [`SettingEntry`].
pub type FieldKey = String;

/// Maximum length of a setting field key, matching the column bound of the
/// backing table.
pub const FIELD_KEY_MAX_LEN: usize = 99;

/// Generate a new UUIDv7 RowId (timestamp-sortable).
pub fn new_row_id() -> RowId {
    Uuid::now_v7()
}

// ============================================================================
// SETTING ENTRY
// ============================================================================

/// One persisted configuration row.
///
/// `field` is the globally unique logical key; `id` is the physical row
/// identity assigned by the store. `updated_at` is set by the store on every
/// write and is monotonically non-decreasing per field, which is what makes
/// it usable as a polling watermark bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub id: RowId,
    pub field: FieldKey,
    pub value: Value,
    pub comment: Option<String>,
    pub updated_at: Timestamp,
}

impl SettingEntry {
    /// Construct an entry with a fresh row id and the given timestamp.
    pub fn new(field: impl Into<FieldKey>, value: Value, updated_at: Timestamp) -> Self {
        Self {
            id: new_row_id(),
            field: field.into(),
            value,
            comment: None,
            updated_at,
        }
    }
}

// ============================================================================
// MIGRATION RECORD
// ============================================================================

/// One row per successfully applied migration unit.
///
/// `name` appears at most once in the ledger; once recorded the unit is
/// never re-applied by this process or any later one reading the same store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub name: String,
    pub applied_at: Timestamp,
}

impl MigrationRecord {
    pub fn new(name: impl Into<String>, applied_at: Timestamp) -> Self {
        Self {
            name: name.into(),
            applied_at,
        }
    }
}

// ============================================================================
// CACHE SLOTS
// ============================================================================

/// The in-memory state of one setting key.
///
/// `Absent` means "looked up, confirmed missing at that time" and is distinct
/// from the key having no slot at all. The distinction is what lets repeated
/// misses be served from memory instead of re-querying the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheSlot {
    /// Last-known persisted entry.
    Present(SettingEntry),
    /// Confirmed absent at lookup time (negative cache entry).
    Absent,
}

impl CacheSlot {
    /// The cached value, or None for the negative marker.
    pub fn value(&self) -> Option<&Value> {
        match self {
            CacheSlot::Present(entry) => Some(&entry.value),
            CacheSlot::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, CacheSlot::Present(_))
    }
}

/// A cached wildcard lookup: suffix -> value for every key sharing a prefix.
///
/// Built from one prefix scan and invalidated as a unit whenever any write
/// lands under the prefix; never partially updated. An empty map is a valid
/// cached result, not a miss.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WildcardSlot {
    pub entries: BTreeMap<String, Value>,
}

impl WildcardSlot {
    pub fn new(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// USAGE SNAPSHOT
// ============================================================================

/// Observability snapshot reported by the settings cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Reporting module name.
    pub module: String,
    /// Number of populated point slots.
    pub count: usize,
}

// ============================================================================
// TESTS
// ============================================================================
