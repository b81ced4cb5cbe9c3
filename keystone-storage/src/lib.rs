//! KEYSTONE Storage - Storage Traits and Mock Implementation
//!
//! Defines the narrow storage abstraction consumed by the migration runner
//! and the settings cache. Production backends live elsewhere; this crate
//! ships the contracts plus an in-memory mock for tests and the
//! non-durable deployment mode.

pub mod mock;

pub use mock::MockStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{KeystoneResult, MigrationRecord, SettingEntry};
use serde_json::Value;

// ============================================================================
// SETTINGS STORE
// ============================================================================

/// Point, prefix and range access to the settings relation.
///
/// Implementations must surface the schema-not-ready condition as
/// [`keystone_core::StorageError::RelationMissing`] so callers can
/// distinguish the startup race from real query failures.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Point lookup by exact field key.
    async fn get_by_field(&self, field: &str) -> KeystoneResult<Option<SettingEntry>>;

    /// Case-insensitive "starts with" scan over field keys.
    async fn scan_prefix(&self, prefix: &str) -> KeystoneResult<Vec<SettingEntry>>;

    /// All rows with `updated_at` strictly greater than the watermark,
    /// ordered ascending by `updated_at`.
    async fn changed_since(
        &self,
        watermark: DateTime<Utc>,
    ) -> KeystoneResult<Vec<SettingEntry>>;

    /// Insert a new row for a previously unknown field. The store assigns
    /// the row id and `updated_at`.
    async fn insert(
        &self,
        field: &str,
        value: Value,
        comment: Option<String>,
    ) -> KeystoneResult<SettingEntry>;

    /// In-place update of an existing row's value, bumping `updated_at`.
    async fn update_value(&self, field: &str, value: Value) -> KeystoneResult<SettingEntry>;

    /// Replace an existing field with a fresh row (new row id, new
    /// `updated_at`). Backs the settings cache's `update` operation, which
    /// deliberately writes a new row rather than mutating in place.
    async fn insert_row(&self, field: &str, value: Value) -> KeystoneResult<SettingEntry>;

    /// Whether writes survive process restart. The migration runner skips
    /// schema sync entirely for non-durable backends.
    fn is_durable(&self) -> bool;
}

// ============================================================================
// MIGRATION LEDGER
// ============================================================================

/// The durable record of which migration units have already run.
///
/// `record_applied` must be atomic with its uniqueness check (a unique-key
/// insert that fails on a duplicate name). That constraint is what protects
/// two separate processes racing at startup; the runner's in-process guard
/// only serializes within one process.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Names of every recorded migration, in application order.
    async fn applied_names(&self) -> KeystoneResult<Vec<String>>;

    /// Durably record a successful unit. Fails with
    /// [`keystone_core::StorageError::DuplicateMigration`] if the name is
    /// already present.
    async fn record_applied(&self, name: &str) -> KeystoneResult<MigrationRecord>;

    /// Remove a recorded name. Rollback bookkeeping only; never called at
    /// boot.
    async fn remove_applied(&self, name: &str) -> KeystoneResult<()>;
}

// ============================================================================
// SCHEMA EXECUTOR
// ============================================================================

/// Transactional DDL/DML execution context handed to migration units.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    /// Execute one DDL/DML statement inside the migration transaction.
    async fn execute(&self, statement: &str) -> KeystoneResult<()>;
}

// ============================================================================
// FULL BACKEND
// ============================================================================

/// The complete storage surface a deployment wires in: settings access,
/// the migration ledger, and DDL execution against one store.
pub trait StorageBackend: SettingsStore + MigrationLedger + SchemaExecutor {}

impl<T: SettingsStore + MigrationLedger + SchemaExecutor> StorageBackend for T {}
