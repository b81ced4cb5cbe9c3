//! In-memory mock store for testing and the non-durable deployment mode.
//!
//! Implements every storage trait against `HashMap`s, with the test hooks
//! the cache and runner suites need: a read-query counter for negative
//! caching assertions, a toggle simulating the relation-not-yet-created
//! startup race, and a strictly monotonic logical clock so `updated_at`
//! ordering is deterministic.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keystone_core::{
    new_row_id, KeystoneResult, MigrationRecord, SettingEntry, StorageError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::{MigrationLedger, SchemaExecutor, SettingsStore};

/// In-memory mock storage.
#[derive(Debug, Default)]
pub struct MockStore {
    settings: RwLock<HashMap<String, SettingEntry>>,
    applied: RwLock<Vec<MigrationRecord>>,
    executed_ddl: RwLock<Vec<String>>,
    /// Last timestamp handed out; writes always get a strictly later one.
    clock: Mutex<Option<DateTime<Utc>>>,
    /// When set, reads fail as if the settings relation did not exist yet.
    relation_missing: AtomicBool,
    /// Statement substring that makes [`SchemaExecutor::execute`] fail.
    fail_ddl_containing: Mutex<Option<String>>,
    /// Count of point and prefix read queries issued against the store.
    read_queries: AtomicU64,
    ephemeral: bool,
}

impl MockStore {
    /// Create a durable mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a non-durable mock store. The migration runner skips schema
    /// sync against this mode.
    pub fn ephemeral() -> Self {
        Self {
            ephemeral: true,
            ..Self::default()
        }
    }

    /// Number of point/prefix read queries the store has served.
    pub fn query_count(&self) -> u64 {
        self.read_queries.load(Ordering::SeqCst)
    }

    /// Simulate the settings relation not existing yet.
    pub fn set_relation_missing(&self, missing: bool) {
        self.relation_missing.store(missing, Ordering::SeqCst);
    }

    /// Make [`SchemaExecutor::execute`] fail for statements containing the
    /// given marker.
    pub fn fail_ddl_containing(&self, marker: impl Into<String>) {
        *self.fail_ddl_containing.lock().unwrap() = Some(marker.into());
    }

    /// Stop injecting DDL failures.
    pub fn clear_ddl_failure(&self) {
        *self.fail_ddl_containing.lock().unwrap() = None;
    }

    /// Every statement executed through the schema executor, in order.
    pub async fn executed_ddl(&self) -> Vec<String> {
        self.executed_ddl.read().await.clone()
    }

    /// Number of persisted settings rows.
    pub async fn setting_count(&self) -> usize {
        self.settings.read().await.len()
    }

    /// Next timestamp from the logical clock, strictly later than every one
    /// handed out before. Keeps `updated_at` ordering unambiguous even when
    /// two writes land within the wall clock's resolution.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        let now = Utc::now();
        let next = match *clock {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        *clock = Some(next);
        next
    }

    fn check_relation(&self) -> KeystoneResult<()> {
        if self.relation_missing.load(Ordering::SeqCst) {
            return Err(StorageError::RelationMissing {
                relation: "settings".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MockStore {
    async fn get_by_field(&self, field: &str) -> KeystoneResult<Option<SettingEntry>> {
        self.read_queries.fetch_add(1, Ordering::SeqCst);
        self.check_relation()?;
        let settings = self.settings.read().await;
        Ok(settings.get(field).cloned())
    }

    async fn scan_prefix(&self, prefix: &str) -> KeystoneResult<Vec<SettingEntry>> {
        self.read_queries.fetch_add(1, Ordering::SeqCst);
        self.check_relation()?;
        let needle = prefix.to_lowercase();
        let settings = self.settings.read().await;
        let mut matched: Vec<SettingEntry> = settings
            .values()
            .filter(|e| e.field.to_lowercase().starts_with(&needle))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.field.cmp(&b.field));
        Ok(matched)
    }

    async fn changed_since(
        &self,
        watermark: DateTime<Utc>,
    ) -> KeystoneResult<Vec<SettingEntry>> {
        self.check_relation()?;
        let settings = self.settings.read().await;
        let mut changed: Vec<SettingEntry> = settings
            .values()
            .filter(|e| e.updated_at > watermark)
            .cloned()
            .collect();
        changed.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.field.cmp(&b.field))
        });
        Ok(changed)
    }

    async fn insert(
        &self,
        field: &str,
        value: Value,
        comment: Option<String>,
    ) -> KeystoneResult<SettingEntry> {
        let mut settings = self.settings.write().await;
        if settings.contains_key(field) {
            return Err(StorageError::QueryFailed {
                reason: format!("duplicate field: {field}"),
            }
            .into());
        }
        let entry = SettingEntry {
            id: new_row_id(),
            field: field.to_string(),
            value,
            comment,
            updated_at: self.next_timestamp(),
        };
        settings.insert(field.to_string(), entry.clone());
        Ok(entry)
    }

    async fn update_value(&self, field: &str, value: Value) -> KeystoneResult<SettingEntry> {
        let mut settings = self.settings.write().await;
        let entry = settings
            .get_mut(field)
            .ok_or_else(|| StorageError::NotFound {
                field: field.to_string(),
            })?;
        entry.value = value;
        entry.updated_at = self.next_timestamp();
        Ok(entry.clone())
    }

    async fn insert_row(&self, field: &str, value: Value) -> KeystoneResult<SettingEntry> {
        let mut settings = self.settings.write().await;
        let existing = settings
            .get(field)
            .ok_or_else(|| StorageError::NotFound {
                field: field.to_string(),
            })?;
        // A fresh physical row for the same logical key: new id, new
        // updated_at, comment carried over.
        let entry = SettingEntry {
            id: new_row_id(),
            field: field.to_string(),
            value,
            comment: existing.comment.clone(),
            updated_at: self.next_timestamp(),
        };
        settings.insert(field.to_string(), entry.clone());
        Ok(entry)
    }

    fn is_durable(&self) -> bool {
        !self.ephemeral
    }
}

#[async_trait]
impl MigrationLedger for MockStore {
    async fn applied_names(&self) -> KeystoneResult<Vec<String>> {
        let applied = self.applied.read().await;
        Ok(applied.iter().map(|r| r.name.clone()).collect())
    }

    async fn record_applied(&self, name: &str) -> KeystoneResult<MigrationRecord> {
        let mut applied = self.applied.write().await;
        if applied.iter().any(|r| r.name == name) {
            return Err(StorageError::DuplicateMigration {
                name: name.to_string(),
            }
            .into());
        }
        let record = MigrationRecord::new(name, self.next_timestamp());
        applied.push(record.clone());
        Ok(record)
    }

    async fn remove_applied(&self, name: &str) -> KeystoneResult<()> {
        let mut applied = self.applied.write().await;
        let before = applied.len();
        applied.retain(|r| r.name != name);
        if applied.len() == before {
            return Err(StorageError::NotFound {
                field: name.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaExecutor for MockStore {
    async fn execute(&self, statement: &str) -> KeystoneResult<()> {
        if let Some(marker) = self.fail_ddl_containing.lock().unwrap().as_deref() {
            if statement.contains(marker) {
                return Err(StorageError::QueryFailed {
                    reason: format!("statement rejected: {statement}"),
                }
                .into());
            }
        }
        self.executed_ddl.write().await.push(statement.to_string());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
