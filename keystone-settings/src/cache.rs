//! The reactive settings cache.
//!
//! Holds an in-memory view of the settings relation: point slots (positive
//! or explicitly negative), prefix-keyed wildcard slots, and a watermark
//! bounding the differential poll. The store can change underneath the cache
//! at any time; the polling cycle pulls only rows newer than the watermark
//! and forwards each detected change as ordered events.

use chrono::{DateTime, Utc};
use keystone_core::{
    CacheSlot, ChangeRecord, KeystoneResult, SettingEntry, SettingsEventKind, UsageSnapshot,
    ValidationError, WildcardSlot, FIELD_KEY_MAX_LEN,
};
use keystone_storage::SettingsStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SettingsCacheConfig;
use crate::sink::EventSink;

/// Module name reported in usage snapshots.
const MODULE_NAME: &str = "configuration";

/// What a poll invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll was already in flight; this call was a no-op.
    InFlight,
    /// No rows newer than the watermark.
    NoChanges,
    /// Number of changed rows applied and dispatched.
    Applied(usize),
}

/// Result of an explicit full reload.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// A poll was already in flight; the reload was not performed.
    InFlight,
    /// The full cache after re-reading every persisted row.
    Reloaded(BTreeMap<String, Value>),
}

/// Interior mutable state. One lock: all cache operations run on one
/// logical worker, so a single mutex plus the atomic poll guard is the whole
/// synchronization story.
struct CacheState {
    slots: HashMap<String, CacheSlot>,
    wildcards: HashMap<String, WildcardSlot>,
    /// `updated_at` of the newest row any poll has observed. Epoch means
    /// "never polled".
    watermark: DateTime<Utc>,
    /// Set by reload: the next dispatching poll publishes one `read` batch
    /// instead of `updated` + `modified`.
    read_next: bool,
}

impl CacheState {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            wildcards: HashMap::new(),
            watermark: DateTime::<Utc>::UNIX_EPOCH,
            read_next: false,
        }
    }

    fn cached_value(&self, field: &str) -> Option<Value> {
        self.slots.get(field).and_then(|slot| slot.value()).cloned()
    }

    /// Drop every wildcard slot whose prefix matches `field`, so no wildcard
    /// serves stale membership after a write under it. Case-insensitive to
    /// mirror the prefix scan.
    fn invalidate_wildcards(&mut self, field: &str) {
        let lowered = field.to_lowercase();
        self.wildcards
            .retain(|prefix, _| !lowered.starts_with(&prefix.to_lowercase()));
    }
}

/// Poll-guard release on every exit path.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-memory view of the settings relation.
///
/// Owned component: construct one per process with the store and event sink
/// injected, and pass it to every consumer. No ambient singletons.
pub struct SettingsCache {
    store: Arc<dyn SettingsStore>,
    sink: Arc<dyn EventSink>,
    config: SettingsCacheConfig,
    state: Mutex<CacheState>,
    polling: AtomicBool,
}

impl SettingsCache {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        sink: Arc<dyn EventSink>,
        config: SettingsCacheConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            state: Mutex::new(CacheState::new()),
            polling: AtomicBool::new(false),
        }
    }

    /// Construct with default configuration.
    pub fn with_defaults(store: Arc<dyn SettingsStore>, sink: Arc<dyn EventSink>) -> Self {
        Self::new(store, sink, SettingsCacheConfig::default())
    }

    pub fn config(&self) -> &SettingsCacheConfig {
        &self.config
    }

    // ========================================================================
    // POINT READS
    // ========================================================================

    /// Get one setting's value.
    ///
    /// The first lookup queries the store and caches the result, positively
    /// or as an explicit negative marker; after that, reads are served from
    /// memory until invalidated or until the polling loop observes a newer
    /// write. Returns `Ok(None)` for a confirmed-absent key.
    pub async fn get(&self, field: &str) -> KeystoneResult<Option<Value>> {
        {
            let state = self.state.lock().await;
            if let Some(slot) = state.slots.get(field) {
                return Ok(slot.value().cloned());
            }
        }

        let fetched = self.fetch_with_schema_retry(field).await?;

        let mut state = self.state.lock().await;
        // A write may have landed while the fetch was in flight; an existing
        // slot is newer than what we fetched and wins.
        state
            .slots
            .entry(field.to_string())
            .or_insert(match fetched {
                Some(entry) => CacheSlot::Present(entry),
                None => CacheSlot::Absent,
            });
        Ok(state.cached_value(field))
    }

    /// Point lookup with bounded retry on the schema-not-ready race.
    /// Every other error class propagates unchanged.
    async fn fetch_with_schema_retry(
        &self,
        field: &str,
    ) -> KeystoneResult<Option<SettingEntry>> {
        let mut attempt = 0u32;
        loop {
            match self.store.get_by_field(field).await {
                Ok(found) => return Ok(found),
                Err(err) if err.is_relation_missing() && attempt < self.config.schema_retry_limit => {
                    attempt += 1;
                    warn!(
                        field,
                        attempt,
                        limit = self.config.schema_retry_limit,
                        "settings relation not ready, retrying"
                    );
                    tokio::time::sleep(self.config.schema_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Get every setting under a prefix, keyed by the remainder of each
    /// matching field after the prefix.
    ///
    /// The scan is case-insensitive. The result is cached per prefix — an
    /// empty map included — and dropped whole whenever any write lands under
    /// the prefix.
    pub async fn get_wildcard(&self, prefix: &str) -> KeystoneResult<BTreeMap<String, Value>> {
        {
            let state = self.state.lock().await;
            if let Some(slot) = state.wildcards.get(prefix) {
                return Ok(slot.entries.clone());
            }
        }

        let rows = self.store.scan_prefix(prefix).await?;
        let mut entries = BTreeMap::new();
        for row in rows {
            entries.insert(suffix_after(&row.field, prefix), row.value);
        }

        let mut state = self.state.lock().await;
        state
            .wildcards
            .entry(prefix.to_string())
            .or_insert_with(|| WildcardSlot::new(entries.clone()));
        Ok(state
            .wildcards
            .get(prefix)
            .map(|slot| slot.entries.clone())
            .unwrap_or(entries))
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write one setting, creating it if unknown.
    ///
    /// A key without a positive cached entry (never looked up, or confirmed
    /// absent) is treated as a first creation: the row is inserted and both
    /// `configuration.created` and `configuration.set` fire. A positively cached key
    /// is updated in place and fires `configuration.set` only.
    pub async fn set(&self, field: &str, value: Value) -> KeystoneResult<Value> {
        validate_field(field)?;

        // Mutate state and collect the dispatch under the lock, publish
        // after releasing it. Listeners may call back into the cache (see
        // `handle_event`), so the state mutex must never be held across
        // `publish`.
        let mut state = self.state.lock().await;
        let existing = state.slots.get(field).filter(|slot| slot.is_present()).cloned();

        let (stored, events) = match existing {
            None => {
                let entry = self.store.insert(field, value, None).await?;
                state
                    .slots
                    .insert(field.to_string(), CacheSlot::Present(entry.clone()));
                state.invalidate_wildcards(field);

                let batch = vec![ChangeRecord::new(field, None, Some(entry.value.clone()))];
                let events = vec![
                    (SettingsEventKind::Created, batch.clone()),
                    (SettingsEventKind::Set, batch),
                ];
                (entry, events)
            }
            Some(slot) => {
                let before = slot.value().cloned();
                let entry = self.store.update_value(field, value).await?;
                state
                    .slots
                    .insert(field.to_string(), CacheSlot::Present(entry.clone()));
                state.invalidate_wildcards(field);

                let batch = vec![ChangeRecord::new(field, before, Some(entry.value.clone()))];
                (entry, vec![(SettingsEventKind::Set, batch)])
            }
        };
        drop(state);

        for (kind, batch) in &events {
            self.sink.publish(kind.as_str(), batch).await?;
        }

        Ok(stored.value)
    }

    /// Write one setting, refusing to create it.
    ///
    /// Deliberately asymmetric from [`set`](Self::set), preserved as the
    /// upstream behavior: it requires a positive cached entry, yet persists
    /// by writing a NEW row rather than updating in place, and emits only
    /// `configuration.modified`. Returns `Ok(None)` without writing when the key
    /// has no positive cached entry.
    pub async fn update(&self, field: &str, value: Value) -> KeystoneResult<Option<Value>> {
        validate_field(field)?;

        let mut state = self.state.lock().await;
        let Some(before) = state
            .slots
            .get(field)
            .filter(|slot| slot.is_present())
            .and_then(|slot| slot.value())
            .cloned()
        else {
            return Ok(None);
        };

        let entry = self.store.insert_row(field, value).await?;
        state
            .slots
            .insert(field.to_string(), CacheSlot::Present(entry.clone()));
        state.invalidate_wildcards(field);
        drop(state);

        let batch = [ChangeRecord::new(
            field,
            Some(before),
            Some(entry.value.clone()),
        )];
        self.sink
            .publish(SettingsEventKind::Modified.as_str(), &batch)
            .await?;

        Ok(Some(entry.value))
    }

    // ========================================================================
    // POLLING
    // ========================================================================

    fn try_begin_poll(&self) -> Option<PollGuard<'_>> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(PollGuard(&self.polling))
    }

    /// One differential poll cycle.
    ///
    /// Single-flight: a call while another poll runs returns
    /// [`PollOutcome::InFlight`] immediately. Otherwise pulls every row
    /// strictly newer than the watermark in ascending `updated_at` order,
    /// applies each to its slot, invalidates wildcards under the changed
    /// fields, dispatches the whole ordered batch, and advances the
    /// watermark to the last row processed.
    pub async fn poll(&self) -> KeystoneResult<PollOutcome> {
        let Some(guard) = self.try_begin_poll() else {
            return Ok(PollOutcome::InFlight);
        };
        self.poll_inner(guard).await
    }

    async fn poll_inner(&self, _guard: PollGuard<'_>) -> KeystoneResult<PollOutcome> {
        let mut state = self.state.lock().await;
        let rows = self.store.changed_since(state.watermark).await?;
        if rows.is_empty() {
            state.read_next = false;
            return Ok(PollOutcome::NoChanges);
        }

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            let before = state.cached_value(&row.field);
            state
                .slots
                .insert(row.field.clone(), CacheSlot::Present(row.clone()));
            state.invalidate_wildcards(&row.field);
            batch.push(ChangeRecord::new(
                row.field.clone(),
                before,
                Some(row.value.clone()),
            ));
        }

        // Rows arrive ascending; the last one bounds the next poll. The
        // watermark advances before dispatch: a failed publish must not make
        // the next poll re-apply the same rows with the prior values already
        // overwritten.
        if let Some(last) = rows.last() {
            state.watermark = last.updated_at;
        }
        let read_batch = state.read_next;
        state.read_next = false;
        debug!(applied = rows.len(), watermark = %state.watermark, "settings poll applied changes");
        drop(state);

        if read_batch {
            self.sink
                .publish(SettingsEventKind::Read.as_str(), &batch)
                .await?;
        } else {
            self.sink
                .publish(SettingsEventKind::Updated.as_str(), &batch)
                .await?;
            self.sink
                .publish(SettingsEventKind::Modified.as_str(), &batch)
                .await?;
        }

        Ok(PollOutcome::Applied(rows.len()))
    }

    /// Explicit full reload.
    ///
    /// Resets the watermark to the epoch and polls synchronously, so every
    /// persisted row is treated as changed-since-forever and re-dispatched
    /// as one `configuration.read` batch. Returns the full resulting cache, or
    /// [`ReloadOutcome::InFlight`] when a poll is already underway.
    pub async fn reload(&self) -> KeystoneResult<ReloadOutcome> {
        let Some(guard) = self.try_begin_poll() else {
            return Ok(ReloadOutcome::InFlight);
        };

        {
            let mut state = self.state.lock().await;
            state.watermark = DateTime::<Utc>::UNIX_EPOCH;
            state.read_next = true;
        }
        self.poll_inner(guard).await?;

        let state = self.state.lock().await;
        let snapshot = state
            .slots
            .iter()
            .filter_map(|(field, slot)| slot.value().map(|v| (field.clone(), v.clone())))
            .collect();
        Ok(ReloadOutcome::Reloaded(snapshot))
    }

    // ========================================================================
    // EVENT LOOPBACK & OBSERVABILITY
    // ========================================================================

    /// Handle a looped-back settings event from the bus.
    ///
    /// Wildcard slots must be dropped for writes that originated in a
    /// sibling process too; `configuration.set` and `configuration.modified` batches
    /// map to the same invalidation the local write paths perform.
    pub async fn handle_event(&self, event: &str, batch: &[ChangeRecord]) {
        let Some(kind) = SettingsEventKind::from_name(event) else {
            return;
        };
        if !kind.invalidates_wildcards() {
            return;
        }
        let mut state = self.state.lock().await;
        for record in batch {
            state.invalidate_wildcards(&record.field);
        }
    }

    /// Usage snapshot: the number of positively cached keys.
    pub async fn usage(&self) -> UsageSnapshot {
        let state = self.state.lock().await;
        UsageSnapshot {
            module: MODULE_NAME.to_string(),
            count: state.slots.values().filter(|slot| slot.is_present()).count(),
        }
    }

    /// Drop one cached point slot. The next `get` re-queries the store.
    pub async fn invalidate(&self, field: &str) {
        let mut state = self.state.lock().await;
        state.slots.remove(field);
        state.invalidate_wildcards(field);
    }
}

/// The part of `field` after a case-insensitively matched `prefix`.
///
/// The matched field may differ in case from the prefix, and case folding
/// can change byte length (Kelvin sign vs `k`), so the prefix's byte length
/// is only usable when it lands on a char boundary of `field`. Otherwise
/// fall back to skipping the prefix's char count.
fn suffix_after(field: &str, prefix: &str) -> String {
    match field.get(prefix.len()..) {
        Some(rest) => rest.to_string(),
        None => field.chars().skip(prefix.chars().count()).collect(),
    }
}

fn validate_field(field: &str) -> KeystoneResult<()> {
    if field.is_empty() {
        return Err(ValidationError::FieldEmpty.into());
    }
    let len = field.chars().count();
    if len > FIELD_KEY_MAX_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            len,
            max: FIELD_KEY_MAX_LEN,
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{NullSink, RecordingSink};
    use async_trait::async_trait;
    use keystone_core::StorageError;
    use keystone_storage::MockStore;
    use serde_json::json;
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    /// Sink wired the way event-bus deployments wire it: every dispatch is
    /// fed straight back into the cache's `handle_event`.
    struct LoopbackSink {
        cache: OnceLock<Weak<SettingsCache>>,
    }

    #[async_trait]
    impl EventSink for LoopbackSink {
        async fn publish(&self, event: &str, batch: &[ChangeRecord]) -> KeystoneResult<()> {
            if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                cache.handle_event(event, batch).await;
            }
            Ok(())
        }
    }

    /// Sink that fails every publish while the flag is up.
    struct FlakySink {
        inner: RecordingSink,
        failing: AtomicBool,
    }

    impl FlakySink {
        fn new() -> Self {
            Self {
                inner: RecordingSink::new(),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn publish(&self, event: &str, batch: &[ChangeRecord]) -> KeystoneResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::ConnectionFailed {
                    reason: "event bus unavailable".to_string(),
                }
                .into());
            }
            self.inner.publish(event, batch).await
        }
    }

    fn cache_over<S: SettingsStore + 'static, E: EventSink + 'static>(
        store: Arc<S>,
        sink: Arc<E>,
    ) -> SettingsCache {
        let config = SettingsCacheConfig::new()
            .with_schema_retry_delay(std::time::Duration::from_millis(1))
            .with_schema_retry_limit(3);
        SettingsCache::new(store, sink, config)
    }

    #[tokio::test]
    async fn test_negative_caching_skips_second_query() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        assert_eq!(cache.get("ghost").await.unwrap(), None);
        let queries_after_first = store.query_count();

        assert_eq!(cache.get("ghost").await.unwrap(), None);
        assert_eq!(store.query_count(), queries_after_first);
    }

    #[tokio::test]
    async fn test_set_then_get_without_store_query() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.set("feature.x", json!(true)).await.unwrap();
        let queries_after_set = store.query_count();

        assert_eq!(cache.get("feature.x").await.unwrap(), Some(json!(true)));
        assert_eq!(store.query_count(), queries_after_set);
    }

    #[tokio::test]
    async fn test_first_set_emits_created_then_set() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        cache.set("feature.x", json!(true)).await.unwrap();

        let dispatches = sink.dispatches().await;
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].0, "configuration.created");
        assert_eq!(dispatches[1].0, "configuration.set");
        for (_, batch) in &dispatches {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].field, "feature.x");
            assert_eq!(batch[0].before, None);
            assert_eq!(batch[0].after, Some(json!(true)));
        }
        assert_eq!(store.setting_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_set_emits_set_with_before() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(store, Arc::clone(&sink));

        cache.set("a", json!(1)).await.unwrap();
        cache.set("a", json!(2)).await.unwrap();

        assert_eq!(sink.count_of("configuration.created").await, 1);
        let set_batches = sink.batches_of("configuration.set").await;
        assert_eq!(set_batches.len(), 2);
        assert_eq!(set_batches[1][0].before, Some(json!(1)));
        assert_eq!(set_batches[1][0].after, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_set_over_negative_slot_creates() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(store, Arc::clone(&sink));

        assert_eq!(cache.get("a").await.unwrap(), None);
        cache.set("a", json!(1)).await.unwrap();

        assert_eq!(sink.count_of("configuration.created").await, 1);
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_update_refuses_to_create() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        assert_eq!(cache.update("missing", json!(1)).await.unwrap(), None);
        assert_eq!(store.setting_count().await, 0);
        assert!(sink.dispatches().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_writes_new_row_and_emits_modified_only() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        cache.set("a", json!(1)).await.unwrap();
        let before_id = store.get_by_field("a").await.unwrap().unwrap().id;

        let updated = cache.update("a", json!(2)).await.unwrap();
        assert_eq!(updated, Some(json!(2)));

        // A fresh row, not an in-place update.
        let after = store.get_by_field("a").await.unwrap().unwrap();
        assert_ne!(after.id, before_id);

        assert_eq!(sink.count_of("configuration.modified").await, 1);
        let batches = sink.batches_of("configuration.modified").await;
        assert_eq!(batches[0][0].before, Some(json!(1)));
        assert_eq!(batches[0][0].after, Some(json!(2)));
        // No extra set event from update.
        assert_eq!(sink.count_of("configuration.set").await, 1);
    }

    #[tokio::test]
    async fn test_field_validation() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(store, Arc::new(RecordingSink::new()));

        assert!(cache.set("", json!(1)).await.is_err());
        assert!(cache.set(&"x".repeat(100), json!(1)).await.is_err());
        assert!(cache.set(&"x".repeat(99), json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wildcard_scan_and_suffix_map() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        store.insert("a.c", json!(2), None).await.unwrap();
        store.insert("other", json!(3), None).await.unwrap();
        let cache = cache_over(store, Arc::new(RecordingSink::new()));

        let map = cache.get_wildcard("a.").await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("b"), Some(&json!(1)));
        assert_eq!(map.get("c"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_empty_wildcard_result_is_cached() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        assert!(cache.get_wildcard("none.").await.unwrap().is_empty());
        let queries = store.query_count();
        assert!(cache.get_wildcard("none.").await.unwrap().is_empty());
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn test_set_invalidates_matching_wildcard() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        store.insert("a.c", json!(2), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        let first = cache.get_wildcard("a.").await.unwrap();
        assert_eq!(first.len(), 2);

        cache.set("a.d", json!(3)).await.unwrap();

        let second = cache.get_wildcard("a.").await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second.get("d"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_unrelated_wildcard_survives_set() {
        let store = Arc::new(MockStore::new());
        store.insert("mail.host", json!("smtp"), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.get_wildcard("mail.").await.unwrap();
        let queries = store.query_count();

        cache.set("cache.ttl", json!(60)).await.unwrap();

        cache.get_wildcard("mail.").await.unwrap();
        // Still served from the slot: no new scan.
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn test_schema_retry_is_bounded() {
        let store = Arc::new(MockStore::new());
        store.set_relation_missing(true);
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        let err = cache.get("a").await.unwrap_err();
        assert!(err.is_relation_missing());
        // Initial attempt plus the configured three retries.
        assert_eq!(store.query_count(), 4);
    }

    #[tokio::test]
    async fn test_schema_retry_recovers() {
        let store = Arc::new(MockStore::new());
        store.insert("a", json!(1), None).await.unwrap();
        store.set_relation_missing(true);
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        let store_bg = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            store_bg.set_relation_missing(false);
        });

        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_errors_surface_without_retry() {
        let store = Arc::new(MockStore::new());
        // The store already holds the row, but the cache has never seen it,
        // so set takes the create path and hits the duplicate insert.
        store.insert("a", json!(1), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        let err = cache.set("a", json!(2)).await.unwrap_err();
        assert!(!err.is_relation_missing());
        assert!(err.to_string().contains("duplicate field"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.set("a", json!(1)).await.unwrap();
        let queries = store.query_count();

        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.query_count(), queries + 1);
    }

    #[tokio::test]
    async fn test_usage_counts_positive_slots_only() {
        let store = Arc::new(MockStore::new());
        store.insert("a", json!(1), None).await.unwrap();
        let cache = cache_over(store, Arc::new(RecordingSink::new()));

        cache.get("a").await.unwrap();
        cache.get("missing").await.unwrap();

        let usage = cache.usage().await;
        assert_eq!(usage.module, "configuration");
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn test_poll_applies_external_writes_in_order() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        // Out-of-band writes the cache was never told about.
        store.insert("a", json!(1), None).await.unwrap();
        store.insert("b", json!(2), None).await.unwrap();

        let outcome = cache.poll().await.unwrap();
        assert_eq!(outcome, PollOutcome::Applied(2));

        let updated = sink.batches_of("configuration.updated").await;
        assert_eq!(updated.len(), 1);
        let fields: Vec<&str> = updated[0].iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["a", "b"]);
        // Both kinds carry the same full batch, updated first.
        assert_eq!(sink.batches_of("configuration.modified").await, updated);

        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_poll_advances_watermark_strictly() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        store.insert("a", json!(1), None).await.unwrap();
        assert_eq!(cache.poll().await.unwrap(), PollOutcome::Applied(1));

        // Nothing new: the watermark excludes already-seen rows.
        assert_eq!(cache.poll().await.unwrap(), PollOutcome::NoChanges);
        assert_eq!(sink.count_of("configuration.updated").await, 1);

        store.update_value("a", json!(2)).await.unwrap();
        assert_eq!(cache.poll().await.unwrap(), PollOutcome::Applied(1));

        let batches = sink.batches_of("configuration.updated").await;
        assert_eq!(batches[1][0].before, Some(json!(1)));
        assert_eq!(batches[1][0].after, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_poll_invalidates_wildcards_for_external_writes() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.poll().await.unwrap();
        assert_eq!(cache.get_wildcard("a.").await.unwrap().len(), 1);

        // External process writes under the cached prefix.
        store.insert("a.c", json!(2), None).await.unwrap();
        cache.poll().await.unwrap();

        assert_eq!(cache.get_wildcard("a.").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reload_dispatches_read_batch_with_every_key() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        store.insert("a", json!(1), None).await.unwrap();
        store.insert("b", json!(2), None).await.unwrap();
        cache.poll().await.unwrap();

        // Already cached, reload still re-dispatches everything as a read.
        let outcome = cache.reload().await.unwrap();
        let ReloadOutcome::Reloaded(snapshot) = outcome else {
            panic!("reload reported in-flight");
        };
        assert_eq!(snapshot.len(), 2);

        let reads = sink.batches_of("configuration.read").await;
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].len(), 2);
        // Not re-labelled as a normal poll.
        assert_eq!(sink.count_of("configuration.updated").await, 1);
    }

    #[tokio::test]
    async fn test_poll_after_reload_is_differential_again() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(RecordingSink::new());
        let cache = cache_over(Arc::clone(&store), Arc::clone(&sink));

        store.insert("a", json!(1), None).await.unwrap();
        cache.reload().await.unwrap();

        store.insert("b", json!(2), None).await.unwrap();
        cache.poll().await.unwrap();

        assert_eq!(sink.count_of("configuration.read").await, 1);
        assert_eq!(sink.count_of("configuration.updated").await, 1);
    }

    #[tokio::test]
    async fn test_loopback_listener_does_not_deadlock_set() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        let sink = Arc::new(LoopbackSink {
            cache: OnceLock::new(),
        });
        let cache = Arc::new(SettingsCache::new(
            Arc::clone(&store) as Arc<dyn SettingsStore>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            SettingsCacheConfig::new(),
        ));
        let _ = sink.cache.set(Arc::downgrade(&cache));

        cache.get_wildcard("a.").await.unwrap();

        // Listeners re-enter the cache during dispatch; set must still
        // complete.
        tokio::time::timeout(Duration::from_secs(2), cache.set("a.c", json!(2)))
            .await
            .expect("set() must not hold the state lock across dispatch")
            .unwrap();

        let map = cache.get_wildcard("a.").await.unwrap();
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_listener_does_not_deadlock_update_and_poll() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(LoopbackSink {
            cache: OnceLock::new(),
        });
        let cache = Arc::new(SettingsCache::new(
            Arc::clone(&store) as Arc<dyn SettingsStore>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            SettingsCacheConfig::new(),
        ));
        let _ = sink.cache.set(Arc::downgrade(&cache));

        tokio::time::timeout(Duration::from_secs(2), cache.set("k", json!(1)))
            .await
            .expect("set() must not hold the state lock across dispatch")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), cache.update("k", json!(2)))
            .await
            .expect("update() must not hold the state lock across dispatch")
            .unwrap();

        // Poll-driven dispatch loops back too.
        store.insert("external", json!(3), None).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), cache.poll())
            .await
            .expect("poll() must not hold the state lock across dispatch")
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_failed_dispatch_does_not_replay_rows() {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(FlakySink::new());
        let cache = SettingsCache::new(
            Arc::clone(&store) as Arc<dyn SettingsStore>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            SettingsCacheConfig::new(),
        );

        store.insert("a", json!(1), None).await.unwrap();
        sink.failing.store(true, Ordering::SeqCst);
        assert!(cache.poll().await.is_err());

        // The rows were applied and the watermark advanced despite the
        // dispatch failure; recovery must not rebroadcast them with the
        // prior values already overwritten.
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        sink.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.poll().await.unwrap(), PollOutcome::NoChanges);
        assert!(sink.inner.dispatches().await.is_empty());
    }

    #[test]
    fn test_suffix_after_prefix() {
        assert_eq!(suffix_after("a.b", "a."), "b");
        assert_eq!(suffix_after("A.b", "a."), "b");
        // U+212A KELVIN SIGN lowercases to a one-byte `k`, so the prefix's
        // byte length is not a char boundary of the matched field.
        assert_eq!(suffix_after("\u{212A}.b", "k."), "b");
    }

    #[tokio::test]
    async fn test_wildcard_suffix_survives_case_folding_width_change() {
        let store = Arc::new(MockStore::new());
        store.insert("\u{212A}.b", json!(1), None).await.unwrap();
        store.insert("k.c", json!(2), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        let map = cache.get_wildcard("k.").await.unwrap();
        assert_eq!(map.get("b"), Some(&json!(1)));
        assert_eq!(map.get("c"), Some(&json!(2)));
        assert!(!map.contains_key(""));
    }

    #[tokio::test]
    async fn test_handle_event_invalidates_wildcards() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.get_wildcard("a.").await.unwrap();
        let queries = store.query_count();

        // A sibling process announced a write under the prefix.
        cache
            .handle_event(
                "configuration.set",
                &[ChangeRecord::new("a.c", None, Some(json!(2)))],
            )
            .await;

        store.insert("a.c", json!(2), None).await.unwrap();
        let map = cache.get_wildcard("a.").await.unwrap();
        assert!(store.query_count() > queries);
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_handle_event_ignores_non_invalidating_kinds() {
        let store = Arc::new(MockStore::new());
        store.insert("a.b", json!(1), None).await.unwrap();
        let cache = cache_over(Arc::clone(&store), Arc::new(RecordingSink::new()));

        cache.get_wildcard("a.").await.unwrap();
        let queries = store.query_count();

        cache
            .handle_event(
                "configuration.read",
                &[ChangeRecord::new("a.b", None, Some(json!(1)))],
            )
            .await;

        cache.get_wildcard("a.").await.unwrap();
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn test_local_and_external_writes_converge_to_latest() {
        let store = Arc::new(MockStore::new());
        let cache = cache_over(Arc::clone(&store), Arc::new(NullSink));

        cache.set("k", json!("local")).await.unwrap();
        // Another process wrote after the local set.
        store.update_value("k", json!("external")).await.unwrap();

        cache.poll().await.unwrap();
        cache.poll().await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(json!("external")));
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
