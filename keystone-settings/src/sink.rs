//! The event-dispatch seam.
//!
//! The cache publishes every observed change through an [`EventSink`]. The
//! contract: all listeners for one event name are awaited before `publish`
//! returns, so dispatches for one name stay ordered relative to later
//! dispatches from the same component.

use async_trait::async_trait;
use keystone_core::{ChangeRecord, KeystoneResult};
use tokio::sync::Mutex;

/// Asynchronous fan-out endpoint for settings change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one ordered batch under an event name. Resolves only after
    /// every listener has run.
    async fn publish(&self, event: &str, batch: &[ChangeRecord]) -> KeystoneResult<()>;
}

/// Sink that drops everything. For deployments without an event bus.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: &str, _batch: &[ChangeRecord]) -> KeystoneResult<()> {
        Ok(())
    }
}

/// Sink that records every dispatch in order. Test instrumentation.
#[derive(Debug, Default)]
pub struct RecordingSink {
    dispatches: Mutex<Vec<(String, Vec<ChangeRecord>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch so far, in publish order.
    pub async fn dispatches(&self) -> Vec<(String, Vec<ChangeRecord>)> {
        self.dispatches.lock().await.clone()
    }

    /// Dispatch count for one event name.
    pub async fn count_of(&self, event: &str) -> usize {
        self.dispatches
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Forget everything recorded so far.
    pub async fn clear(&self) {
        self.dispatches.lock().await.clear();
    }

    /// The batches published under one event name, in order.
    pub async fn batches_of(&self, event: &str) -> Vec<Vec<ChangeRecord>> {
        self.dispatches
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, batch)| batch.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &str, batch: &[ChangeRecord]) -> KeystoneResult<()> {
        self.dispatches
            .lock()
            .await
            .push((event.to_string(), batch.to_vec()));
        Ok(())
    }
}
