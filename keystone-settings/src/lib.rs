//! Reactive settings cache.
//!
//! An in-memory, lazily populated view of the persisted settings relation.
//! Point reads cache both hits and confirmed misses; prefix reads cache a
//! suffix-keyed map per prefix; a background poll pulls rows newer than the
//! last observed watermark and rebroadcasts every detected change as ordered
//! events through an [`EventSink`].
//!
//! Typical wiring:
//!
//! ```ignore
//! let store: Arc<dyn SettingsStore> = Arc::new(pg_store);
//! let sink: Arc<dyn EventSink> = Arc::new(bus_sink);
//! let cache = Arc::new(SettingsCache::new(store, sink, SettingsCacheConfig::from_env()));
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(polling_task(Arc::clone(&cache), shutdown_rx));
//! ```

pub mod cache;
pub mod config;
pub mod poller;
pub mod sink;

pub use cache::{PollOutcome, ReloadOutcome, SettingsCache};
pub use config::SettingsCacheConfig;
pub use poller::{polling_task, PollerMetrics, PollerSnapshot};
pub use sink::{EventSink, NullSink, RecordingSink};
