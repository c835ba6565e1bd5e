//! Offline-tolerant record synchronization for ClinDoc
//!
//! Provides:
//! - A synchronization controller with one CRUD contract for patients,
//!   episodes and encounters, falling back to a local cache when the record
//!   API cannot be reached
//! - Pending ids for records created offline, aliased to server ids once a
//!   create succeeds
//! - Debounced autosave of the encounter draft being edited
//! - Lossless translation between the in-app and wire shapes of each record
//!
//! # Example
//!
//! ```no_run
//! use clindoc_sync::{Patient, SyncConfig, SyncEngine};
//!
//! # async fn run() -> clindoc_sync::SyncResult<()> {
//! let engine = SyncEngine::from_config(&SyncConfig::load(None)?)?;
//! let patient = engine.controller().create(Patient::intake("Ada", "Lovelace")).await?;
//! println!("saved {}", patient.id);
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod ids;
pub mod local_cache;
pub mod model;
pub mod record;
pub mod remote;
pub mod transform;

pub use autosave::{AutoSaveScheduler, SaveOutcome};
pub use config::SyncConfig;
pub use controller::SyncController;
pub use error::{SyncError, SyncResult};
pub use events::{BroadcastSink, EventSink, NoopSink, SyncEvent};
pub use ids::{EntityKind, LocalId, RecordId};
pub use local_cache::{CacheBackend, CacheKey, FileBackend, LocalCacheStore, MemoryBackend};
pub use model::*;
pub use record::{Record, RecordPatch};
pub use remote::{HttpRemoteApi, InMemoryRemoteApi, RemoteApi, RemoteError};

use logger_redacted::PiiRedactor;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Controller, autosave and event fan-out wired together
pub struct SyncEngine {
    controller: Arc<SyncController>,
    autosave: AutoSaveScheduler,
    events: Arc<BroadcastSink>,
}

impl SyncEngine {
    /// # Errors
    ///
    /// `Cache` if the cache holds unreadable documents.
    pub fn new(remote: Arc<dyn RemoteApi>, cache: LocalCacheStore, config: &SyncConfig) -> SyncResult<Self> {
        let events = Arc::new(BroadcastSink::default());
        let controller = SyncController::new(remote, cache, events.clone())?
            .with_redactor(PiiRedactor::from_logger_config(&config.logging));
        let controller = Arc::new(controller);

        let autosave = AutoSaveScheduler::new(controller.clone(), events.clone(), config.autosave_debounce);
        autosave.set_enabled(config.autosave_enabled);

        Ok(Self {
            controller,
            autosave,
            events,
        })
    }

    /// HTTP remote plus the configured cache (file-backed when `cache_dir`
    /// is set).
    ///
    /// # Errors
    ///
    /// `Config` for an unusable server URL, `Cache` if the cache cannot be
    /// opened.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let remote = Arc::new(HttpRemoteApi::new(config)?);
        let cache = match &config.cache_dir {
            Some(dir) => LocalCacheStore::in_dir(dir)?,
            None => LocalCacheStore::in_memory(),
        };
        Self::new(remote, cache, config)
    }

    pub fn controller(&self) -> &Arc<SyncController> {
        &self.controller
    }

    pub fn autosave(&self) -> &AutoSaveScheduler {
        &self.autosave
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
