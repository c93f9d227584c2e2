//! Consumer-facing engine.
//!
//! [`PatternEngine`] wires one [`OptimisticStore`], one [`FetchCoordinator`]
//! and one [`StatusCache`] around a shared [`RemoteGateway`]. Hold exactly
//! one engine per pattern collection and hand it to every screen that shows
//! recurring bills.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{SyncResult, ValidationError};
use crate::fetch::{FetchCoordinator, FetchState, RefreshOutcome};
use crate::gateway::RemoteGateway;
use crate::identifier::PatternId;
use crate::pattern::{PatternDraft, PatternPatch, RecurringPattern};
use crate::status::{displayed_due_dates, StatusCache, StatusCacheConfig, StatusMap};
use crate::store::{ChangeStream, OptimisticStore};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffered change events per subscriber before it starts skipping.
    pub change_capacity: usize,
    /// Status cache settings.
    pub status: StatusCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            change_capacity: 256,
            status: StatusCacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON configuration. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for malformed JSON or a zero `change_capacity`.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// `InvalidConfig` for a zero `change_capacity`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.change_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "change_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Optimistic mutation and reconciliation engine for recurring patterns.
#[derive(Debug)]
pub struct PatternEngine {
    store: Arc<OptimisticStore>,
    fetch: FetchCoordinator,
    status: Arc<StatusCache>,
}

impl PatternEngine {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new(gateway: Arc<dyn RemoteGateway>) -> Self {
        Self::with_config(gateway, EngineConfig::default())
    }

    /// Creates an engine with an explicit configuration.
    #[must_use]
    pub fn with_config(gateway: Arc<dyn RemoteGateway>, config: EngineConfig) -> Self {
        let store = Arc::new(OptimisticStore::new(
            Arc::clone(&gateway),
            config.change_capacity,
        ));
        let fetch = FetchCoordinator::new(Arc::clone(&gateway), Arc::clone(&store));
        let status = Arc::new(StatusCache::new(gateway, config.status));
        Self {
            store,
            fetch,
            status,
        }
    }

    /// Current patterns, newest first. The returned list is a copy.
    pub fn get_all(&self) -> SyncResult<Vec<RecurringPattern>> {
        self.store.get_all()
    }

    /// See [`OptimisticStore::create`].
    pub async fn create(&self, draft: PatternDraft) -> SyncResult<RecurringPattern> {
        self.store.create(draft).await
    }

    /// See [`OptimisticStore::update`].
    pub async fn update(&self, id: &PatternId, patch: PatternPatch) -> SyncResult<RecurringPattern> {
        self.store.update(id, patch).await
    }

    /// See [`OptimisticStore::delete`].
    pub async fn delete(&self, id: &PatternId) -> SyncResult<()> {
        self.store.delete(id).await
    }

    /// See [`FetchCoordinator::refresh`].
    pub async fn refresh(&self) -> SyncResult<RefreshOutcome> {
        self.fetch.refresh().await
    }

    /// Cancels the in-flight refresh, if any.
    pub fn cancel_refresh(&self) -> SyncResult<()> {
        self.fetch.cancel()
    }

    /// Whether a refresh is in flight, and which generation.
    pub fn fetch_state(&self) -> SyncResult<FetchState> {
        self.fetch.state()
    }

    /// Statuses for the patterns a view is rendering. See [`StatusCache::ensure`].
    pub async fn get_status(&self, patterns: &[RecurringPattern]) -> SyncResult<StatusMap> {
        self.status.ensure(patterns).await
    }

    /// Display due dates for `patterns`, advanced one period where already paid.
    pub async fn get_due_dates(
        &self,
        patterns: &[RecurringPattern],
    ) -> SyncResult<HashMap<PatternId, NaiveDate>> {
        let statuses = self.status.ensure(patterns).await?;
        Ok(displayed_due_dates(patterns, &statuses))
    }

    /// Subscribes to collection-changed notifications.
    #[must_use]
    pub fn subscribe(&self) -> ChangeStream {
        self.store.subscribe()
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<OptimisticStore> {
        &self.store
    }

    /// The shared status cache.
    #[must_use]
    pub fn status_cache(&self) -> &Arc<StatusCache> {
        &self.status
    }
}
