//! Batch status cache.
//!
//! List views need a per-pattern status ("paid this period?") that comes from
//! a separate batched gateway call. [`StatusCache`] keeps a single slot keyed
//! by a digest of the fields that can change the answer, so re-rendering an
//! unchanged list never hits the network.
//!
//! # Flight coalescing
//!
//! While a lookup for a key is in flight, callers asking for the same key
//! subscribe to its result instead of issuing a duplicate call:
//! 1. The first caller becomes the fetcher and registers an in-flight marker
//! 2. Later callers with the same key wait on the marker's broadcast channel
//! 3. The fetcher stores the result, clears the marker, and notifies waiters
//!
//! A newer key replaces the marker. An older lookup that completes afterwards
//! still answers its own callers but never overwrites the slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{BillStatus, RemoteGateway};
use crate::identifier::PatternId;
use crate::pattern::RecurringPattern;

/// Status per identifier.
pub type StatusMap = HashMap<PatternId, BillStatus>;

type FlightResult = Result<StatusMap, String>;

/// Digest over the `(identifier, icon, color, mode)` tuples of a pattern set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Computes the key for a set of patterns.
    ///
    /// Input order does not matter; duplicate tuples count once.
    #[must_use]
    pub fn compute(patterns: &[RecurringPattern]) -> Self {
        let mut tuples: Vec<(String, &str, &str, String)> = patterns
            .iter()
            .map(|p| {
                (
                    p.id.to_string(),
                    p.appearance.icon.as_deref().unwrap_or(""),
                    p.appearance.color.as_deref().unwrap_or(""),
                    p.appearance.mode.to_string(),
                )
            })
            .collect();
        tuples.sort();
        tuples.dedup();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"billsync.status.v1");
        for (id, icon, color, mode) in &tuples {
            for field in [id.as_str(), *icon, *color, mode.as_str()] {
                // Length-prefixed so field boundaries cannot shift.
                hasher.update(&(field.len() as u64).to_le_bytes());
                hasher.update(field.as_bytes());
            }
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Hex form of the digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single cached result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCacheEntry {
    /// Key of the pattern set this entry answers.
    pub cache_key: CacheKey,
    /// Status per identifier in that set.
    pub status_by_id: StatusMap,
}

/// Status cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusCacheConfig {
    /// Status given to placeholder and legacy identifiers, which are never sent.
    pub excluded_status: BillStatus,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            excluded_status: BillStatus::Unknown,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<StatusCacheEntry>,
    in_flight: Option<(CacheKey, broadcast::Sender<FlightResult>)>,
}

enum Role {
    Hit(StatusMap),
    Waiter(broadcast::Receiver<FlightResult>),
    Fetcher(broadcast::Sender<FlightResult>),
}

fn lock_err() -> SyncError {
    SyncError::internal("poisoned lock: status cache")
}

/// Clears the in-flight marker if the fetcher is dropped before completing.
struct FlightGuard<'a> {
    slot: &'a Mutex<Slot>,
    key: CacheKey,
    completed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Ok(mut slot) = self.slot.lock() {
            if matches!(&slot.in_flight, Some((key, _)) if *key == self.key) {
                slot.in_flight = None;
            }
        }
    }
}

/// Single-slot cache of batch statuses.
pub struct StatusCache {
    gateway: Arc<dyn RemoteGateway>,
    config: StatusCacheConfig,
    slot: Mutex<Slot>,
}

impl fmt::Debug for StatusCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCache")
            .field("config", &self.config)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl StatusCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(gateway: Arc<dyn RemoteGateway>, config: StatusCacheConfig) -> Self {
        Self {
            gateway,
            config,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// The cached entry, if any.
    pub fn entry(&self) -> SyncResult<Option<StatusCacheEntry>> {
        let slot = self.slot.lock().map_err(|_| lock_err())?;
        Ok(slot.entry.clone())
    }

    /// Drops the cached entry so the next `ensure` recomputes.
    pub fn invalidate(&self) -> SyncResult<()> {
        let mut slot = self.slot.lock().map_err(|_| lock_err())?;
        slot.entry = None;
        Ok(())
    }

    fn claim(&self, key: &CacheKey) -> SyncResult<Role> {
        let mut slot = self.slot.lock().map_err(|_| lock_err())?;
        if let Some((in_flight, tx)) = &slot.in_flight {
            if in_flight == key {
                return Ok(Role::Waiter(tx.subscribe()));
            }
        }
        if let Some(entry) = &slot.entry {
            if &entry.cache_key == key {
                return Ok(Role::Hit(entry.status_by_id.clone()));
            }
        }
        let (tx, _) = broadcast::channel(1);
        if let Some((superseded, _)) = slot.in_flight.replace((key.clone(), tx.clone())) {
            debug!(%superseded, key = %key, "status lookup superseded by newer key");
        }
        Ok(Role::Fetcher(tx))
    }

    /// Returns the status of every pattern in `patterns`.
    ///
    /// Calls the gateway only when the set's [`CacheKey`] differs from the
    /// cached one and no lookup for it is already in flight.
    ///
    /// # Errors
    ///
    /// `StatusFailed` if the batch call fails. The previous entry stays cached.
    pub async fn ensure(&self, patterns: &[RecurringPattern]) -> SyncResult<StatusMap> {
        let key = CacheKey::compute(patterns);
        let tx = match self.claim(&key)? {
            Role::Hit(map) => return Ok(map),
            Role::Waiter(mut rx) => {
                debug!(key = %key, "awaiting in-flight status lookup");
                return match rx.recv().await {
                    Ok(Ok(map)) => Ok(map),
                    Ok(Err(message)) => Err(SyncError::StatusFailed { message }),
                    Err(_) => Err(SyncError::StatusFailed {
                        message: "in-flight status lookup was abandoned".to_string(),
                    }),
                };
            }
            Role::Fetcher(tx) => tx,
        };

        let mut guard = FlightGuard {
            slot: &self.slot,
            key: key.clone(),
            completed: false,
        };

        let mut statuses = StatusMap::with_capacity(patterns.len());
        let mut confirmed = Vec::new();
        for pattern in patterns {
            match pattern.id.as_confirmed() {
                Some(raw) => confirmed.push(raw.to_string()),
                None => {
                    statuses.insert(pattern.id.clone(), self.config.excluded_status);
                }
            }
        }
        confirmed.sort();
        confirmed.dedup();

        let response = if confirmed.is_empty() {
            Ok(HashMap::new())
        } else {
            self.gateway.batch_status(&confirmed).await
        };

        let mut slot = self.slot.lock().map_err(|_| lock_err())?;
        let owns_marker = matches!(&slot.in_flight, Some((k, _)) if *k == key);
        if owns_marker {
            slot.in_flight = None;
        }
        guard.completed = true;

        match response {
            Ok(by_raw) => {
                for raw in confirmed {
                    let status = by_raw.get(&raw).copied().unwrap_or_default();
                    statuses.insert(PatternId::Confirmed(raw), status);
                }
                if owns_marker {
                    slot.entry = Some(StatusCacheEntry {
                        cache_key: key,
                        status_by_id: statuses.clone(),
                    });
                }
                let _ = tx.send(Ok(statuses.clone()));
                Ok(statuses)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "status lookup failed, keeping previous entry");
                let message = err.to_string();
                let _ = tx.send(Err(message.clone()));
                Err(SyncError::StatusFailed { message })
            }
        }
    }
}

/// Next due date to display for each pattern.
///
/// Patterns already satisfied for this period show the following period's
/// date. Display only; nothing is written back.
#[must_use]
pub fn displayed_due_dates(
    patterns: &[RecurringPattern],
    statuses: &StatusMap,
) -> HashMap<PatternId, NaiveDate> {
    patterns
        .iter()
        .map(|p| {
            let satisfied = statuses.get(&p.id).copied().unwrap_or_default().is_satisfied();
            let due = if satisfied {
                p.frequency.advance(p.next_expected_date)
            } else {
                p.next_expected_date
            };
            (p.id.clone(), due)
        })
        .collect()
}
