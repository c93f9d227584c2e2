//! Bulk list fetch coordination.
//!
//! Every [`FetchCoordinator::refresh`] mints a new [`FetchGeneration`] and
//! makes it the only live one. A response is applied only if its generation
//! is still live when it arrives: the last fetch *started* wins, regardless
//! of completion order. Superseded requests are cancelled best-effort, but
//! correctness does not depend on the gateway honoring that.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{CancelHandle, CancelToken, RemoteGateway};
use crate::reconcile::normalize_with_report;
use crate::store::OptimisticStore;

/// Token identifying one bulk fetch. Strictly increasing per coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchGeneration(u64);

impl FetchGeneration {
    /// Raw generation number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// No refresh in flight.
    Idle,
    /// The given generation is the live one.
    Fetching(FetchGeneration),
}

/// How a refresh ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The response was live and replaced the store contents.
    Applied {
        /// Generation that was applied.
        generation: FetchGeneration,
        /// Patterns in the normalized response.
        count: usize,
    },
    /// A newer refresh started before the response arrived; it was discarded.
    Superseded(FetchGeneration),
    /// The live request was cancelled; nothing changed.
    Cancelled(FetchGeneration),
}

#[derive(Debug, Default)]
struct CoordinatorState {
    minted: u64,
    live: Option<(FetchGeneration, CancelHandle)>,
}

fn lock_err() -> SyncError {
    SyncError::internal("poisoned lock: fetch coordinator")
}

/// Retires a generation whose refresh future is dropped before the gateway
/// answers: its request is cancelled and the coordinator returns to `Idle`.
struct LiveFetch<'a> {
    state: &'a Mutex<CoordinatorState>,
    generation: FetchGeneration,
    answered: bool,
}

impl Drop for LiveFetch<'_> {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if matches!(&state.live, Some((g, _)) if *g == self.generation) {
                if let Some((generation, handle)) = state.live.take() {
                    debug!(%generation, "refresh abandoned, cancelling its request");
                    handle.cancel();
                }
            }
        }
    }
}

/// Guards the bulk list operation against overlapping and stale requests.
pub struct FetchCoordinator {
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<OptimisticStore>,
    state: Mutex<CoordinatorState>,
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl FetchCoordinator {
    /// Creates a coordinator that refreshes `store` from `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn RemoteGateway>, store: Arc<OptimisticStore>) -> Self {
        Self {
            gateway,
            store,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncResult<FetchState> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(match &state.live {
            Some((generation, _)) => FetchState::Fetching(*generation),
            None => FetchState::Idle,
        })
    }

    /// Signals cancellation of the live fetch, if any. The coordinator returns
    /// to `Idle` when the gateway answers.
    pub fn cancel(&self) -> SyncResult<()> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        if let Some((generation, handle)) = &state.live {
            debug!(%generation, "cancelling live fetch");
            handle.cancel();
        }
        Ok(())
    }

    fn begin(&self) -> SyncResult<(FetchGeneration, CancelToken)> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        state.minted += 1;
        let generation = FetchGeneration(state.minted);
        let (handle, token) = CancelToken::pair();
        if let Some((previous, previous_handle)) = state.live.replace((generation, handle)) {
            debug!(%previous, %generation, "superseding in-flight fetch");
            previous_handle.cancel();
        }
        Ok((generation, token))
    }

    /// Fetches the full list and replaces the store contents with it.
    ///
    /// # Errors
    ///
    /// `RefreshFailed` if the live request fails for any reason other than
    /// cancellation. The store keeps its previous contents.
    pub async fn refresh(&self) -> SyncResult<RefreshOutcome> {
        let (generation, token) = self.begin()?;
        let mut live_fetch = LiveFetch {
            state: &self.state,
            generation,
            answered: false,
        };
        let response = self.gateway.list(token).await;
        live_fetch.answered = true;

        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let live = matches!(&state.live, Some((g, _)) if *g == generation);
        if !live {
            debug!(%generation, "discarding stale fetch response");
            return Ok(RefreshOutcome::Superseded(generation));
        }
        state.live = None;

        match response {
            Ok(raw) => {
                let (patterns, report) = normalize_with_report(raw);
                let count = patterns.len();
                // Applied before the coordinator guard is released so no newer
                // fetch can begin between the liveness check and the replace.
                self.store.replace_all(patterns)?;
                info!(
                    %generation,
                    count,
                    rewritten = report.rewritten,
                    duplicates = report.duplicates_dropped,
                    "refresh applied"
                );
                Ok(RefreshOutcome::Applied { generation, count })
            }
            Err(err) if err.is_cancelled() => {
                debug!(%generation, "fetch cancelled");
                Ok(RefreshOutcome::Cancelled(generation))
            }
            Err(err) => {
                warn!(%generation, error = %err, "refresh failed");
                Err(SyncError::RefreshFailed {
                    message: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::memory::GatewayOp;
    use crate::gateway::InMemoryGateway;
    use crate::pattern::{Frequency, PatternDraft, RawPattern};

    fn raw(id: &str, vendor: &str) -> RawPattern {
        RawPattern::from_draft(
            id,
            PatternDraft::new(
                vendor,
                5.0,
                Frequency::Weekly,
                NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            ),
        )
    }

    fn setup(gateway: InMemoryGateway) -> (Arc<InMemoryGateway>, Arc<OptimisticStore>, Arc<FetchCoordinator>) {
        let gateway = Arc::new(gateway);
        let store = Arc::new(OptimisticStore::new(gateway.clone(), 16));
        let coordinator = Arc::new(FetchCoordinator::new(gateway.clone(), store.clone()));
        (gateway, store, coordinator)
    }

    #[tokio::test]
    async fn test_refresh_applies_normalized_list() {
        let (_gateway, store, coordinator) = setup(InMemoryGateway::with_records(vec![
            raw("aaaaaaaaaaaaaaaaaaaaaaaa", "a"),
            raw("aaaaaaaaaaaaaaaaaaaaaaaa", "dup"),
        ]));
        let outcome = coordinator.refresh().await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Applied { count: 1, .. }));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(coordinator.state().unwrap(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_contents() {
        let (gateway, store, coordinator) =
            setup(InMemoryGateway::with_records(vec![raw("aaaaaaaaaaaaaaaaaaaaaaaa", "a")]));
        coordinator.refresh().await.unwrap();
        gateway.fail_next(GatewayOp::List, GatewayError::transport("offline"));
        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::RefreshFailed { .. }));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(coordinator.state().unwrap(), FetchState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_response_is_discarded_even_if_first() {
        let (gateway, store, coordinator) = setup(InMemoryGateway::new());
        gateway.ignore_cancellation(true);
        gateway.script_list(Duration::from_millis(50), Ok(vec![raw("aaaaaaaaaaaaaaaaaaaaaaaa", "old")]));
        gateway.script_list(Duration::from_millis(500), Ok(vec![]));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::task::yield_now().await;
        let second = coordinator.refresh().await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert!(matches!(first, RefreshOutcome::Superseded(_)));
        assert!(matches!(second, RefreshOutcome::Applied { count: 0, .. }));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_to_idle_silently() {
        let (gateway, store, coordinator) = setup(InMemoryGateway::new());
        gateway.set_delay(GatewayOp::List, Duration::from_secs(30));
        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::task::yield_now().await;
        assert!(matches!(coordinator.state().unwrap(), FetchState::Fetching(_)));

        coordinator.cancel().unwrap();
        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(outcome, RefreshOutcome::Cancelled(_)));
        assert_eq!(coordinator.state().unwrap(), FetchState::Idle);
        assert_eq!(store.revision().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_refresh_returns_to_idle() {
        let (gateway, store, coordinator) =
            setup(InMemoryGateway::with_records(vec![raw("aaaaaaaaaaaaaaaaaaaaaaaa", "a")]));
        gateway.set_delay(GatewayOp::List, Duration::from_secs(10));

        let outcome = tokio::time::timeout(Duration::from_secs(1), coordinator.refresh()).await;
        assert!(outcome.is_err());
        assert_eq!(coordinator.state().unwrap(), FetchState::Idle);
        assert!(store.is_empty().unwrap());

        gateway.set_delay(GatewayOp::List, Duration::ZERO);
        let outcome = coordinator.refresh().await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Applied { count: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_superseded_refresh_keeps_newer_live() {
        let (gateway, _store, coordinator) = setup(InMemoryGateway::new());
        gateway.ignore_cancellation(true);
        gateway.set_delay(GatewayOp::List, Duration::from_secs(10));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::task::yield_now().await;
        let FetchState::Fetching(live) = coordinator.state().unwrap() else {
            panic!("expected a live fetch");
        };

        first.abort();
        let _ = first.await;
        assert_eq!(coordinator.state().unwrap(), FetchState::Fetching(live));

        second.abort();
        let _ = second.await;
        assert_eq!(coordinator.state().unwrap(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_generations_increase() {
        let (_gateway, _store, coordinator) = setup(InMemoryGateway::new());
        let RefreshOutcome::Applied { generation: g1, .. } = coordinator.refresh().await.unwrap() else {
            panic!("expected applied");
        };
        let RefreshOutcome::Applied { generation: g2, .. } = coordinator.refresh().await.unwrap() else {
            panic!("expected applied");
        };
        assert!(g2 > g1);
    }
}
