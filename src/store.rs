//! Optimistic pattern store.
//!
//! The store owns the in-memory collection shown to consumers. Mutations are
//! applied locally first, then confirmed or rolled back once the gateway
//! answers. Each collection step runs under one write guard that is never
//! held across an `.await`, so consumers only ever observe the pre-call state,
//! the optimistic state, or the settled state.
//!
//! # Snapshots
//!
//! Every in-flight mutation holds a [`MutationSnapshot`] for its identifier.
//! While a snapshot is open, [`OptimisticStore::replace_all`] keeps the local
//! value for that identifier instead of the fetched one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{MutationKind, SyncError, SyncResult};
use crate::gateway::RemoteGateway;
use crate::identifier::{IdentifierClass, PatternId};
use crate::pattern::{PatternDraft, PatternPatch, RecurringPattern};
use crate::reconcile::reconcile_one;

fn lock_err(context: &'static str) -> SyncError {
    SyncError::internal(format!("poisoned lock: {context}"))
}

/// Pre-mutation value of one identifier, held while its mutation is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSnapshot {
    /// Identifier the mutation targets.
    pub id: PatternId,
    /// `None` if the identifier was absent before the mutation.
    pub prior: Option<RecurringPattern>,
    /// Index the prior value occupied.
    pub position: usize,
}

/// What changed in a store revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// The whole collection was replaced by a fetch.
    Replaced,
    /// A pattern was added.
    Inserted(PatternId),
    /// A pattern changed in place.
    Updated(PatternId),
    /// A pattern was removed.
    Removed(PatternId),
    /// A placeholder or legacy identifier was swapped for a confirmed one.
    Reconciled {
        /// Identifier before settlement.
        from: PatternId,
        /// Confirmed identifier.
        to: PatternId,
    },
    /// A failed mutation was undone.
    RolledBack(PatternId),
}

/// Collection-changed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Strictly increasing per store.
    pub revision: u64,
    /// What changed.
    pub change: StoreChange,
}

/// Subscriber handle for store events.
///
/// Slow subscribers skip ahead instead of blocking writers.
#[derive(Debug)]
pub struct ChangeStream {
    rx: broadcast::Receiver<StoreEvent>,
}

impl ChangeStream {
    /// Waits for the next event. Returns `None` once the store is dropped.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "change stream lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    patterns: Vec<RecurringPattern>,
    open: HashMap<PatternId, usize>,
    revision: u64,
}

impl StoreState {
    fn position(&self, id: &PatternId) -> Option<usize> {
        self.patterns.iter().position(|p| &p.id == id)
    }

    fn open_snapshot(&mut self, id: &PatternId) {
        *self.open.entry(id.clone()).or_default() += 1;
    }

    fn close_snapshot(&mut self, id: &PatternId) {
        if let Some(count) = self.open.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.open.remove(id);
            }
        }
    }

    /// Swaps the entry under `from` for `confirmed`, dropping any other entry
    /// that already carries the confirmed identifier.
    fn reconcile(&mut self, from: &PatternId, confirmed: RecurringPattern) {
        let to = confirmed.id.clone();
        if &to != from {
            self.patterns.retain(|p| p.id != to);
        }
        match self.position(from) {
            Some(idx) => self.patterns[idx] = confirmed,
            None => self.patterns.insert(0, confirmed),
        }
    }

    fn restore(&mut self, snapshot: &MutationSnapshot) {
        let current = self.position(&snapshot.id);
        match (&snapshot.prior, current) {
            (Some(prior), Some(idx)) => self.patterns[idx] = prior.clone(),
            (Some(prior), None) => {
                let idx = snapshot.position.min(self.patterns.len());
                self.patterns.insert(idx, prior.clone());
            }
            (None, Some(idx)) => {
                self.patterns.remove(idx);
            }
            (None, None) => {}
        }
    }
}

/// An open snapshot owned by one in-flight mutation.
///
/// Dropping it before it is settled, for example when the caller's future is
/// cancelled by a timeout, restores the snapshot and closes it.
struct PendingMutation<'a> {
    store: &'a OptimisticStore,
    snapshot: MutationSnapshot,
    settled: bool,
}

impl PendingMutation<'_> {
    /// Installs the server's value and closes the snapshot.
    fn settle(mut self, confirmed: RecurringPattern) -> SyncResult<()> {
        self.settled = true;
        self.store.settle_replacement(&self.snapshot, confirmed)
    }

    /// Closes the snapshot, keeping the optimistic state as it is.
    fn commit(mut self) -> SyncResult<()> {
        self.settled = true;
        let id = self.snapshot.id.clone();
        self.store.mutate("store.commit", |state| {
            state.close_snapshot(&id);
            ((), None)
        })
    }

    fn roll_back(mut self) -> SyncResult<()> {
        self.settled = true;
        self.store.roll_back(&self.snapshot)
    }
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(id = %self.snapshot.id, "mutation abandoned before the gateway answered, rolling back");
        if let Err(err) = self.store.undo(&self.snapshot) {
            warn!(id = %self.snapshot.id, error = %err, "could not roll back abandoned mutation");
        }
    }
}

/// In-memory collection of recurring patterns with optimistic mutations.
pub struct OptimisticStore {
    state: RwLock<StoreState>,
    gateway: Arc<dyn RemoteGateway>,
    changes: broadcast::Sender<StoreEvent>,
}

impl std::fmt::Debug for OptimisticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl OptimisticStore {
    /// Creates an empty store backed by `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn RemoteGateway>, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            state: RwLock::new(StoreState::default()),
            gateway,
            changes,
        }
    }

    /// Subscribes to collection-changed notifications.
    #[must_use]
    pub fn subscribe(&self) -> ChangeStream {
        ChangeStream {
            rx: self.changes.subscribe(),
        }
    }

    /// Runs one collection step under the write guard and publishes its change.
    fn mutate<T>(
        &self,
        context: &'static str,
        f: impl FnOnce(&mut StoreState) -> (T, Option<StoreChange>),
    ) -> SyncResult<T> {
        let mut state = self.state.write().map_err(|_| lock_err(context))?;
        let (out, change) = f(&mut state);
        if let Some(change) = change {
            state.revision += 1;
            // Sent under the guard so subscribers see revisions in order.
            // No subscribers is fine.
            let _ = self.changes.send(StoreEvent {
                revision: state.revision,
                change,
            });
        }
        Ok(out)
    }

    /// Snapshot of the current collection, newest first.
    pub fn get_all(&self) -> SyncResult<Vec<RecurringPattern>> {
        let state = self.state.read().map_err(|_| lock_err("store.get_all"))?;
        Ok(state.patterns.clone())
    }

    /// Looks up one pattern.
    pub fn get(&self, id: &PatternId) -> SyncResult<Option<RecurringPattern>> {
        let state = self.state.read().map_err(|_| lock_err("store.get"))?;
        Ok(state.position(id).map(|idx| state.patterns[idx].clone()))
    }

    /// Number of patterns.
    pub fn len(&self) -> SyncResult<usize> {
        let state = self.state.read().map_err(|_| lock_err("store.len"))?;
        Ok(state.patterns.len())
    }

    /// Returns true if the store holds no patterns.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Current revision; increments on every published change.
    pub fn revision(&self) -> SyncResult<u64> {
        let state = self.state.read().map_err(|_| lock_err("store.revision"))?;
        Ok(state.revision)
    }

    /// Returns true if a mutation for `id` is in flight.
    pub fn has_open_snapshot(&self, id: &PatternId) -> SyncResult<bool> {
        let state = self.state.read().map_err(|_| lock_err("store.has_open_snapshot"))?;
        Ok(state.open.contains_key(id))
    }

    /// Replaces the collection with fetched patterns.
    ///
    /// Identifiers with an open snapshot keep their local value (or stay
    /// removed, for an in-flight delete). Locally-held identifiers with an open
    /// snapshot that the fetch does not know about, such as placeholders of
    /// in-flight creates, stay in front.
    pub fn replace_all(&self, fetched: Vec<RecurringPattern>) -> SyncResult<()> {
        self.mutate("store.replace_all", |state| {
            if state.open.is_empty() {
                state.patterns = fetched;
                return ((), Some(StoreChange::Replaced));
            }

            let mut local: HashMap<PatternId, RecurringPattern> = state
                .patterns
                .iter()
                .filter(|p| state.open.contains_key(&p.id))
                .map(|p| (p.id.clone(), p.clone()))
                .collect();
            // Entries only known locally, in their current order.
            let mut merged: Vec<RecurringPattern> = state
                .patterns
                .iter()
                .filter(|p| local.contains_key(&p.id) && !fetched.iter().any(|f| f.id == p.id))
                .cloned()
                .collect();
            for pattern in fetched {
                if !state.open.contains_key(&pattern.id) {
                    merged.push(pattern);
                } else if let Some(optimistic) = local.remove(&pattern.id) {
                    debug!(id = %pattern.id, "keeping optimistic value over fetched one");
                    merged.push(optimistic);
                }
            }
            state.patterns = merged;
            ((), Some(StoreChange::Replaced))
        })
    }

    /// Creates a pattern optimistically under a placeholder identifier.
    ///
    /// Returns the confirmed pattern.
    ///
    /// # Errors
    ///
    /// `Validation` before anything is applied, or `MutationFailed` after the
    /// placeholder has been removed again.
    pub async fn create(&self, draft: PatternDraft) -> SyncResult<RecurringPattern> {
        draft.validate()?;
        let placeholder = PatternId::placeholder();
        let optimistic = RecurringPattern::from_draft(placeholder.clone(), draft.clone());
        let snapshot = self.mutate("store.create", |state| {
            state.patterns.insert(0, optimistic);
            state.open_snapshot(&placeholder);
            let snapshot = MutationSnapshot {
                id: placeholder.clone(),
                prior: None,
                position: 0,
            };
            (snapshot, Some(StoreChange::Inserted(placeholder.clone())))
        })?;
        let pending = self.track(snapshot);

        match self.gateway.create(&draft).await {
            Ok(raw) => {
                let confirmed = reconcile_one(raw);
                pending.settle(confirmed.clone())?;
                Ok(confirmed)
            }
            Err(cause) => {
                pending.roll_back()?;
                Err(SyncError::mutation(MutationKind::Create, cause))
            }
        }
    }

    /// Updates a pattern.
    ///
    /// Confirmed identifiers are patched optimistically and sent as an update;
    /// the server's returned value replaces the optimistic one. Placeholder and
    /// legacy identifiers cannot be addressed, so the patch is merged over the
    /// last known values and sent as a create, and the entry is then re-keyed
    /// to the confirmed identifier.
    pub async fn update(&self, id: &PatternId, patch: PatternPatch) -> SyncResult<RecurringPattern> {
        patch.validate()?;
        match id.as_confirmed() {
            Some(confirmed) => {
                let confirmed = confirmed.to_string();
                let pending = self.track(self.apply_patch(id, &patch)?);
                match self.gateway.update(&confirmed, &patch).await {
                    Ok(raw) => {
                        let updated = reconcile_one(raw);
                        pending.settle(updated.clone())?;
                        Ok(updated)
                    }
                    Err(cause) => {
                        pending.roll_back()?;
                        Err(SyncError::mutation(MutationKind::Update, cause))
                    }
                }
            }
            None => self.recreate(id, patch).await,
        }
    }

    async fn recreate(&self, id: &PatternId, patch: PatternPatch) -> SyncResult<RecurringPattern> {
        warn!(id = %id, class = %id.class(), "identifier is not addressable, recreating on the server");
        let base = self
            .get(id)?
            .map_or_else(PatternDraft::fallback, |p| p.to_draft());
        let draft = patch.merge_over(base);
        draft.validate()?;

        let pending = self.track(self.apply_patch(id, &patch)?);
        match self.gateway.create(&draft).await {
            Ok(raw) => {
                let confirmed = reconcile_one(raw);
                pending.settle(confirmed.clone())?;
                Ok(confirmed)
            }
            Err(cause) => {
                pending.roll_back()?;
                Err(SyncError::mutation(MutationKind::Update, cause))
            }
        }
    }

    /// Deletes a pattern.
    ///
    /// Placeholder and legacy identifiers are removed locally only.
    pub async fn delete(&self, id: &PatternId) -> SyncResult<()> {
        let Some(confirmed) = id.as_confirmed() else {
            if id.class() == IdentifierClass::LegacyMalformed {
                warn!(id = %id, "legacy identifier is not addressable, removing locally only");
            } else {
                debug!(id = %id, "removing placeholder locally");
            }
            return self.mutate("store.delete_local", |state| match state.position(id) {
                Some(idx) => {
                    state.patterns.remove(idx);
                    ((), Some(StoreChange::Removed(id.clone())))
                }
                None => ((), None),
            });
        };
        let confirmed = confirmed.to_string();

        let snapshot = self.mutate("store.delete", |state| {
            let position = state.position(id);
            let prior = position.map(|idx| state.patterns.remove(idx));
            state.open_snapshot(id);
            let change = prior.as_ref().map(|_| StoreChange::Removed(id.clone()));
            let snapshot = MutationSnapshot {
                id: id.clone(),
                prior,
                position: position.unwrap_or(0),
            };
            (snapshot, change)
        })?;
        let pending = self.track(snapshot);

        match self.gateway.delete(&confirmed).await {
            Ok(()) => pending.commit(),
            Err(cause) => {
                pending.roll_back()?;
                Err(SyncError::mutation(MutationKind::Delete, cause))
            }
        }
    }

    fn track(&self, snapshot: MutationSnapshot) -> PendingMutation<'_> {
        PendingMutation {
            store: self,
            snapshot,
            settled: false,
        }
    }

    /// Applies `patch` to the entry under `id` and opens its snapshot.
    fn apply_patch(&self, id: &PatternId, patch: &PatternPatch) -> SyncResult<MutationSnapshot> {
        self.mutate("store.apply_patch", |state| {
            let position = state.position(id);
            let prior = position.map(|idx| state.patterns[idx].clone());
            if let Some(idx) = position {
                patch.apply_to(&mut state.patterns[idx]);
            }
            state.open_snapshot(id);
            let change = position.map(|_| StoreChange::Updated(id.clone()));
            let snapshot = MutationSnapshot {
                id: id.clone(),
                prior,
                position: position.unwrap_or(0),
            };
            (snapshot, change)
        })
    }

    /// Closes the snapshot and installs the server's value in place.
    fn settle_replacement(&self, snapshot: &MutationSnapshot, confirmed: RecurringPattern) -> SyncResult<()> {
        self.mutate("store.settle", |state| {
            state.close_snapshot(&snapshot.id);
            let from = snapshot.id.clone();
            let to = confirmed.id.clone();
            state.reconcile(&from, confirmed);
            let change = if from == to {
                StoreChange::Updated(to)
            } else {
                StoreChange::Reconciled { from, to }
            };
            ((), Some(change))
        })
    }

    /// Closes the snapshot and restores its prior value.
    fn roll_back(&self, snapshot: &MutationSnapshot) -> SyncResult<()> {
        warn!(id = %snapshot.id, "mutation failed, rolling back");
        self.undo(snapshot)
    }

    fn undo(&self, snapshot: &MutationSnapshot) -> SyncResult<()> {
        self.mutate("store.roll_back", |state| {
            state.close_snapshot(&snapshot.id);
            state.restore(snapshot);
            ((), Some(StoreChange::RolledBack(snapshot.id.clone())))
        })
    }
}
