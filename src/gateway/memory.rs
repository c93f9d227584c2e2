//! In-memory gateway backend.
//!
//! This module provides an in-process implementation of [`RemoteGateway`].
//! It behaves like a small server: it mints canonical identifiers, keeps
//! records and statuses, and can be scripted to fail, stall, or return
//! canned list responses. It is intended for tests, demos, and as a
//! reference implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::gateway::{BillStatus, CancelToken, RemoteGateway};
use crate::pattern::{PatternDraft, PatternPatch, RawPattern};

/// A call observed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `list`
    List,
    /// `create`, with the draft's vendor.
    Create { vendor: String },
    /// `update` of a confirmed id.
    Update { id: String },
    /// `delete` of a confirmed id.
    Delete { id: String },
    /// `batch_status`, with the ids sent.
    BatchStatus { ids: Vec<String> },
}

/// Gateway method selector for scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// `list`
    List,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `batch_status`
    BatchStatus,
}

impl GatewayCall {
    const fn op(&self) -> GatewayOp {
        match self {
            Self::List => GatewayOp::List,
            Self::Create { .. } => GatewayOp::Create,
            Self::Update { .. } => GatewayOp::Update,
            Self::Delete { .. } => GatewayOp::Delete,
            Self::BatchStatus { .. } => GatewayOp::BatchStatus,
        }
    }
}

#[derive(Debug)]
struct ScriptedList {
    delay: Duration,
    response: Result<Vec<RawPattern>, GatewayError>,
}

#[derive(Debug, Default)]
struct GatewayState {
    records: Vec<RawPattern>,
    statuses: HashMap<String, BillStatus>,
    next_seq: u64,
    calls: Vec<GatewayCall>,
    failures: HashMap<GatewayOp, VecDeque<GatewayError>>,
    delays: HashMap<GatewayOp, Duration>,
    list_script: VecDeque<ScriptedList>,
    ignore_cancel: bool,
}

/// Base for minted identifiers; keeps them 24 hex digits wide.
const ID_BASE: u64 = 0x65f0_0000_0000;

fn lock_err() -> GatewayError {
    GatewayError::transport("poisoned lock: memory gateway")
}

/// Thread-safe in-memory gateway.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryGateway {
    /// Create a new empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gateway seeded with server records.
    #[must_use]
    pub fn with_records(records: Vec<RawPattern>) -> Self {
        let gateway = Self::new();
        if let Ok(mut state) = gateway.state.lock() {
            state.records = records;
        }
        gateway
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut GatewayState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    /// Adds a server record.
    pub fn insert_record(&self, record: RawPattern) {
        self.with_state(|s| s.records.push(record));
    }

    /// Sets the server-side status of a confirmed identifier.
    pub fn set_status(&self, id: impl Into<String>, status: BillStatus) {
        self.with_state(|s| s.statuses.insert(id.into(), status));
    }

    /// Makes the next call to `op` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.with_state(|s| s.failures.entry(op).or_default().push_back(error));
    }

    /// Delays every call to `op`.
    pub fn set_delay(&self, op: GatewayOp, delay: Duration) {
        self.with_state(|s| s.delays.insert(op, delay));
    }

    /// Queues a canned `list` response, served after `delay`.
    pub fn script_list(&self, delay: Duration, response: Result<Vec<RawPattern>, GatewayError>) {
        self.with_state(|s| s.list_script.push_back(ScriptedList { delay, response }));
    }

    /// Stop honoring cancellation of `list`.
    pub fn ignore_cancellation(&self, ignore: bool) {
        self.with_state(|s| s.ignore_cancel = ignore);
    }

    /// Current server records.
    #[must_use]
    pub fn records(&self) -> Vec<RawPattern> {
        self.with_state(|s| s.records.clone()).unwrap_or_default()
    }

    /// Every call observed so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.with_state(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Number of calls observed for `op`.
    #[must_use]
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| c.op() == op).count())
            .unwrap_or_default()
    }

    /// Records the call and returns its configured delay and any scripted failure.
    fn begin(&self, call: GatewayCall) -> Result<(Duration, Option<GatewayError>), GatewayError> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let op = call.op();
        state.calls.push(call);
        let delay = state.delays.get(&op).copied().unwrap_or_default();
        let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        Ok((delay, failure))
    }

    async fn pause(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn list(&self, cancel: CancelToken) -> Result<Vec<RawPattern>, GatewayError> {
        let (mut delay, failure) = self.begin(GatewayCall::List)?;
        let (scripted, ignore_cancel) = {
            let mut state = self.state.lock().map_err(|_| lock_err())?;
            (state.list_script.pop_front(), state.ignore_cancel)
        };
        if let Some(script) = &scripted {
            delay = script.delay;
        }

        if ignore_cancel {
            Self::pause(delay).await;
        } else {
            tokio::select! {
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                () = Self::pause(delay) => {}
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        match scripted {
            Some(script) => script.response,
            None => Ok(self.records()),
        }
    }

    async fn create(&self, draft: &PatternDraft) -> Result<RawPattern, GatewayError> {
        let (delay, failure) = self.begin(GatewayCall::Create {
            vendor: draft.vendor.clone(),
        })?;
        Self::pause(delay).await;
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let id = format!("{:024x}", ID_BASE + state.next_seq);
        state.next_seq += 1;
        let record = RawPattern::from_draft(id, draft.clone());
        state.records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, id: &str, patch: &PatternPatch) -> Result<RawPattern, GatewayError> {
        let (delay, failure) = self.begin(GatewayCall::Update { id: id.to_string() })?;
        Self::pause(delay).await;
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| GatewayError::rejected(format!("pattern {id} not found")))?;
        if let Some(vendor) = &patch.vendor {
            record.vendor.clone_from(vendor);
        }
        if let Some(amount) = patch.amount {
            record.amount = amount;
        }
        if let Some(frequency) = patch.frequency {
            record.frequency = frequency;
        }
        if let Some(date) = patch.next_expected_date {
            record.next_expected_date = date;
        }
        if let Some(appearance) = &patch.appearance {
            record.appearance = appearance.clone();
        }
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let (delay, failure) = self.begin(GatewayCall::Delete { id: id.to_string() })?;
        Self::pause(delay).await;
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let before = state.records.len();
        state.records.retain(|r| r.id != id);
        if state.records.len() == before {
            return Err(GatewayError::rejected(format!("pattern {id} not found")));
        }
        state.statuses.remove(id);
        Ok(())
    }

    async fn batch_status(&self, ids: &[String]) -> Result<HashMap<String, BillStatus>, GatewayError> {
        let (delay, failure) = self.begin(GatewayCall::BatchStatus { ids: ids.to_vec() })?;
        Self::pause(delay).await;
        if let Some(err) = failure {
            return Err(err);
        }

        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(ids
            .iter()
            .map(|id| {
                let status = state.statuses.get(id).copied().unwrap_or(BillStatus::Unpaid);
                (id.clone(), status)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::identifier::is_canonical;
    use crate::pattern::Frequency;

    fn draft(vendor: &str) -> PatternDraft {
        PatternDraft::new(
            vendor,
            12.5,
            Frequency::Monthly,
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_mints_canonical_ids() {
        let gateway = InMemoryGateway::new();
        let a = gateway.create(&draft("a")).await.unwrap();
        let b = gateway.create(&draft("b")).await.unwrap();
        assert!(is_canonical(&a.id));
        assert!(is_canonical(&b.id));
        assert_ne!(a.id, b.id);
        assert_eq!(gateway.records().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let gateway = InMemoryGateway::new();
        gateway.fail_next(GatewayOp::Create, GatewayError::transport("offline"));
        assert!(gateway.create(&draft("a")).await.is_err());
        assert!(gateway.create(&draft("a")).await.is_ok());
        assert_eq!(gateway.call_count(GatewayOp::Create), 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_id_are_rejected() {
        let gateway = InMemoryGateway::new();
        let missing = "000000000000000000000000";
        let err = gateway.update(missing, &PatternPatch::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
        let err = gateway.delete(missing).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_honors_cancellation() {
        let gateway = InMemoryGateway::new();
        gateway.set_delay(GatewayOp::List, Duration::from_secs(10));
        let (handle, token) = CancelToken::pair();
        handle.cancel();
        assert_eq!(gateway.list(token).await, Err(GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn test_batch_status_defaults_to_unpaid() {
        let gateway = InMemoryGateway::new();
        gateway.set_status("aaaaaaaaaaaaaaaaaaaaaaaa", BillStatus::Paid);
        let ids = vec![
            "aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            "bbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
        ];
        let statuses = gateway.batch_status(&ids).await.unwrap();
        assert_eq!(statuses["aaaaaaaaaaaaaaaaaaaaaaaa"], BillStatus::Paid);
        assert_eq!(statuses["bbbbbbbbbbbbbbbbbbbbbbbb"], BillStatus::Unpaid);
    }
}
