//! Remote gateway contract.
//!
//! The engine reaches the server only through [`RemoteGateway`]. By using a
//! trait, we enable:
//! - HTTP clients in the embedding application
//! - The in-process [`memory::InMemoryGateway`] for tests and demos
//!
//! Only confirmed identifiers are ever passed to `update`, `delete`, and
//! `batch_status`.

/// In-process reference gateway.
pub mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::GatewayError;
use crate::pattern::{PatternDraft, PatternPatch, RawPattern};

pub use memory::{GatewayCall, GatewayOp, InMemoryGateway};

/// Derived per-period status of a pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    /// Satisfied for the current period.
    Paid,
    /// Due and not yet satisfied.
    Unpaid,
    /// Not known to the server, or never asked.
    #[default]
    Unknown,
}

impl BillStatus {
    /// Returns true if the pattern is satisfied for the current period.
    #[must_use]
    pub const fn is_satisfied(self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl fmt::Display for BillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paid => write!(f, "paid"),
            Self::Unpaid => write!(f, "unpaid"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Sending half of a cooperative cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half of a cooperative cancellation signal.
///
/// Gateways may poll [`CancelToken::is_cancelled`] or race
/// [`CancelToken::cancelled`] against their request. Honoring it is optional.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a linked handle/token pair.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        Self::pair().1
    }

    /// Returns true once the linked handle has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Network CRUD and batch-status service used by the engine.
///
/// All methods may fail with [`GatewayError::Transport`] or
/// [`GatewayError::Rejected`]; `list` may additionally return
/// [`GatewayError::Cancelled`] when it honors its token.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Fetch every recurring pattern.
    async fn list(&self, cancel: CancelToken) -> Result<Vec<RawPattern>, GatewayError>;

    /// Create a pattern. The returned record carries its canonical identifier.
    async fn create(&self, draft: &PatternDraft) -> Result<RawPattern, GatewayError>;

    /// Update a pattern addressed by a confirmed identifier.
    async fn update(&self, id: &str, patch: &PatternPatch) -> Result<RawPattern, GatewayError>;

    /// Delete a pattern addressed by a confirmed identifier.
    async fn delete(&self, id: &str) -> Result<(), GatewayError>;

    /// Look up the current-period status of confirmed identifiers.
    async fn batch_status(&self, ids: &[String]) -> Result<HashMap<String, BillStatus>, GatewayError>;
}
