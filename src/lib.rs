//! # billsync - optimistic sync for recurring bills
//!
//! billsync keeps a locally cached collection of recurring bills in step with
//! a remote API. The UI mutates immediately; the engine confirms with the
//! server in the background and either reconciles or rolls back.
//!
//! ## Core Concepts
//!
//! - **PatternId**: an identifier tagged as placeholder, legacy, or confirmed
//! - **OptimisticStore**: the shared collection with snapshot-based rollback
//! - **FetchCoordinator**: bulk refreshes where the last one started wins
//! - **StatusCache**: single-slot batch status cache keyed by a content digest
//! - **RemoteGateway**: the server, behind an async trait
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use billsync::{Frequency, InMemoryGateway, PatternDraft, PatternEngine};
//!
//! let engine = PatternEngine::new(Arc::new(InMemoryGateway::new()));
//! let netflix = engine
//!     .create(PatternDraft::new("Netflix", 15.99, Frequency::Monthly, next_date))
//!     .await?;
//! assert!(netflix.id.is_confirmed());
//!
//! let visible = engine.get_all()?;
//! let statuses = engine.get_status(&visible).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod identifier;
pub mod pattern;
pub mod reconcile;
pub mod status;
pub mod store;

// Re-export primary types at crate root for convenience
pub use engine::{EngineConfig, PatternEngine};
pub use error::{GatewayError, MutationKind, SyncError, SyncResult, ValidationError};
pub use fetch::{FetchCoordinator, FetchGeneration, FetchState, RefreshOutcome};
pub use gateway::{
	BillStatus, CancelHandle, CancelToken, GatewayCall, GatewayOp, InMemoryGateway, RemoteGateway,
};
pub use identifier::{classify, IdentifierClass, PatternId};
pub use pattern::{
	Appearance, AppearanceMode, Frequency, PatternDraft, PatternPatch, RawPattern, RecurringPattern,
};
pub use reconcile::{normalize, NormalizeReport};
pub use status::{CacheKey, StatusCache, StatusCacheConfig, StatusCacheEntry, StatusMap};
pub use store::{ChangeStream, MutationSnapshot, OptimisticStore, StoreChange, StoreEvent};
