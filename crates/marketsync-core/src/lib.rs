//! marketsync core - the client-side data layer of an investing app.
//!
//! This crate keeps locally-held state usable and roughly consistent with the
//! backend over an unreliable network:
//!
//! - [`cache`]: deduplicating TTL read cache
//! - [`scheduler`]: adaptive, market-hours-aware polling of live data
//! - [`sync`]: durable write queue with bounded retry
//! - [`bootstrap`]: one-shot migration of legacy local data
//!
//! Collaborators (persistence, transport, session, clock) are traits so each
//! component can be built with fakes in tests.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod task;
pub mod utils;

pub use api::{ApiClient, ApiError, HttpMethod, RemoteApi, UserDataApi, UserDataSnapshot};
pub use auth::{AuthProvider, SessionStore, StaticSession};
pub use bootstrap::{Bootstrap, MigrationReport, MigrationState};
pub use cache::{CategoryTtlPolicy, DataCategory, ResponseCache, TtlPolicy};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{FetchError, SyncError};
pub use scheduler::{MarketSession, RefreshScheduler, StreamSubscription, UsEquitySession};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{
    AppLifecycle, FlushOutcome, QueuedWrite, SyncDeps, SyncEngine, SyncStatus, WriteMethod, WriteRequest,
};
pub use task::TaskGuard;
