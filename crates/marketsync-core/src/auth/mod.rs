//! Authentication state as seen by the data layer.
//!
//! Token issuance happens elsewhere; this module only answers "is there a
//! usable bearer credential right now?".
//!
//! This module provides:
//! - `AuthProvider`: the async session query the sync engine and API client use
//! - `SessionStore`: a file-persisted session with automatic expiry
//! - `StaticSession`: a fixed token (or none), e.g. from the environment

pub mod session;

pub use session::{SessionData, SessionStore};

use async_trait::async_trait;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The bearer credential for the current session, or `None` when signed
    /// out. `None` puts the sync engine in local-only mode.
    async fn current_session(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSession(pub Option<String>);

#[async_trait]
impl AuthProvider for StaticSession {
    async fn current_session(&self) -> Option<String> {
        self.0.clone()
    }
}
