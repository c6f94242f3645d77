//! Backend access.
//!
//! This module provides the [`RemoteApi`] seam used by the sync engine, the
//! reqwest-backed [`ApiClient`] that implements it, and the typed
//! [`UserDataApi`] over the user-data endpoints.
//!
//! Requests carry a bearer token obtained from an
//! [`AuthProvider`](crate::auth::AuthProvider).

pub mod client;
pub mod error;
pub mod remote;
pub mod user_data;

pub use client::ApiClient;
pub use error::ApiError;
pub use remote::{HttpMethod, RemoteApi};
pub use user_data::{UserDataApi, UserDataSnapshot, WriteOperation};
