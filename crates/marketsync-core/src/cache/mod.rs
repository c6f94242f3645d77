//! Read-side caching.
//!
//! - `policy`: key classification and TTL selection
//! - `response`: the deduplicating TTL cache itself

pub mod policy;
pub mod response;

pub use policy::{CategoryTtlPolicy, DataCategory, TtlPolicy};
pub use response::{ResponseCache, DEFAULT_SWEEP_INTERVAL};
