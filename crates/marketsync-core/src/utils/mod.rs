//! Display helpers for status output.

pub mod format;

pub use format::{format_age, format_last_synced, truncate_string};
