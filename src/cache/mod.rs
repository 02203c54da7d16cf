//! Generic in-memory caching for synchronized data.
//!
//! This module provides a backend-agnostic cache that:
//! - Stores values with the instant they were written
//! - Answers staleness questions lazily against a caller-supplied max age
//! - Supports bulk teardown by key prefix (e.g., everything for a logged-out user)
//! - Patches cached entity lists by key after confirmed mutations

mod memory;
mod traits;

pub use memory::MemoryCache;
pub use traits::{remove, upsert, Cacheable};
