//! On-disk cache of generated commit messages.
//!
//! - [`key`]: `(model, diff prefix)` -> 16-char SHA-256 hex key
//! - [`store`]: blobs, metadata, model info, eviction and statistics
//! - [`client`]: engine wrapper that checks the store before generating
//!
//! Two expiry policies coexist on purpose: lookups ignore entries older than
//! 24 hours, and `clear_older_than(days)` deletes by an operator-chosen age.

pub mod client;
pub mod key;
pub mod store;

pub use client::CachingClient;
pub use key::CacheKey;
pub use store::{
    CacheError, CacheStats, CacheStore, ClearReport, ENTRY_TTL, MetadataRecord, ModelInfo,
};
