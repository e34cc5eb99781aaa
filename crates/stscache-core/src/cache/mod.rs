//! Credential caching.
//!
//! `CredentialCache` serves credentials from a `CacheStore` and refreshes
//! them through a provider when they are missing or expire within the
//! requested skew (60 seconds by default).
//!
//! Stores:
//! - `FileCacheStore`: one owner-only JSON file per identity, replaced atomically
//! - `MemoryCacheStore`: in-process map

pub mod manager;
pub mod store;

pub use manager::{CredentialCache, DEFAULT_SKEW};
pub use store::{cache_key, CacheStore, FileCacheStore, MemoryCacheStore, APP_NAME};
