//! stscache core - cache short-lived, MFA-derived credentials across process
//! invocations.
//!
//! ```no_run
//! use stscache_core::{CommandProvider, CredentialCache, FileCacheStore, DEFAULT_SKEW};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileCacheStore::new("/tmp/stscache");
//! let cache = CredentialCache::new(store);
//! let provider = CommandProvider::new(vec![
//!     "aws".into(), "sts".into(), "get-session-token".into(), "--output".into(), "json".into(),
//! ])?;
//! let creds = cache.get("default", &provider, DEFAULT_SKEW)?;
//! println!("{}", creds.access_key());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod provider;

pub use cache::{CacheStore, CredentialCache, FileCacheStore, MemoryCacheStore, DEFAULT_SKEW};
pub use clock::{Clock, SystemClock};
pub use credentials::CredentialBundle;
pub use error::{CacheError, ProviderError, StoreError};
pub use provider::{CommandProvider, CredentialProvider};
