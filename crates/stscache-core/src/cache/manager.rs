use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::store::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::credentials::{CredentialBundle, StoredRecord};
use crate::error::{CacheError, ProviderError, StoreError};
use crate::provider::CredentialProvider;

/// Refresh credentials that expire within a minute.
/// Long enough to cover the gap between handing out credentials and the
/// caller signing its last request with them.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(60);

/// Serves cached credentials and refreshes them through a provider when
/// they are missing or about to expire.
///
/// Expiry is checked on every read; nothing sweeps the store in the
/// background.
pub struct CredentialCache<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: CacheStore> CredentialCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Credentials for `identity` that stay valid for at least `skew`.
    ///
    /// Returns the cached bundle when it is still good. Otherwise calls
    /// `provider` exactly once, persists the result and returns it. Provider
    /// failures are returned as-is and never retried.
    pub fn get<P>(
        &self,
        identity: &str,
        provider: &P,
        skew: Duration,
    ) -> Result<CredentialBundle, CacheError>
    where
        P: CredentialProvider + ?Sized,
    {
        check_identity(identity)?;
        let min_remaining = chrono_skew(skew)?;

        if let Some(cached) = self.load(identity)? {
            let now = self.clock.now();
            if cached.is_valid_for(min_remaining, now) {
                debug!(
                    identity,
                    remaining_secs = cached.remaining(now).num_seconds(),
                    "Credential cache hit"
                );
                return Ok(cached);
            }
            info!(identity, expires_at = %cached.expires_at(), "Cached credentials are stale, refreshing");
        } else {
            info!(identity, "No cached credentials, refreshing");
        }

        let fresh = provider.fetch(identity)?;

        if fresh.identity() != identity {
            return Err(ProviderError::IdentityMismatch {
                requested: identity.to_string(),
                returned: fresh.identity().to_string(),
            }
            .into());
        }

        // The provider may have blocked on an MFA prompt for a while
        let now = self.clock.now();
        if fresh.is_expired(now) || !fresh.is_valid_for(min_remaining, now) {
            return Err(ProviderError::InsufficientLifetime {
                expires_at: fresh.expires_at(),
                skew_seconds: skew.as_secs(),
            }
            .into());
        }

        // issued_at records when this bundle entered the cache
        let fresh = CredentialBundle::new_at(
            fresh.identity(),
            fresh.access_key(),
            fresh.secret_key(),
            fresh.session_token(),
            fresh.expires_at(),
            now,
        );

        let contents = StoredRecord::encode(&fresh).map_err(StoreError::from)?;
        self.store.write(identity, &contents)?;
        info!(identity, expires_at = %fresh.expires_at(), "Cached refreshed credentials");

        Ok(fresh)
    }

    /// Drop any cached bundle for `identity`. Missing entries are fine.
    pub fn invalidate(&self, identity: &str) -> Result<(), CacheError> {
        check_identity(identity)?;
        self.store.remove(identity)?;
        info!(identity, "Invalidated cached credentials");
        Ok(())
    }

    /// The cached bundle for `identity`, expired or not. Never calls a provider.
    pub fn peek(&self, identity: &str) -> Result<Option<CredentialBundle>, CacheError> {
        check_identity(identity)?;
        Ok(self.load(identity)?)
    }

    /// True if a bundle valid for at least `skew` is cached.
    pub fn is_fresh(&self, identity: &str, skew: Duration) -> Result<bool, CacheError> {
        let min_remaining = chrono_skew(skew)?;
        let now = self.clock.now();
        Ok(self
            .peek(identity)?
            .is_some_and(|bundle| bundle.is_valid_for(min_remaining, now)))
    }

    /// Every readable cached bundle, sorted by identity.
    ///
    /// Corrupt records and records sitting under another identity's key are
    /// skipped, matching what `get` would treat as a miss.
    pub fn entries(&self) -> Result<Vec<CredentialBundle>, CacheError> {
        let mut bundles: Vec<CredentialBundle> = self
            .store
            .scan()?
            .iter()
            .filter_map(|(key, contents)| match StoredRecord::decode(contents) {
                Ok(bundle) if self.store.entry_key(bundle.identity()) == *key => Some(bundle),
                Ok(bundle) => {
                    debug!(
                        key = %key,
                        stored_identity = bundle.identity(),
                        "Skipping cache entry filed under another identity"
                    );
                    None
                }
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable cache entry");
                    None
                }
            })
            .collect();
        bundles.sort_by(|a, b| a.identity().cmp(b.identity()));
        Ok(bundles)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Read and decode the entry for `identity`.
    ///
    /// Unparseable records and records naming a different identity are
    /// treated as absent so a damaged cache never blocks a refresh.
    fn load(&self, identity: &str) -> Result<Option<CredentialBundle>, StoreError> {
        let Some(contents) = self.store.read(identity)? else {
            return Ok(None);
        };

        match StoredRecord::decode(&contents) {
            Ok(bundle) if bundle.identity() == identity => Ok(Some(bundle)),
            Ok(bundle) => {
                warn!(
                    identity,
                    stored_identity = bundle.identity(),
                    "Cache entry belongs to another identity, ignoring"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(identity, error = %e, "Corrupt cache entry, ignoring");
                Ok(None)
            }
        }
    }
}

/// Any non-empty string is a valid identity, whitespace included.
fn check_identity(identity: &str) -> Result<(), CacheError> {
    if identity.is_empty() {
        return Err(CacheError::EmptyIdentity);
    }
    Ok(())
}

fn chrono_skew(skew: Duration) -> Result<chrono::Duration, CacheError> {
    chrono::Duration::from_std(skew).map_err(|_| CacheError::InvalidSkew(skew.as_secs()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::cache::store::{FileCacheStore, MemoryCacheStore};

    const SKEW: Duration = Duration::from_secs(60);

    /// Clock that only moves when told to
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, seconds: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(seconds);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Provider issuing bundles that live `lifetime_secs` past the clock,
    /// counting how often it is called.
    struct FakeProvider {
        clock: Arc<ManualClock>,
        lifetime_secs: i64,
        calls: Cell<usize>,
    }

    impl FakeProvider {
        fn new(clock: &Arc<ManualClock>, lifetime_secs: i64) -> Self {
            Self {
                clock: Arc::clone(clock),
                lifetime_secs,
                calls: Cell::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.get()
        }
    }

    impl CredentialProvider for FakeProvider {
        fn fetch(&self, identity: &str) -> Result<CredentialBundle, ProviderError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            let now = self.clock.now();
            Ok(CredentialBundle::new_at(
                identity,
                format!("ASIA{}", n),
                format!("secret-{}", n),
                format!("token-{}", n),
                now + chrono::Duration::seconds(self.lifetime_secs),
                now,
            ))
        }
    }

    fn memory_cache(clock: &Arc<ManualClock>) -> CredentialCache<MemoryCacheStore> {
        CredentialCache::new(MemoryCacheStore::new()).with_clock(clock.clone())
    }

    fn seed(cache: &CredentialCache<MemoryCacheStore>, identity: &str, expires_in_secs: i64) {
        let now = cache.now();
        let bundle = CredentialBundle::new_at(
            identity,
            "ASIASEED",
            "seed-secret",
            "seed-token",
            now + chrono::Duration::seconds(expires_in_secs),
            now,
        );
        cache
            .store()
            .write(identity, &StoredRecord::encode(&bundle).unwrap())
            .unwrap();
    }

    #[test]
    fn test_miss_calls_provider_once() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        let bundle = cache.get("prod/admin", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(bundle.access_key(), "ASIA1");
        assert_eq!(cache.peek("prod/admin").unwrap(), Some(bundle));
    }

    #[test]
    fn test_hit_does_not_call_provider() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        let first = cache.get("prod/admin", &provider, SKEW).unwrap();
        clock.advance(10);
        let second = cache.get("prod/admin", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_repeated_hits_are_identical() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        cache.get("prod", &provider, SKEW).unwrap();

        let a = cache.get("prod", &provider, SKEW).unwrap();
        let b = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(a, b);
        assert_eq!(
            StoredRecord::encode(&a).unwrap(),
            StoredRecord::encode(&b).unwrap()
        );
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_bundle_inside_skew_is_refreshed() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        seed(&cache, "prod", 30);

        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(bundle.access_key(), "ASIA1");
        assert!(bundle.remaining(clock.now()) >= chrono::Duration::seconds(60));
    }

    #[test]
    fn test_bundle_exactly_at_skew_is_served() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        seed(&cache, "prod", 60);

        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(bundle.access_key(), "ASIASEED");
    }

    #[test]
    fn test_expiry_over_time_triggers_refresh() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        cache.get("prod", &provider, SKEW).unwrap();
        clock.advance(3600 - 59);
        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(bundle.access_key(), "ASIA2");
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        cache.get("prod", &provider, SKEW).unwrap();

        cache.invalidate("prod").unwrap();
        cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn test_invalidate_missing_is_ok() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);

        cache.invalidate("never-cached").unwrap();
        cache.invalidate("never-cached").unwrap();

        assert!(cache.peek("never-cached").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        cache.store().write("prod", b"{\"version\":1,\"identity\":").unwrap();

        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(cache.peek("prod").unwrap(), Some(bundle));
    }

    #[test]
    fn test_entry_for_other_identity_is_a_miss() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        seed(&cache, "dev", 3600);
        let dev_record = cache.store().read("dev").unwrap().unwrap();
        cache.store().write("prod", &dev_record).unwrap();

        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(bundle.identity(), "prod");
    }

    #[test]
    fn test_provider_error_is_propagated_without_retry() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let calls = Cell::new(0);
        let provider = |_: &str| -> Result<CredentialBundle, ProviderError> {
            calls.set(calls.get() + 1);
            Err(ProviderError::Failed("invalid MFA code".to_string()))
        };

        let err = cache.get("prod", &provider, SKEW).unwrap_err();

        assert!(matches!(err, CacheError::Provider(ProviderError::Failed(_))));
        assert_eq!(calls.get(), 1);
        assert!(cache.store().is_empty());
    }

    #[test]
    fn test_short_lived_provider_bundle_is_rejected() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 30);

        let err = cache.get("prod", &provider, SKEW).unwrap_err();

        assert!(matches!(
            err,
            CacheError::Provider(ProviderError::InsufficientLifetime { skew_seconds: 60, .. })
        ));
        assert!(cache.store().is_empty());
    }

    #[test]
    fn test_already_expired_bundle_is_rejected_with_zero_skew() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 0);

        assert!(cache.get("prod", &provider, Duration::ZERO).is_err());
        assert!(cache.store().is_empty());
    }

    #[test]
    fn test_mismatched_identity_is_rejected() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);
        let wrong = |_: &str| provider.fetch("dev");

        let err = cache.get("prod", &wrong, SKEW).unwrap_err();

        assert!(matches!(
            err,
            CacheError::Provider(ProviderError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_identity_is_rejected() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        assert!(matches!(
            cache.get("", &provider, SKEW),
            Err(CacheError::EmptyIdentity)
        ));
        assert!(matches!(cache.invalidate(""), Err(CacheError::EmptyIdentity)));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_whitespace_identity_is_allowed() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        let bundle = cache.get(" ", &provider, SKEW).unwrap();

        assert_eq!(bundle.identity(), " ");
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_issued_at_is_cache_write_time() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let long_ago = Utc::now() - chrono::Duration::days(365 * 25);
        let expires_at = clock.now() + chrono::Duration::hours(1);
        let provider = move |identity: &str| -> Result<CredentialBundle, ProviderError> {
            Ok(CredentialBundle::new_at(identity, "ASIAOLD", "s", "t", expires_at, long_ago))
        };

        clock.advance(5);
        let written_at = clock.now();
        let bundle = cache.get("prod", &provider, SKEW).unwrap();

        assert_eq!(bundle.issued_at(), written_at);
        assert_eq!(bundle.expires_at(), expires_at);
        assert_eq!(bundle.access_key(), "ASIAOLD");
        let stored = cache.peek("prod").unwrap().unwrap();
        assert_eq!(stored.issued_at(), written_at);
        assert_eq!(stored, bundle);
    }

    #[test]
    fn test_out_of_range_skew_is_rejected() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        let provider = FakeProvider::new(&clock, 3600);

        assert!(matches!(
            cache.get("prod", &provider, Duration::MAX),
            Err(CacheError::InvalidSkew(_))
        ));
    }

    #[test]
    fn test_is_fresh() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        assert!(!cache.is_fresh("prod", SKEW).unwrap());

        seed(&cache, "prod", 120);
        assert!(cache.is_fresh("prod", SKEW).unwrap());

        clock.advance(61);
        assert!(!cache.is_fresh("prod", SKEW).unwrap());
    }

    #[test]
    fn test_entries_sorted_and_skip_corrupt() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        seed(&cache, "zeta", 3600);
        seed(&cache, "alpha", 3600);
        cache.store().write("broken", b"not json").unwrap();

        let identities: Vec<String> = cache
            .entries()
            .unwrap()
            .iter()
            .map(|b| b.identity().to_string())
            .collect();

        assert_eq!(identities, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_entries_skip_record_under_other_key() {
        let clock = ManualClock::new();
        let cache = memory_cache(&clock);
        seed(&cache, "dev", 3600);
        let dev_record = cache.store().read("dev").unwrap().unwrap();
        cache.store().write("prod", &dev_record).unwrap();

        let entries = cache.entries().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity(), "dev");
    }

    #[test]
    fn test_file_store_entries_skip_copied_record() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let cache = CredentialCache::new(FileCacheStore::new(tmp.path())).with_clock(clock.clone());
        let provider = FakeProvider::new(&clock, 3600);
        cache.get("dev", &provider, SKEW).unwrap();

        let store = cache.store();
        std::fs::copy(store.entry_path("dev"), store.entry_path("prod")).unwrap();

        let identities: Vec<String> = cache
            .entries()
            .unwrap()
            .iter()
            .map(|b| b.identity().to_string())
            .collect();
        assert_eq!(identities, vec!["dev"]);
    }

    /// Store that reads fine but refuses every write
    struct ReadOnlyStore;

    impl CacheStore for ReadOnlyStore {
        fn read(&self, _identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn write(&self, identity: &str, _contents: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::io(
                identity,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        }

        fn remove(&self, _identity: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_write_failure_after_refresh_is_surfaced() {
        let clock = ManualClock::new();
        let cache = CredentialCache::new(ReadOnlyStore).with_clock(clock.clone());
        let provider = FakeProvider::new(&clock, 3600);

        let err = cache.get("prod", &provider, SKEW).unwrap_err();

        assert!(matches!(err, CacheError::Store(StoreError::Io { .. })));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_file_store_corrupt_entry_is_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(tmp.path());
        let path = store.entry_path("prod");
        std::fs::write(&path, "{ this is not json").unwrap();

        let clock = ManualClock::new();
        let cache = CredentialCache::new(store).with_clock(clock.clone());
        let provider = FakeProvider::new(&clock, 3600);

        let bundle = cache.get("prod", &provider, SKEW).unwrap();
        assert_eq!(provider.calls(), 1);

        let on_disk = StoredRecord::decode(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, bundle);
    }

    #[test]
    fn test_file_store_shared_between_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let provider = FakeProvider::new(&clock, 3600);

        // Two caches over one directory stand in for two CLI invocations
        let first = CredentialCache::new(FileCacheStore::new(tmp.path()))
            .with_clock(clock.clone());
        let second = CredentialCache::new(FileCacheStore::new(tmp.path()))
            .with_clock(clock.clone());

        let issued = first.get("prod", &provider, SKEW).unwrap();
        let reused = second.get("prod", &provider, SKEW).unwrap();

        assert_eq!(issued, reused);
        assert_eq!(provider.calls(), 1);
    }
}
