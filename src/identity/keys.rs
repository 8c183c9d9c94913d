//! Issuer signing keys: JWKS fetching and caching.
//!
//! # Cache behaviour
//!
//! - A key set younger than `refresh_interval` is served from memory.
//! - Older sets are refetched. If the refetch fails and the set is still
//!   younger than `max_age`, the stale set keeps serving; past `max_age` the
//!   failure surfaces as [`KeyError::ResolutionFailed`].
//! - After a failed refetch the stale set is served without retrying for
//!   `failure_backoff`.
//! - Concurrent misses for one issuer share a single fetch.
//! - An unknown `kid` forces one refetch, at most once per
//!   `(issuer, kid)` within `unknown_key_debounce`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse},
};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, elapsed};
use crate::config::KeyCacheConfig;
use crate::singleflight::SingleFlight;

/// Key lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The issuer's key set does not contain a usable key with this id.
    #[error("Signing key {key_id} not found for {issuer}")]
    NotFound {
        /// Issuer that was searched.
        issuer: String,
        /// Requested key id.
        key_id: String,
    },

    /// The key source could not be reached and no usable cached set exists.
    #[error("Key resolution failed for {issuer}: {reason}")]
    ResolutionFailed {
        /// Issuer whose keys were requested.
        issuer: String,
        /// Underlying failure.
        reason: String,
    },
}

impl KeyError {
    fn resolution(issuer: &str, reason: impl fmt::Display) -> Self {
        Self::ResolutionFailed {
            issuer: issuer.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A public verification key published by an issuer.
#[derive(Clone)]
pub struct SigningKey {
    /// `kid` the issuer publishes the key under.
    pub key_id: String,
    /// The only algorithm this key verifies.
    pub algorithm: Algorithm,
    /// Verification key material.
    pub key: DecodingKey,
    /// Start of the key's validity window.
    pub not_before: Option<DateTime<Utc>>,
    /// End of the key's validity window.
    pub not_after: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Build a key with no validity window.
    pub fn new(key_id: impl Into<String>, algorithm: Algorithm, key: DecodingKey) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm,
            key,
            not_before: None,
            not_after: None,
        }
    }

    /// Convert a published JWK.
    ///
    /// Returns `None` for keys without a `kid`, encryption keys, symmetric
    /// keys and unsupported curves.
    #[must_use]
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let key_id = jwk.common.key_id.clone()?;
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let algorithm = jwk_algorithm(jwk)?;
        let key = DecodingKey::from_jwk(jwk).ok()?;
        Some(Self::new(key_id, algorithm, key))
    }

    /// Whether `at` falls inside the key's validity window.
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|nbf| at >= nbf) && self.not_after.is_none_or(|naf| at <= naf)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// The verification algorithm a JWK is bound to.
///
/// The declared `alg` wins; otherwise it follows from the key type. Symmetric
/// algorithms are never accepted from a public key set.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    match &jwk.common.key_algorithm {
        Some(KeyAlgorithm::RS256) => Some(Algorithm::RS256),
        Some(KeyAlgorithm::RS384) => Some(Algorithm::RS384),
        Some(KeyAlgorithm::RS512) => Some(Algorithm::RS512),
        Some(KeyAlgorithm::PS256) => Some(Algorithm::PS256),
        Some(KeyAlgorithm::PS384) => Some(Algorithm::PS384),
        Some(KeyAlgorithm::PS512) => Some(Algorithm::PS512),
        Some(KeyAlgorithm::ES256) => Some(Algorithm::ES256),
        Some(KeyAlgorithm::ES384) => Some(Algorithm::ES384),
        Some(KeyAlgorithm::EdDSA) => Some(Algorithm::EdDSA),
        Some(_) => None,
        None => match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
            AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
                EllipticCurve::P256 => Some(Algorithm::ES256),
                EllipticCurve::P384 => Some(Algorithm::ES384),
                _ => None,
            },
            AlgorithmParameters::OctetKeyPair(okp) => {
                matches!(okp.curve, EllipticCurve::Ed25519).then_some(Algorithm::EdDSA)
            }
            AlgorithmParameters::OctetKey(_) => None,
        },
    }
}

/// One issuer's keys as of one fetch.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: Vec<SigningKey>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Build a set; later duplicates of a `kid` are dropped.
    #[must_use]
    pub fn new(keys: Vec<SigningKey>, fetched_at: DateTime<Utc>) -> Self {
        let mut unique: Vec<SigningKey> = Vec::with_capacity(keys.len());
        for key in keys {
            if unique.iter().any(|k| k.key_id == key.key_id) {
                warn!(kid = %key.key_id, "Duplicate key id in key set, keeping the first");
                continue;
            }
            unique.push(key);
        }
        Self {
            keys: unique,
            fetched_at,
        }
    }

    /// Convert a JWKS document, skipping keys that cannot verify signatures.
    #[must_use]
    pub fn from_jwks(jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| {
                let key = SigningKey::from_jwk(jwk);
                if key.is_none() {
                    debug!(kid = ?jwk.common.key_id, "Skipping unusable JWK");
                }
                key
            })
            .collect();
        Self::new(keys, fetched_at)
    }

    /// Key with this id, if present.
    #[must_use]
    pub fn get(&self, key_id: &str) -> Option<&SigningKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    /// When the set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in publication order.
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.key_id.as_str())
    }
}

/// Where an issuer's keys come from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Fetch the current keys of `issuer`.
    async fn fetch(&self, issuer: &str) -> Result<Vec<SigningKey>, KeyError>;
}

/// Fetches JWKS documents over HTTP.
pub struct JwksSource {
    uris: HashMap<String, String>,
    http: reqwest::Client,
}

impl JwksSource {
    /// Create a source that maps each issuer to its JWKS URL. Only HTTPS
    /// endpoints are contacted.
    pub fn new(uris: HashMap<String, String>, timeout: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(uris, http))
    }

    /// Create a source using a preconfigured client.
    #[must_use]
    pub fn with_client(uris: HashMap<String, String>, http: reqwest::Client) -> Self {
        Self { uris, http }
    }
}

#[async_trait]
impl KeySource for JwksSource {
    async fn fetch(&self, issuer: &str) -> Result<Vec<SigningKey>, KeyError> {
        let uri = self
            .uris
            .get(issuer)
            .ok_or_else(|| KeyError::resolution(issuer, "no JWKS endpoint configured"))?;

        debug!(issuer = %issuer, "Fetching JWKS from {uri}");
        let response = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(|e| KeyError::resolution(issuer, e))?;
        if !response.status().is_success() {
            return Err(KeyError::resolution(
                issuer,
                format!("JWKS endpoint returned {}", response.status()),
            ));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| KeyError::resolution(issuer, e))?;

        Ok(KeySet::from_jwks(&jwks, Utc::now()).keys)
    }
}

/// Fixed keys per issuer, for pinned deployments and tests.
#[derive(Default)]
pub struct StaticKeySource {
    keys: HashMap<String, Vec<SigningKey>>,
}

impl StaticKeySource {
    /// Empty source; every issuer resolves to an empty key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `keys` for `issuer`.
    #[must_use]
    pub fn with_keys(mut self, issuer: impl Into<String>, keys: Vec<SigningKey>) -> Self {
        self.keys.entry(issuer.into()).or_default().extend(keys);
        self
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self, issuer: &str) -> Result<Vec<SigningKey>, KeyError> {
        Ok(self.keys.get(issuer).cloned().unwrap_or_default())
    }
}

/// Caching, coalescing front of a [`KeySource`].
pub struct KeyResolver {
    source: Arc<dyn KeySource>,
    sets: Arc<DashMap<String, Arc<KeySet>>>,
    flights: SingleFlight<String, Arc<KeySet>, KeyError>,
    unknown: DashMap<(String, String), DateTime<Utc>>,
    failures: DashMap<String, DateTime<Utc>>,
    clock: SharedClock,
    config: KeyCacheConfig,
}

/// Unknown-kid bookkeeping is pruned once it grows past this many entries.
const UNKNOWN_KEY_PRUNE_THRESHOLD: usize = 1024;

impl KeyResolver {
    /// Create a resolver over `source`.
    pub fn new(source: Arc<dyn KeySource>, clock: SharedClock, config: KeyCacheConfig) -> Self {
        Self {
            source,
            sets: Arc::new(DashMap::new()),
            flights: SingleFlight::new(),
            unknown: DashMap::new(),
            failures: DashMap::new(),
            clock,
            config,
        }
    }

    /// Resolve the key `key_id` of `issuer`.
    pub async fn resolve(&self, issuer: &str, key_id: &str) -> Result<SigningKey, KeyError> {
        let now = self.clock.now();
        let set = self.current_set(issuer, now).await?;
        if let Some(key) = set.get(key_id).filter(|k| k.is_valid_at(now)) {
            return Ok(key.clone());
        }

        let not_found = || KeyError::NotFound {
            issuer: issuer.to_string(),
            key_id: key_id.to_string(),
        };

        if elapsed(set.fetched_at(), now) < self.config.unknown_key_debounce
            || !self.claim_unknown_refresh(issuer, key_id, now)
        {
            debug!(issuer = %issuer, kid = %key_id, "Unknown key id, refresh debounced");
            return Err(not_found());
        }

        info!(issuer = %issuer, kid = %key_id, "Unknown key id, refreshing key set");
        let set = self.refresh(issuer).await?;
        set.get(key_id)
            .filter(|k| k.is_valid_at(now))
            .cloned()
            .ok_or_else(not_found)
    }

    /// Drop the cached set of `issuer`.
    pub fn invalidate(&self, issuer: &str) {
        self.sets.remove(issuer);
    }

    /// Cached set of `issuer`, if any.
    #[must_use]
    pub fn cached(&self, issuer: &str) -> Option<Arc<KeySet>> {
        self.sets.get(issuer).map(|entry| Arc::clone(entry.value()))
    }

    async fn current_set(&self, issuer: &str, now: DateTime<Utc>) -> Result<Arc<KeySet>, KeyError> {
        let Some(set) = self.cached(issuer) else {
            return self.refresh(issuer).await;
        };

        let age = elapsed(set.fetched_at(), now);
        if age < self.config.refresh_interval {
            return Ok(set);
        }
        if age >= self.config.max_age {
            return self.refresh(issuer).await;
        }

        if self
            .failures
            .get(issuer)
            .is_some_and(|failed_at| elapsed(*failed_at, now) < self.config.failure_backoff)
        {
            debug!(issuer = %issuer, "Key refresh backing off, serving stale key set");
            return Ok(set);
        }

        match self.refresh(issuer).await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                self.failures.insert(issuer.to_string(), now);
                warn!(
                    issuer = %issuer,
                    age_secs = age.as_secs(),
                    error = %e,
                    "Key refresh failed, serving stale key set"
                );
                Ok(set)
            }
        }
    }

    /// Fetch `issuer`'s keys and replace the cached set. Concurrent callers
    /// share one fetch.
    async fn refresh(&self, issuer: &str) -> Result<Arc<KeySet>, KeyError> {
        let source = Arc::clone(&self.source);
        let sets = Arc::clone(&self.sets);
        let clock = Arc::clone(&self.clock);
        let timeout = self.config.fetch_timeout;
        let owned = issuer.to_string();

        let refreshed = self.flights
            .run(issuer.to_string(), move || async move {
                let keys = tokio::time::timeout(timeout, source.fetch(&owned))
                    .await
                    .map_err(|_| {
                        KeyError::resolution(&owned, format!("fetch timed out after {timeout:?}"))
                    })??;
                let set = Arc::new(KeySet::new(keys, clock.now()));
                debug!(issuer = %owned, keys = set.len(), "Key set refreshed");
                sets.insert(owned, Arc::clone(&set));
                Ok(set)
            })
            .await;
        if refreshed.is_ok() {
            self.failures.remove(issuer);
        }
        refreshed
    }

    /// Record a forced refresh for an unknown `(issuer, kid)`. Returns `false`
    /// when one already happened inside the debounce window.
    fn claim_unknown_refresh(&self, issuer: &str, key_id: &str, now: DateTime<Utc>) -> bool {
        let debounce = self.config.unknown_key_debounce;
        if self.unknown.len() > UNKNOWN_KEY_PRUNE_THRESHOLD {
            self.unknown.retain(|_, at| elapsed(*at, now) < debounce);
        }

        let mut claimed = false;
        self.unknown
            .entry((issuer.to_string(), key_id.to_string()))
            .and_modify(|at| {
                if elapsed(*at, now) >= debounce {
                    *at = now;
                    claimed = true;
                }
            })
            .or_insert_with(|| {
                claimed = true;
                now
            });
        claimed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    const ISSUER: &str = "https://idp.test/tenant/v2.0";

    fn hmac_key(kid: &str) -> SigningKey {
        SigningKey::new(kid, Algorithm::HS256, DecodingKey::from_secret(kid.as_bytes()))
    }

    /// Counts fetches, optionally fails or stalls.
    struct StubSource {
        keys: Mutex<Vec<SigningKey>>,
        fetches: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    impl StubSource {
        fn new(kids: &[&str]) -> Self {
            Self {
                keys: Mutex::new(kids.iter().map(|k| hmac_key(k)).collect()),
                fetches: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn slow(kids: &[&str], delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(kids)
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for StubSource {
        async fn fetch(&self, issuer: &str) -> Result<Vec<SigningKey>, KeyError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(KeyError::resolution(issuer, "connection refused"));
            }
            Ok(self.keys.lock().clone())
        }
    }

    fn resolver(source: &Arc<StubSource>, clock: &Arc<ManualClock>) -> KeyResolver {
        KeyResolver::new(
            Arc::clone(source) as Arc<dyn KeySource>,
            Arc::clone(clock) as SharedClock,
            KeyCacheConfig {
                refresh_interval: Duration::from_secs(3600),
                max_age: Duration::from_secs(7200),
                unknown_key_debounce: Duration::from_secs(30),
                fetch_timeout: Duration::from_millis(200),
                failure_backoff: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test]
    async fn fresh_cache_hit_does_not_refetch() {
        // GIVEN: a resolver that already fetched the set once
        let source = Arc::new(StubSource::new(&["k1"]));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);
        keys.resolve(ISSUER, "k1").await.unwrap();

        // WHEN: resolving again within the refresh interval
        clock.advance(Duration::from_secs(60));
        let key = keys.resolve(ISSUER, "k1").await.unwrap();

        // THEN: served from memory
        assert_eq!(key.key_id, "k1");
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        // GIVEN: a slow key source and a cold cache
        let source = Arc::new(StubSource::slow(&["k1"], Duration::from_millis(50)));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = Arc::new(resolver(&source, &clock));

        // WHEN: 50 lookups race
        let mut handles = Vec::new();
        for _ in 0..50 {
            let keys = Arc::clone(&keys);
            handles.push(tokio::spawn(async move { keys.resolve(ISSUER, "k1").await }));
        }

        // THEN: all succeed off one fetch
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_once_per_debounce_window() {
        // GIVEN: a cached set fetched a while ago
        let source = Arc::new(StubSource::new(&["k1"]));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);
        keys.resolve(ISSUER, "k1").await.unwrap();
        clock.advance(Duration::from_secs(120));

        // WHEN: an unknown kid is looked up twice in a row
        let first = keys.resolve(ISSUER, "rogue").await;
        let second = keys.resolve(ISSUER, "rogue").await;

        // THEN: one forced refresh, both NotFound
        assert!(matches!(first, Err(KeyError::NotFound { .. })));
        assert!(matches!(second, Err(KeyError::NotFound { .. })));
        assert_eq!(source.fetches(), 2);

        // WHEN: the debounce window has passed
        clock.advance(Duration::from_secs(31));
        let _ = keys.resolve(ISSUER, "rogue").await;

        // THEN: another refresh is allowed
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn rotated_key_is_picked_up_by_forced_refresh() {
        // GIVEN: the issuer rotates in a new key after the set was cached
        let source = Arc::new(StubSource::new(&["k1"]));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);
        keys.resolve(ISSUER, "k1").await.unwrap();
        source.keys.lock().push(hmac_key("k2"));
        clock.advance(Duration::from_secs(60));

        // WHEN: a token signed with the new key arrives
        let key = keys.resolve(ISSUER, "k2").await.unwrap();

        // THEN: the refreshed set replaced the old one
        assert_eq!(key.key_id, "k2");
        let cached = keys.cached(ISSUER).unwrap();
        assert_eq!(cached.key_ids().collect::<Vec<_>>(), vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn stale_set_served_while_refresh_fails_until_ceiling() {
        // GIVEN: a cached set and a key source that went down
        let source = Arc::new(StubSource::new(&["k1"]));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);
        keys.resolve(ISSUER, "k1").await.unwrap();
        source.failing.store(true, Ordering::SeqCst);

        // WHEN: past the refresh interval but under the ceiling
        clock.advance(Duration::from_secs(3700));
        let stale = keys.resolve(ISSUER, "k1").await;

        // THEN: the stale key still verifies
        assert!(stale.is_ok());

        // WHEN: past the hard ceiling
        clock.advance(Duration::from_secs(3600));
        let expired = keys.resolve(ISSUER, "k1").await;

        // THEN: resolution fails
        assert!(matches!(expired, Err(KeyError::ResolutionFailed { .. })));
    }

    #[tokio::test]
    async fn failed_refresh_backs_off_before_retrying() {
        // GIVEN: a stale set whose source is down
        let source = Arc::new(StubSource::new(&["k1"]));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);
        keys.resolve(ISSUER, "k1").await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(3700));

        // WHEN: resolving repeatedly inside the backoff
        for _ in 0..5 {
            assert!(keys.resolve(ISSUER, "k1").await.is_ok());
        }

        // THEN: one failed refetch, the rest served stale
        assert_eq!(source.fetches(), 2);

        // WHEN: the backoff passes and the source recovers
        clock.advance(Duration::from_secs(31));
        source.failing.store(false, Ordering::SeqCst);
        keys.resolve(ISSUER, "k1").await.unwrap();

        // THEN: refetched, and the fresh set is served from memory again
        assert_eq!(source.fetches(), 3);
        keys.resolve(ISSUER, "k1").await.unwrap();
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn cold_cache_fetch_failure_surfaces() {
        let source = Arc::new(StubSource::new(&["k1"]));
        source.failing.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);

        let result = keys.resolve(ISSUER, "k1").await;

        assert!(matches!(result, Err(KeyError::ResolutionFailed { .. })));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = Arc::new(StubSource::slow(&["k1"], Duration::from_secs(5)));
        let clock = Arc::new(ManualClock::starting_now());
        let keys = resolver(&source, &clock);

        let result = keys.resolve(ISSUER, "k1").await;

        match result {
            Err(KeyError::ResolutionFailed { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn key_outside_validity_window_is_not_served() {
        // GIVEN: a key that expired an hour ago
        let clock = Arc::new(ManualClock::starting_now());
        let mut retired = hmac_key("old");
        retired.not_after = Some(clock.now() - chrono::TimeDelta::hours(1));
        let keys = KeyResolver::new(
            Arc::new(StaticKeySource::new().with_keys(ISSUER, vec![retired])),
            Arc::clone(&clock) as SharedClock,
            KeyCacheConfig::default(),
        );

        // WHEN/THEN: lookups treat it as unknown
        assert!(matches!(
            keys.resolve(ISSUER, "old").await,
            Err(KeyError::NotFound { .. })
        ));
    }

    #[test]
    fn key_set_keeps_first_duplicate() {
        let now = Utc::now();
        let mut second = hmac_key("k1");
        second.algorithm = Algorithm::HS512;

        let set = KeySet::new(vec![hmac_key("k1"), second], now);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("k1").unwrap().algorithm, Algorithm::HS256);
    }

    #[test]
    fn jwks_conversion_binds_algorithm_and_skips_symmetric_keys() {
        // GIVEN: a JWKS with an EC key without `alg` and an octet key
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                {
                    "kty": "EC",
                    "crv": "P-256",
                    "kid": "ec1",
                    "use": "sig",
                    "x": "YFW1WiU-wA_JJY0c3UxCW3IjgG9sy1PtRAt7rv8vhFs",
                    "y": "A51yH583ls972xYo86luHlsj6ehO5bDgOV7I1B-gXDI"
                },
                { "kty": "oct", "kid": "sym", "k": "c2VjcmV0" }
            ]
        }))
        .unwrap();

        // WHEN: converted
        let set = KeySet::from_jwks(&jwks, Utc::now());

        // THEN: only the EC key survives, bound to ES256
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("ec1").unwrap().algorithm, Algorithm::ES256);
        assert!(set.get("sym").is_none());
    }

    #[tokio::test]
    async fn jwks_source_fetches_over_http() {
        // GIVEN: a local JWKS endpoint
        let app = axum::Router::new().route(
            "/keys",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({
                    "keys": [{
                        "kty": "EC",
                        "crv": "P-256",
                        "kid": "ec1",
                        "alg": "ES256",
                        "x": "YFW1WiU-wA_JJY0c3UxCW3IjgG9sy1PtRAt7rv8vhFs",
                        "y": "A51yH583ls972xYo86luHlsj6ehO5bDgOV7I1B-gXDI"
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let source = JwksSource::with_client(
            HashMap::from([(ISSUER.to_string(), format!("http://{addr}/keys"))]),
            reqwest::Client::new(),
        );

        // WHEN: fetched
        let keys = source.fetch(ISSUER).await.unwrap();

        // THEN: the key is converted
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, "ec1");

        // AND: an unmapped issuer is a resolution failure
        assert!(matches!(
            source.fetch("https://other").await,
            Err(KeyError::ResolutionFailed { .. })
        ));
    }
}
