//! On-behalf-of delegation: trading a user's external token for a token
//! scoped to a downstream API.
//!
//! Results are cached per `(subject, tenant, scope)` until `safety_margin`
//! before the provider's expiry. Concurrent misses for one key share a single
//! upstream exchange, and only `Unavailable` failures are retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, plus};
use crate::config::OboConfig;
use crate::retry::{RetryPolicy, with_retry};
use crate::singleflight::SingleFlight;

/// OAuth grant type of the on-behalf-of flow.
pub const OBO_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Delegation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// The provider refused to delegate for this user.
    #[error("Delegation denied: {0}")]
    DelegationDenied(String),

    /// The provider could not be reached or failed transiently.
    #[error("Token endpoint unavailable: {0}")]
    Unavailable(String),

    /// The requested scope is not valid for this application.
    #[error("Invalid scope: {0}")]
    InvalidScope(String),
}

impl ExchangeError {
    /// Only transient failures are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DelegationDenied(_) => "delegation_denied",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidScope(_) => "invalid_scope",
        }
    }
}

/// The user's external token, handed over for exactly one exchange.
///
/// Neither cloneable nor serializable; the only way to read it is from inside
/// a [`TokenEndpoint`].
pub struct DelegationArtifact(String);

impl DelegationArtifact {
    /// Wrap a raw external token.
    pub fn new(raw_token: impl Into<String>) -> Self {
        Self(raw_token.into())
    }

    /// The raw token, for building the exchange request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DelegationArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegationArtifact([redacted])")
    }
}

/// A downstream token obtained by delegation.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedAccessToken {
    /// Scope the token was issued for.
    pub scope: String,
    /// Bearer token for the downstream API.
    pub access_token: String,
    /// Provider-reported expiry.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for DelegatedAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedAccessToken")
            .field("scope", &self.scope)
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Cache key of a delegated token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelegationKey {
    /// User id.
    pub subject: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Requested scope.
    pub scope: String,
}

impl DelegationKey {
    /// Build a key.
    pub fn new(subject: &str, tenant_id: &str, scope: &str) -> Self {
        Self {
            subject: subject.to_string(),
            tenant_id: tenant_id.to_string(),
            scope: scope.to_string(),
        }
    }
}

/// A successful token endpoint response.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Issued access token.
    pub access_token: String,
    /// Lifetime reported by the provider.
    pub expires_in: Duration,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[redacted]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// The identity provider's token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync + 'static {
    /// Run one on-behalf-of exchange.
    async fn exchange(
        &self,
        artifact: &DelegationArtifact,
        scope: &str,
    ) -> Result<TokenGrant, ExchangeError>;
}

/// OAuth 2.0 token endpoint speaking the on-behalf-of form protocol.
pub struct HttpTokenEndpoint {
    url: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl HttpTokenEndpoint {
    /// Create an endpoint client. Only HTTPS URLs are contacted.
    pub fn new(
        url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(url, client_id, client_secret, http))
    }

    /// Create an endpoint client over a preconfigured HTTP client.
    pub fn with_client(
        url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
        }
    }
}

impl fmt::Debug for HttpTokenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTokenEndpoint")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Seconds,
}

/// Providers disagree on whether `expires_in` is a number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    fn to_duration(&self) -> Option<Duration> {
        match self {
            Self::Number(n) => Some(Duration::from_secs(*n)),
            Self::Text(s) => s.trim().parse().ok().map(Duration::from_secs),
        }
    }
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange(
        &self,
        artifact: &DelegationArtifact,
        scope: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        let form = [
            ("grant_type", OBO_GRANT_TYPE),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("assertion", artifact.expose()),
            ("scope", scope),
            ("requested_token_use", "on_behalf_of"),
        ];

        let response = self
            .http
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorResponse = response.json().await.unwrap_or_default();
            return Err(classify_provider_error(
                status,
                body.error.as_deref(),
                body.error_description.as_deref(),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("unreadable token response: {e}")))?;
        let expires_in = body.expires_in.to_duration().ok_or_else(|| {
            ExchangeError::Unavailable("token response has an invalid expires_in".into())
        })?;

        Ok(TokenGrant {
            access_token: body.access_token,
            expires_in,
        })
    }
}

/// Map an OAuth error response onto [`ExchangeError`].
#[must_use]
pub fn classify_provider_error(
    status: StatusCode,
    error: Option<&str>,
    description: Option<&str>,
) -> ExchangeError {
    let detail = match (error, description) {
        (Some(code), Some(text)) => format!("{code}: {text}"),
        (Some(code), None) => code.to_string(),
        (None, _) => format!("HTTP {status}"),
    };

    match error {
        Some("invalid_scope") => ExchangeError::InvalidScope(detail),
        Some(
            "invalid_grant" | "consent_required" | "interaction_required" | "unauthorized_client"
            | "access_denied",
        ) => ExchangeError::DelegationDenied(detail),
        Some("temporarily_unavailable") => ExchangeError::Unavailable(detail),
        _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            ExchangeError::Unavailable(detail)
        }
        _ => ExchangeError::DelegationDenied(detail),
    }
}

/// Expired tokens are swept from the cache once it grows past this many
/// entries.
const CACHE_SWEEP_THRESHOLD: usize = 1024;

/// Caching, coalescing on-behalf-of client.
pub struct OboClient {
    endpoint: Arc<dyn TokenEndpoint>,
    cache: Arc<DashMap<DelegationKey, DelegatedAccessToken>>,
    flights: SingleFlight<DelegationKey, DelegatedAccessToken, ExchangeError>,
    clock: SharedClock,
    safety_margin: Duration,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OboClient {
    /// Create a client over `endpoint`.
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, clock: SharedClock, config: &OboConfig) -> Self {
        Self {
            endpoint,
            cache: Arc::new(DashMap::new()),
            flights: SingleFlight::new(),
            clock,
            safety_margin: config.safety_margin,
            timeout: config.timeout,
            retry: RetryPolicy::new(&config.retry),
        }
    }

    /// Obtain a token for `scope` acting as `subject`.
    ///
    /// `artifact` is consumed: it is dropped as soon as the exchange it
    /// feeds has finished, or immediately when a cached token or an already
    /// running exchange serves the call.
    pub async fn exchange(
        &self,
        subject: &str,
        tenant_id: &str,
        artifact: DelegationArtifact,
        scope: &str,
    ) -> Result<DelegatedAccessToken, ExchangeError> {
        let key = DelegationKey::new(subject, tenant_id, scope);
        if let Some(hit) = self.cached(&key) {
            debug!(subject = %subject, scope = %scope, "Delegated token served from cache");
            return Ok(hit);
        }
        self.fetch(key, artifact).await
    }

    /// Join or start the exchange for `key`. A flight started just after
    /// another one filled the cache is served from the cache.
    async fn fetch(
        &self,
        key: DelegationKey,
        artifact: DelegationArtifact,
    ) -> Result<DelegatedAccessToken, ExchangeError> {
        let endpoint = Arc::clone(&self.endpoint);
        let cache = Arc::clone(&self.cache);
        let clock = Arc::clone(&self.clock);
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let safety_margin = self.safety_margin;
        let flight_key = key.clone();

        self.flights
            .run(key, move || async move {
                if let Some(hit) = fresh(&cache, &flight_key, clock.now(), safety_margin) {
                    debug!(
                        subject = %flight_key.subject,
                        scope = %flight_key.scope,
                        "Delegated token cached by an earlier exchange"
                    );
                    return Ok(hit);
                }

                let scope = flight_key.scope.clone();
                let attempt = || async {
                    tokio::time::timeout(timeout, endpoint.exchange(&artifact, &scope))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ExchangeError::Unavailable(format!(
                                "token endpoint timed out after {timeout:?}"
                            )))
                        })
                };
                let outcome =
                    with_retry(&retry, "obo_exchange", attempt, ExchangeError::is_retryable).await;
                drop(artifact);

                let grant = match outcome {
                    Ok(grant) => grant,
                    Err(e) => {
                        warn!(
                            subject = %flight_key.subject,
                            scope = %scope,
                            error = %e,
                            "On-behalf-of exchange failed"
                        );
                        return Err(e);
                    }
                };

                let token = DelegatedAccessToken {
                    scope,
                    access_token: grant.access_token,
                    expires_at: plus(clock.now(), grant.expires_in),
                };
                info!(
                    subject = %flight_key.subject,
                    scope = %token.scope,
                    expires_at = %token.expires_at,
                    "Delegated token obtained"
                );
                cache.insert(flight_key, token.clone());
                if cache.len() > CACHE_SWEEP_THRESHOLD {
                    let deadline = plus(clock.now(), safety_margin);
                    cache.retain(|_, cached| deadline < cached.expires_at);
                    debug!(remaining = cache.len(), "Swept expired delegated tokens");
                }
                Ok(token)
            })
            .await
    }

    /// Cached token for `key` if it is outside the safety margin.
    #[must_use]
    pub fn cached(&self, key: &DelegationKey) -> Option<DelegatedAccessToken> {
        let now = self.clock.now();
        let hit = fresh(&self.cache, key, now, self.safety_margin);
        if hit.is_none() {
            let deadline = plus(now, self.safety_margin);
            self.cache.remove_if(key, |_, token| deadline >= token.expires_at);
        }
        hit
    }

    /// Forget every cached token of `subject` in `tenant_id`.
    pub fn evict_subject(&self, subject: &str, tenant_id: &str) {
        self.cache
            .retain(|key, _| !(key.subject == subject && key.tenant_id == tenant_id));
    }
}

fn fresh(
    cache: &DashMap<DelegationKey, DelegatedAccessToken>,
    key: &DelegationKey,
    now: DateTime<Utc>,
    safety_margin: Duration,
) -> Option<DelegatedAccessToken> {
    let deadline = plus(now, safety_margin);
    cache
        .get(key)
        .filter(|entry| deadline < entry.expires_at)
        .map(|entry| entry.value().clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Form, Json, Router, http::StatusCode as HttpStatus, routing::post};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RetryConfig;

    /// Scripted endpoint: pops one outcome per call, repeats the last.
    struct ScriptedEndpoint {
        script: Mutex<Vec<Result<TokenGrant, ExchangeError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<Result<TokenGrant, ExchangeError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn exchange(
            &self,
            artifact: &DelegationArtifact,
            scope: &str,
        ) -> Result<TokenGrant, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(artifact.expose(), "external-token");
            assert!(!scope.is_empty());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn grant(secs: u64) -> Result<TokenGrant, ExchangeError> {
        Ok(TokenGrant {
            access_token: format!("downstream-{secs}"),
            expires_in: Duration::from_secs(secs),
        })
    }

    fn config() -> OboConfig {
        OboConfig {
            safety_margin: Duration::from_secs(60),
            timeout: Duration::from_millis(500),
            retry: RetryConfig {
                enabled: true,
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
        }
    }

    fn client(endpoint: &Arc<ScriptedEndpoint>, clock: &Arc<ManualClock>) -> OboClient {
        OboClient::new(
            Arc::clone(endpoint) as Arc<dyn TokenEndpoint>,
            Arc::clone(clock) as SharedClock,
            &config(),
        )
    }

    fn artifact() -> DelegationArtifact {
        DelegationArtifact::new("external-token")
    }

    const SCOPE: &str = "https://management.example.test/.default";

    #[tokio::test]
    async fn hundred_concurrent_exchanges_make_one_upstream_call() {
        // GIVEN: a slow token endpoint
        let endpoint = Arc::new(ScriptedEndpoint {
            delay: Duration::from_millis(50),
            ..ScriptedEndpoint::new(vec![grant(3600)])
        });
        let clock = Arc::new(ManualClock::starting_now());
        let obo = Arc::new(client(&endpoint, &clock));

        // WHEN: 100 callers exchange for the same user and scope at once
        let mut handles = Vec::new();
        for _ in 0..100 {
            let obo = Arc::clone(&obo);
            handles.push(tokio::spawn(async move {
                obo.exchange("user-1", "contoso", artifact(), SCOPE).await
            }));
        }

        // THEN: one upstream call, everyone gets the same token
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(endpoint.calls(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn cached_token_respects_safety_margin() {
        // GIVEN: a token valid for 120 s and a 60 s safety margin
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![grant(120)]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);
        let first = obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();

        // WHEN: 59 s later
        clock.advance(Duration::from_secs(59));
        let again = obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();

        // THEN: served from cache with the provider's expiry unchanged
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(again.expires_at, first.expires_at);

        // WHEN: inside the safety margin
        clock.advance(Duration::from_secs(2));
        let _ = obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();

        // THEN: a fresh exchange happened
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_subject_tenant_and_scope() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![grant(3600)]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);

        obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();
        obo.exchange("user-2", "contoso", artifact(), SCOPE).await.unwrap();
        obo.exchange("user-1", "fabrikam", artifact(), SCOPE).await.unwrap();
        obo.exchange("user-1", "contoso", artifact(), "api://other/.default")
            .await
            .unwrap();

        assert_eq!(endpoint.calls(), 4);

        obo.evict_subject("user-1", "contoso");
        obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();
        assert_eq!(endpoint.calls(), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_bound() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            Err(ExchangeError::Unavailable("503".into())),
            Err(ExchangeError::Unavailable("503".into())),
            grant(3600),
        ]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);

        let token = obo.exchange("user-1", "contoso", artifact(), SCOPE).await;

        assert!(token.is_ok());
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Err(ExchangeError::Unavailable(
            "down".into(),
        ))]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);

        let result = obo.exchange("user-1", "contoso", artifact(), SCOPE).await;

        assert_eq!(result, Err(ExchangeError::Unavailable("down".into())));
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn refusals_are_not_retried_or_cached() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            Err(ExchangeError::DelegationDenied("consent_required".into())),
            grant(3600),
        ]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);

        let denied = obo.exchange("user-1", "contoso", artifact(), SCOPE).await;
        assert!(matches!(denied, Err(ExchangeError::DelegationDenied(_))));
        assert_eq!(endpoint.calls(), 1);

        assert!(obo.exchange("user-1", "contoso", artifact(), SCOPE).await.is_ok());
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_as_unavailable() {
        let endpoint = Arc::new(ScriptedEndpoint {
            delay: Duration::from_secs(5),
            ..ScriptedEndpoint::new(vec![grant(3600)])
        });
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = config();
        config.timeout = Duration::from_millis(20);
        config.retry.enabled = false;
        let obo = OboClient::new(
            Arc::clone(&endpoint) as Arc<dyn TokenEndpoint>,
            Arc::clone(&clock) as SharedClock,
            &config,
        );

        let result = obo.exchange("user-1", "contoso", artifact(), SCOPE).await;

        assert!(matches!(result, Err(ExchangeError::Unavailable(_))));
    }

    #[test]
    fn provider_errors_are_classified() {
        let cases = [
            (400, Some("invalid_grant"), "delegation_denied"),
            (400, Some("consent_required"), "delegation_denied"),
            (400, Some("interaction_required"), "delegation_denied"),
            (400, Some("unauthorized_client"), "delegation_denied"),
            (400, Some("invalid_scope"), "invalid_scope"),
            (401, None, "delegation_denied"),
            (403, None, "delegation_denied"),
            (429, None, "unavailable"),
            (500, None, "unavailable"),
            (503, Some("temporarily_unavailable"), "unavailable"),
        ];
        for (status, code, expected) in cases {
            let status = StatusCode::from_u16(status).unwrap();
            assert_eq!(
                classify_provider_error(status, code, None).kind(),
                expected,
                "{status} {code:?}"
            );
        }
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        assert_eq!(format!("{:?}", artifact()), "DelegationArtifact([redacted])");
        let token = DelegatedAccessToken {
            scope: SCOPE.into(),
            access_token: "very-secret".into(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{token:?}").contains("very-secret"));
        let endpoint = HttpTokenEndpoint::with_client("https://idp", "cid", "csecret", reqwest::Client::new());
        assert!(!format!("{endpoint:?}").contains("csecret"));
    }

    async fn spawn_token_endpoint(
        reply: (HttpStatus, serde_json::Value),
    ) -> (String, Arc<Mutex<Option<HashMap<String, String>>>>) {
        let seen = Arc::new(Mutex::new(None));
        let recorder = Arc::clone(&seen);
        let app = Router::new().route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let recorder = Arc::clone(&recorder);
                let reply = reply.clone();
                async move {
                    *recorder.lock() = Some(form);
                    (reply.0, Json(reply.1))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}/token"), seen)
    }

    #[tokio::test]
    async fn http_endpoint_posts_the_on_behalf_of_form() {
        // GIVEN: a local token endpoint
        let (url, seen) = spawn_token_endpoint((
            HttpStatus::OK,
            serde_json::json!({
                "token_type": "Bearer",
                "access_token": "downstream",
                "expires_in": "3599"
            }),
        ))
        .await;
        let endpoint = HttpTokenEndpoint::with_client(&url, "api-client", "s3cret", reqwest::Client::new());

        // WHEN: an exchange runs
        let grant = endpoint.exchange(&artifact(), SCOPE).await.unwrap();

        // THEN: the grant is parsed and the form carries every OBO field
        assert_eq!(grant.access_token, "downstream");
        assert_eq!(grant.expires_in, Duration::from_secs(3599));
        let form = seen.lock().clone().unwrap();
        assert_eq!(form["grant_type"], OBO_GRANT_TYPE);
        assert_eq!(form["client_id"], "api-client");
        assert_eq!(form["client_secret"], "s3cret");
        assert_eq!(form["assertion"], "external-token");
        assert_eq!(form["scope"], SCOPE);
        assert_eq!(form["requested_token_use"], "on_behalf_of");
    }

    #[tokio::test]
    async fn http_endpoint_maps_oauth_errors() {
        let (url, _) = spawn_token_endpoint((
            HttpStatus::BAD_REQUEST,
            serde_json::json!({
                "error": "invalid_grant",
                "error_description": "AADSTS50013: assertion failed signature validation"
            }),
        ))
        .await;
        let endpoint = HttpTokenEndpoint::with_client(&url, "api-client", "s3cret", reqwest::Client::new());

        let err = endpoint.exchange(&artifact(), SCOPE).await.unwrap_err();

        assert!(matches!(err, ExchangeError::DelegationDenied(ref d) if d.starts_with("invalid_grant")));
    }

    #[tokio::test]
    async fn exchange_started_after_a_fill_uses_the_cache() {
        // GIVEN: a token cached by an exchange that finished just before
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![grant(3600)]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);
        let key = DelegationKey::new("user-1", "contoso", SCOPE);
        let cached = DelegatedAccessToken {
            scope: SCOPE.to_string(),
            access_token: "already-there".into(),
            expires_at: plus(clock.now(), Duration::from_secs(3600)),
        };
        obo.cache.insert(key.clone(), cached.clone());

        // WHEN: a caller that missed the cache a moment earlier starts its flight
        let token = obo.fetch(key, artifact()).await.unwrap();

        // THEN: no second upstream exchange
        assert_eq!(token, cached);
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn expired_tokens_are_swept_once_the_cache_grows() {
        // GIVEN: more expired tokens than the sweep threshold
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![grant(3600)]));
        let clock = Arc::new(ManualClock::starting_now());
        let obo = client(&endpoint, &clock);
        for i in 0..=CACHE_SWEEP_THRESHOLD {
            obo.cache.insert(
                DelegationKey::new(&format!("gone-{i}"), "contoso", SCOPE),
                DelegatedAccessToken {
                    scope: SCOPE.to_string(),
                    access_token: format!("old-{i}"),
                    expires_at: plus(clock.now(), Duration::from_secs(30)),
                },
            );
        }

        // WHEN: one more user exchanges
        obo.exchange("user-1", "contoso", artifact(), SCOPE).await.unwrap();

        // THEN: only the live token remains
        assert_eq!(obo.cache.len(), 1);
        assert!(obo.cached(&DelegationKey::new("user-1", "contoso", SCOPE)).is_some());
    }
}
