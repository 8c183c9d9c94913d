//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rbac_core::{RankRequirement, Role};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// External identity provider
    pub identity: IdentityConfig,
    /// Signing key cache
    pub keys: KeyCacheConfig,
    /// Internal session tokens
    pub session: SessionConfig,
    /// On-behalf-of delegation
    pub obo: OboConfig,
    /// Downstream resource-management API
    pub management: ManagementConfig,
    /// Roles, assignments and rank requirements
    pub rbac: RbacConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Whole-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// External identity provider (Azure AD / Entra ID style tenant)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL of the identity provider
    pub authority: String,
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Application (client) id of this API
    pub client_id: String,
    /// Client secret used for delegation (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Expected `aud`; defaults to `api://<client_id>`
    pub audience: Option<String>,
    /// Accepted issuers; defaults to the v2 and legacy STS issuer of the tenant
    pub issuers: Vec<String>,
    /// JWKS document URL; defaults to the tenant discovery keys endpoint
    pub jwks_uri: Option<String>,
    /// Token endpoint for delegation; defaults to the tenant v2 endpoint
    pub token_endpoint: Option<String>,
    /// Scope every user token must carry
    pub required_scope: String,
    /// Client ids whose app-only tokens are accepted without the user scope
    pub app_client_ids: Vec<String>,
    /// Tolerated clock skew for `iat`/`nbf`/`exp`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            authority: "https://login.microsoftonline.com".to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            audience: None,
            issuers: Vec::new(),
            jwks_uri: None,
            token_endpoint: None,
            required_scope: "access_as_user".to_string(),
            app_client_ids: Vec::new(),
            clock_skew: Duration::from_secs(60),
        }
    }
}

impl IdentityConfig {
    fn authority(&self) -> &str {
        self.authority.trim_end_matches('/')
    }

    /// Expected audience
    #[must_use]
    pub fn audience(&self) -> String {
        self.audience
            .clone()
            .unwrap_or_else(|| format!("api://{}", self.client_id))
    }

    /// Accepted issuers, primary first
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        if !self.issuers.is_empty() {
            return self.issuers.clone();
        }
        vec![
            format!("{}/{}/v2.0", self.authority(), self.tenant_id),
            format!("https://sts.windows.net/{}/", self.tenant_id),
        ]
    }

    /// JWKS document URL
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.jwks_uri.clone().unwrap_or_else(|| {
            format!("{}/{}/discovery/v2.0/keys", self.authority(), self.tenant_id)
        })
    }

    /// Token endpoint for the delegation grant
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.token_endpoint.clone().unwrap_or_else(|| {
            format!("{}/{}/oauth2/v2.0/token", self.authority(), self.tenant_id)
        })
    }

    /// Resolve the client secret (expand `env:` indirection)
    pub fn resolve_client_secret(&self) -> Result<Option<String>> {
        self.client_secret.as_deref().map(resolve_secret).transpose()
    }
}

/// Signing key cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// Age after which a key set is refetched
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Age after which a key set is never served, even if refetching fails
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Minimum spacing between refreshes triggered by the same unknown key id
    #[serde(with = "humantime_serde")]
    pub unknown_key_debounce: Duration,
    /// Timeout for one key set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Time a stale key set is served without retrying after a failed fetch
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            unknown_key_debounce: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(30),
        }
    }
}

/// How the internal session lifetime relates to the external token's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TtlPolicy {
    /// Always the configured TTL
    #[default]
    Fixed,
    /// `min(external token remaining lifetime, configured TTL)`
    BoundedByExternal,
}

/// One internal session signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyConfig {
    /// Key id placed in the token header
    pub kid: String,
    /// HMAC secret (supports `env:VAR_NAME`)
    pub secret: String,
}

/// Internal session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `iss` of internal tokens
    pub issuer: String,
    /// Lifetime cap
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Lifetime policy
    pub ttl_policy: TtlPolicy,
    /// Verification keys; the first one also signs new sessions
    pub signing_keys: Vec<SessionKeyConfig>,
    /// Reject sessions of any other tenant
    pub pinned_tenant: Option<String>,
    /// Tolerated clock skew for `iat`/`exp`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            issuer: "rbac-gateway".to_string(),
            ttl: Duration::from_secs(3600),
            ttl_policy: TtlPolicy::Fixed,
            signing_keys: Vec::new(),
            pinned_tenant: None,
            clock_skew: Duration::from_secs(30),
        }
    }
}

/// On-behalf-of delegation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OboConfig {
    /// Cached tokens are not served within this margin of their expiry
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Timeout for one token endpoint request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl Default for OboConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Downstream resource-management API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// API base URL
    pub base_url: String,
    /// Subscription the role assignments are listed for
    pub subscription_id: String,
    /// Delegated scope requested for the API
    pub scope: String,
    /// `api-version` query parameter
    pub api_version: String,
    /// Timeout for one API request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            base_url: "https://management.azure.com".to_string(),
            subscription_id: String::new(),
            scope: "https://management.azure.com/.default".to_string(),
            api_version: "2022-04-01".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// A user's role assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAssignmentConfig {
    /// User id (the identity provider object id)
    pub user_id: String,
    /// Tenant the user belongs to
    pub tenant_id: String,
    /// Role id or name; absent means no role
    #[serde(default)]
    pub role: Option<String>,
}

/// Roles, assignments and rank requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    /// Role catalogue
    pub roles: Vec<Role>,
    /// Initial user assignments
    pub users: Vec<UserAssignmentConfig>,
    /// Per `(action, resource)` rank overrides
    pub requirements: Vec<RankRequirement>,
    /// How long resolved roles are cached
    #[serde(with = "humantime_serde")]
    pub role_cache_ttl: Duration,
    /// Timeout for one role store lookup
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            roles: rbac_core::default_roles(),
            users: Vec::new(),
            requirements: Vec::new(),
            role_cache_ttl: Duration::from_secs(300),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file and `RBAC_GATEWAY_`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("RBAC_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.session.ttl.is_zero() {
            return Err(Error::Config("session.ttl must be greater than zero".into()));
        }
        if self.keys.max_age < self.keys.refresh_interval {
            return Err(Error::Config(
                "keys.max_age must be at least keys.refresh_interval".into(),
            ));
        }
        if self.rbac.roles.is_empty() {
            return Err(Error::Config("rbac.roles must not be empty".into()));
        }
        for (i, role) in self.rbac.roles.iter().enumerate() {
            if self.rbac.roles[..i]
                .iter()
                .any(|r| r.id == role.id || r.name == role.name)
            {
                return Err(Error::Config(format!("duplicate role: {}", role.name)));
            }
        }
        for user in &self.rbac.users {
            if let Some(ref wanted) = user.role {
                if !self
                    .rbac
                    .roles
                    .iter()
                    .any(|r| &r.id == wanted || r.name.eq_ignore_ascii_case(wanted))
                {
                    return Err(Error::Config(format!(
                        "user {} references unknown role {wanted}",
                        user.user_id
                    )));
                }
            }
        }
        for key in &self.session.signing_keys {
            if key.kid.is_empty() {
                return Err(Error::Config("session signing key without kid".into()));
            }
        }
        url::Url::parse(&self.management.base_url)
            .map_err(|e| Error::Config(format!("management.base_url: {e}")))?;
        Ok(())
    }
}

/// Resolve a secret value: `env:VAR_NAME` reads the variable, anything else
/// is taken literally.
pub fn resolve_secret(value: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name)
            .map_err(|_| Error::Config(format!("environment variable {var_name} is not set"))),
        None => Ok(value.to_string()),
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration ("100ms", "30s", "5m", "1h"; bare
    /// numbers are seconds)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("{s:?}: {e}"));
        }
        let (number, unit) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        number
            .parse::<u64>()
            .map_err(|e| format!("{s:?}: {e}"))?
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("{s:?} is out of range"))
    }
}
