//! Internal session tokens.
//!
//! Sessions are HS256 JWS tokens signed with a gateway-held secret. The
//! signing key ring is ordered: the first key signs, every key verifies, so a
//! new key can be prepended while tokens signed by the old one are still in
//! circulation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::external::{
    ExternalClaims, ValidationError, check_time_window, classify_jwt_error, signature_only,
    split_token, timestamp,
};
use crate::clock::{SharedClock, elapsed, plus};
use crate::config::{SessionConfig, TtlPolicy, resolve_secret};
use crate::{Error, Result};

/// A signing/verification secret.
pub struct SessionKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKey {
    /// Key from a shared secret.
    #[must_use]
    pub fn from_secret(kid: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Key from 256 random bits. Sessions signed with it die with the process.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::from_secret(
            format!("ephemeral-{}", uuid::Uuid::new_v4().simple()),
            &random_secret(),
        )
    }

    /// Key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }
}

fn random_secret() -> [u8; 32] {
    rand::rng().random()
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Ordered session keys; the first one signs.
#[derive(Debug)]
pub struct SessionKeyRing {
    keys: Vec<SessionKey>,
}

impl SessionKeyRing {
    /// Ring over `keys`. Fails when empty.
    pub fn new(keys: Vec<SessionKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::KeyMaterial("session key ring is empty".into()));
        }
        Ok(Self { keys })
    }

    /// Keys from configuration, or a single ephemeral key when none are
    /// configured.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        if config.signing_keys.is_empty() {
            warn!("No session signing keys configured, using an ephemeral key");
            return Self::new(vec![SessionKey::ephemeral()]);
        }

        let keys = config
            .signing_keys
            .iter()
            .map(|k| {
                let secret = resolve_secret(&k.secret)?;
                if secret.len() < 32 {
                    warn!(kid = %k.kid, "Session signing secret is shorter than 32 bytes");
                }
                if secret.is_empty() {
                    return Err(Error::KeyMaterial(format!("session key {} is empty", k.kid)));
                }
                Ok(SessionKey::from_secret(&k.kid, secret.as_bytes()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys)
    }

    /// The signing key.
    #[must_use]
    pub fn active(&self) -> &SessionKey {
        &self.keys[0]
    }

    /// Verification key by id.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&SessionKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    fn all(&self) -> &[SessionKey] {
        &self.keys
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    tid: String,
    iss: String,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    roles: Option<BTreeSet<String>>,
}

/// A validated or freshly issued internal session.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct InternalSession {
    /// `jti`.
    pub session_id: String,
    /// User id the session was issued to.
    pub user_id: String,
    /// Tenant of the user.
    pub tenant_id: String,
    /// Role names embedded at issuance, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeSet<String>>,
    /// `iat`.
    pub issued_at: DateTime<Utc>,
    /// `exp`.
    pub expires_at: DateTime<Utc>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User principal name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    /// The signed compact token.
    #[serde(skip)]
    pub token: String,
}

impl InternalSession {
    /// Lifetime granted at issuance, in seconds.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        elapsed(self.issued_at, self.expires_at).as_secs()
    }
}

impl fmt::Debug for InternalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("roles", &self.roles)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"[redacted]")
            .finish_non_exhaustive()
    }
}

/// Who a session is issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubject {
    /// User id.
    pub user_id: String,
    /// Tenant id.
    pub tenant_id: String,
    /// Display name.
    pub name: Option<String>,
    /// User principal name.
    pub upn: Option<String>,
    /// Role names to embed.
    pub roles: Option<BTreeSet<String>>,
}

impl SessionSubject {
    /// Subject with only the identifying fields set.
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            name: None,
            upn: None,
            roles: None,
        }
    }
}

impl From<&ExternalClaims> for SessionSubject {
    fn from(claims: &ExternalClaims) -> Self {
        Self {
            user_id: claims.subject.clone(),
            tenant_id: claims.tenant_id.clone(),
            name: claims.name.clone(),
            upn: claims.upn.clone(),
            roles: None,
        }
    }
}

/// Session issuance failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    /// The external token has no lifetime left to bound the session by.
    #[error("External token has no remaining lifetime")]
    NoRemainingLifetime,

    /// Signing failed.
    #[error("Failed to sign session: {0}")]
    Signing(String),
}

/// Mints internal sessions.
pub struct SessionIssuer {
    keys: Arc<SessionKeyRing>,
    clock: SharedClock,
    issuer: String,
    ttl: Duration,
    policy: TtlPolicy,
}

impl SessionIssuer {
    /// Create an issuer.
    pub fn new(keys: Arc<SessionKeyRing>, clock: SharedClock, config: &SessionConfig) -> Self {
        Self {
            keys,
            clock,
            issuer: config.issuer.clone(),
            ttl: config.ttl,
            policy: config.ttl_policy,
        }
    }

    /// Issue a session for a validated external identity.
    ///
    /// The lifetime is the configured TTL, or under
    /// [`TtlPolicy::BoundedByExternal`] the smaller of the TTL and the
    /// external token's remaining lifetime.
    pub fn issue(&self, claims: &ExternalClaims) -> std::result::Result<InternalSession, IssueError> {
        let ttl = match self.policy {
            TtlPolicy::Fixed => self.ttl,
            TtlPolicy::BoundedByExternal => {
                let remaining = claims.remaining(self.clock.now());
                if remaining.as_secs() == 0 {
                    return Err(IssueError::NoRemainingLifetime);
                }
                remaining.min(self.ttl)
            }
        };
        self.issue_for(SessionSubject::from(claims), ttl)
    }

    /// Issue a session for `subject` lasting `ttl`, capped at the configured
    /// TTL.
    pub fn issue_for(
        &self,
        subject: SessionSubject,
        ttl: Duration,
    ) -> std::result::Result<InternalSession, IssueError> {
        let ttl = Duration::from_secs(ttl.min(self.ttl).as_secs());
        let issued_at = timestamp_floor(self.clock.now());
        let expires_at = plus(issued_at, ttl);
        let session_id = uuid::Uuid::new_v4().to_string();

        let key = self.keys.active();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(key.kid.clone());

        let claims = SessionClaims {
            sub: subject.user_id,
            tid: subject.tenant_id,
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: session_id.clone(),
            name: subject.name,
            upn: subject.upn,
            roles: subject.roles,
        };
        let token = jsonwebtoken::encode(&header, &claims, &key.encoding)
            .map_err(|e| IssueError::Signing(e.to_string()))?;

        debug!(
            session_id = %session_id,
            user = %claims.sub,
            tenant = %claims.tid,
            ttl_secs = ttl.as_secs(),
            "Issued internal session"
        );

        Ok(InternalSession {
            session_id,
            user_id: claims.sub,
            tenant_id: claims.tid,
            roles: claims.roles,
            issued_at,
            expires_at,
            name: claims.name,
            upn: claims.upn,
            token,
        })
    }
}

/// Validates internal sessions.
pub struct SessionVerifier {
    keys: Arc<SessionKeyRing>,
    clock: SharedClock,
    issuer: String,
    pinned_tenant: Option<String>,
    clock_skew: Duration,
}

impl SessionVerifier {
    /// Create a verifier.
    pub fn new(keys: Arc<SessionKeyRing>, clock: SharedClock, config: &SessionConfig) -> Self {
        Self {
            keys,
            clock,
            issuer: config.issuer.clone(),
            pinned_tenant: config.pinned_tenant.clone(),
            clock_skew: config.clock_skew,
        }
    }

    /// Validate a session token.
    pub fn verify(&self, raw: &str) -> std::result::Result<InternalSession, ValidationError> {
        let (header, _) = split_token(raw)?;
        if header.alg != Algorithm::HS256 {
            return Err(ValidationError::BadSignature(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }

        let validation = signature_only(Algorithm::HS256);
        let claims = match header.kid.as_deref() {
            Some(kid) => {
                let key = self
                    .keys
                    .find(kid)
                    .ok_or_else(|| ValidationError::UnknownKey(kid.to_string()))?;
                jsonwebtoken::decode::<SessionClaims>(raw, &key.decoding, &validation)
                    .map_err(classify_jwt_error)?
                    .claims
            }
            None => self.decode_with_any_key(raw)?,
        };

        if claims.iss != self.issuer {
            return Err(ValidationError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: claims.iss,
            });
        }

        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        check_time_window(self.clock.unix_now(), skew, claims.exp, None, Some(claims.iat))?;

        if let Some(ref pinned) = self.pinned_tenant {
            if &claims.tid != pinned {
                return Err(ValidationError::TenantNotAllowed(claims.tid));
            }
        }

        Ok(InternalSession {
            session_id: claims.jti,
            user_id: claims.sub,
            tenant_id: claims.tid,
            roles: claims.roles,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
            name: claims.name,
            upn: claims.upn,
            token: raw.to_string(),
        })
    }

    fn decode_with_any_key(&self, raw: &str) -> std::result::Result<SessionClaims, ValidationError> {
        let validation = signature_only(Algorithm::HS256);
        let mut last = ValidationError::BadSignature("no verification key".into());
        for key in self.keys.all() {
            match jsonwebtoken::decode::<SessionClaims>(raw, &key.decoding, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => last = classify_jwt_error(e),
            }
            if matches!(last, ValidationError::Malformed(_)) {
                break;
            }
        }
        Err(last)
    }
}

fn timestamp_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}
