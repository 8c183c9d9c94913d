//! External (identity provider) access token validation.
//!
//! # Verification order
//!
//! Checks short-circuit on the first failure:
//!
//! 1. Structure (three base64url segments, JSON header and payload).
//! 2. `kid` resolved through the [`KeyResolver`].
//! 3. Signature, using the algorithm bound to the resolved key. A header
//!    `alg` that differs from it is rejected before any cryptography runs.
//! 4. `iss`.
//! 5. `aud` (string or array).
//! 6. `exp`, `nbf` and `iat`, with clock skew.
//! 7. Required delegated scope in `scp`. App-only tokens from configured
//!    client ids are exempt.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::keys::{KeyError, KeyResolver};
use crate::clock::SharedClock;
use crate::config::IdentityConfig;

/// Why a token (external or internal) was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Not a well-formed compact JWS, or a required claim is missing.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The `kid` is not published by the issuer.
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature or algorithm check failed.
    #[error("Bad signature: {0}")]
    BadSignature(String),

    /// `iss` is not the expected issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Expected issuer.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// `aud` does not contain the expected audience.
    #[error("Audience mismatch: expected {0}")]
    AudienceMismatch(String),

    /// `exp` has passed.
    #[error("Token expired at {0}")]
    Expired(i64),

    /// `nbf` or `iat` is in the future.
    #[error("Token not valid before {0}")]
    NotYetValid(i64),

    /// Required scope missing from `scp`.
    #[error("Missing required scope: {0}")]
    InsufficientScope(String),

    /// The token's tenant is not accepted here.
    #[error("Tenant not allowed: {0}")]
    TenantNotAllowed(String),

    /// Signing keys could not be obtained.
    #[error("Key resolution failed: {0}")]
    KeyResolutionFailed(String),
}

impl ValidationError {
    /// Stable snake_case name, used in audit records and error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownKey(_) => "unknown_key",
            Self::BadSignature(_) => "bad_signature",
            Self::IssuerMismatch { .. } => "issuer_mismatch",
            Self::AudienceMismatch(_) => "audience_mismatch",
            Self::Expired(_) => "expired",
            Self::NotYetValid(_) => "not_yet_valid",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::TenantNotAllowed(_) => "tenant_not_allowed",
            Self::KeyResolutionFailed(_) => "key_resolution_failed",
        }
    }
}

impl From<KeyError> for ValidationError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::NotFound { key_id, .. } => Self::UnknownKey(key_id),
            KeyError::ResolutionFailed { .. } => Self::KeyResolutionFailed(e.to_string()),
        }
    }
}

/// Claims of a successfully validated external token.
///
/// Only [`ExternalTokenValidator`] produces values of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct ExternalClaims {
    /// Stable user id: `oid` when present, else `sub`.
    pub subject: String,
    /// Directory (tenant) id from `tid`.
    pub tenant_id: String,
    /// Audiences the token was issued for.
    pub audience: Vec<String>,
    /// Issuer.
    pub issuer: String,
    /// Delegated scopes from `scp`.
    pub scopes: BTreeSet<String>,
    /// `exp`.
    pub expires_at: DateTime<Utc>,
    /// `iat`.
    pub issued_at: DateTime<Utc>,
    /// Client id of an app-only token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User principal name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
}

impl ExternalClaims {
    /// Lifetime left at `now`; zero once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        crate::clock::elapsed(now, self.expires_at)
    }

    /// Whether the token carries `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    aud: serde_json::Value,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    scp: Option<String>,
    #[serde(default)]
    appid: Option<String>,
    #[serde(default)]
    azp: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    upn: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

/// Only the issuer is read before the signature is checked.
#[derive(Debug, Deserialize)]
struct UnverifiedIssuer {
    #[serde(default)]
    iss: Option<String>,
}

/// Validation settings that do not vary per call.
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// Scope every user token must carry.
    pub required_scope: String,
    /// Client ids whose app-only tokens skip the scope check.
    pub app_client_ids: Vec<String>,
    /// Tolerated clock skew.
    pub clock_skew: Duration,
}

impl From<&IdentityConfig> for ValidatorSettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            required_scope: config.required_scope.clone(),
            app_client_ids: config.app_client_ids.clone(),
            clock_skew: config.clock_skew,
        }
    }
}

/// Validates identity provider access tokens.
pub struct ExternalTokenValidator {
    keys: Arc<KeyResolver>,
    clock: SharedClock,
    settings: ValidatorSettings,
}

impl ExternalTokenValidator {
    /// Create a validator.
    pub fn new(keys: Arc<KeyResolver>, clock: SharedClock, settings: ValidatorSettings) -> Self {
        Self {
            keys,
            clock,
            settings,
        }
    }

    /// Validate `raw_token` against one issuer and audience.
    pub async fn validate(
        &self,
        raw_token: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<ExternalClaims, ValidationError> {
        let (header, _) = split_token(raw_token)?;

        let kid = header
            .kid
            .clone()
            .ok_or_else(|| ValidationError::UnknownKey("token header has no kid".into()))?;
        let key = self.keys.resolve(expected_issuer, &kid).await?;

        if header.alg != key.algorithm {
            return Err(ValidationError::BadSignature(format!(
                "algorithm {:?} does not match key {kid} ({:?})",
                header.alg, key.algorithm
            )));
        }
        let claims = jsonwebtoken::decode::<RawClaims>(
            raw_token,
            &key.key,
            &signature_only(key.algorithm),
        )
        .map_err(classify_jwt_error)?
        .claims;

        let issuer = claims.iss.clone().unwrap_or_default();
        if issuer != expected_issuer {
            return Err(ValidationError::IssuerMismatch {
                expected: expected_issuer.to_string(),
                actual: issuer,
            });
        }

        let audience = audiences(&claims.aud);
        if !audience.iter().any(|a| a == expected_audience) {
            return Err(ValidationError::AudienceMismatch(expected_audience.to_string()));
        }

        let exp = claims
            .exp
            .ok_or_else(|| ValidationError::Malformed("missing exp".into()))?;
        let now = self.clock.unix_now();
        check_time_window(now, self.skew_secs(), exp, claims.nbf, claims.iat)?;

        let scopes: BTreeSet<String> = claims
            .scp
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let app_id = claims.appid.clone().or_else(|| claims.azp.clone());
        let app_only = claims.scp.is_none()
            && app_id
                .as_ref()
                .is_some_and(|id| self.settings.app_client_ids.contains(id));
        if !app_only && !scopes.contains(&self.settings.required_scope) {
            return Err(ValidationError::InsufficientScope(
                self.settings.required_scope.clone(),
            ));
        }

        let subject = claims
            .oid
            .or(claims.sub)
            .ok_or_else(|| ValidationError::Malformed("missing oid and sub".into()))?;
        let tenant_id = claims
            .tid
            .ok_or_else(|| ValidationError::Malformed("missing tid".into()))?;

        debug!(subject = %subject, tenant = %tenant_id, app_only, "External token validated");

        Ok(ExternalClaims {
            subject,
            tenant_id,
            audience,
            issuer,
            scopes,
            expires_at: timestamp(exp)?,
            issued_at: timestamp(claims.iat.unwrap_or(now))?,
            app_id: if app_only { app_id } else { None },
            name: claims.name,
            upn: claims.upn.or(claims.preferred_username),
        })
    }

    /// Validate against whichever of `issuers` the token names, falling back
    /// to the first one so a foreign issuer reports `IssuerMismatch`.
    pub async fn validate_any(
        &self,
        raw_token: &str,
        expected_audience: &str,
        issuers: &[String],
    ) -> Result<ExternalClaims, ValidationError> {
        let (_, payload) = split_token(raw_token)?;
        let claimed = serde_json::from_slice::<UnverifiedIssuer>(&payload)
            .ok()
            .and_then(|c| c.iss);
        let issuer = claimed
            .and_then(|iss| issuers.iter().find(|candidate| **candidate == iss))
            .or_else(|| issuers.first())
            .ok_or_else(|| ValidationError::IssuerMismatch {
                expected: String::new(),
                actual: "no issuer configured".into(),
            })?;

        self.validate(raw_token, expected_audience, issuer).await
    }

    fn skew_secs(&self) -> i64 {
        i64::try_from(self.settings.clock_skew.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Structural parse: the decoded header and raw payload bytes.
pub(crate) fn split_token(raw: &str) -> Result<(Header, Vec<u8>), ValidationError> {
    let segments: Vec<&str> = raw.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(ValidationError::Malformed(
            "expected three non-empty segments".into(),
        ));
    }
    let header = jsonwebtoken::decode_header(raw)
        .map_err(|e| ValidationError::Malformed(format!("header: {e}")))?;
    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|e| ValidationError::Malformed(format!("payload: {e}")))?;
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&payload)
        .map_err(|e| ValidationError::Malformed(format!("payload: {e}")))?;
    Ok((header, payload))
}

/// Signature-only validation: every claim is checked by hand against the
/// injected clock.
pub(crate) fn signature_only(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

pub(crate) fn classify_jwt_error(e: jsonwebtoken::errors::Error) -> ValidationError {
    match e.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            ValidationError::Malformed(e.to_string())
        }
        _ => ValidationError::BadSignature(e.to_string()),
    }
}

/// `exp`, `nbf` and `iat` against `now` with `skew` seconds of tolerance.
pub(crate) fn check_time_window(
    now: i64,
    skew: i64,
    exp: i64,
    nbf: Option<i64>,
    iat: Option<i64>,
) -> Result<(), ValidationError> {
    if now > exp.saturating_add(skew) {
        return Err(ValidationError::Expired(exp));
    }
    if let Some(nbf) = nbf {
        if now < nbf.saturating_sub(skew) {
            return Err(ValidationError::NotYetValid(nbf));
        }
    }
    if let Some(iat) = iat {
        if now < iat.saturating_sub(skew) {
            return Err(ValidationError::NotYetValid(iat));
        }
    }
    Ok(())
}

pub(crate) fn timestamp(secs: i64) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ValidationError::Malformed(format!("timestamp out of range: {secs}")))
}

fn audiences(aud: &serde_json::Value) -> Vec<String> {
    match aud {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(values) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
