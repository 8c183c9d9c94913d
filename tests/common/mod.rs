//! Shared fixtures for the gateway integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, routing::get};
use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::JwkSet};
use parking_lot::Mutex;
use serde_json::{Value, json};

use rbac_gateway::clock::{Clock, ManualClock, SharedClock};
use rbac_gateway::config::{
    Config, IdentityConfig, ManagementConfig, RbacConfig, SessionConfig, SessionKeyConfig,
    UserAssignmentConfig,
};
use rbac_gateway::gateway::{Gateway, GatewayBuilder, ManagementClient, create_router};
use rbac_gateway::identity::{
    DelegationArtifact, ExchangeError, KeySet, SigningKey, StaticKeySource, TokenEndpoint,
    TokenGrant,
};

pub const ISSUER: &str = "https://login.example.test/contoso/v2.0";
pub const AUDIENCE: &str = "api://rbac-gateway";
pub const TENANT: &str = "contoso";

pub const KEY_A: &[u8] = include_bytes!("../fixtures/idp_signing_a.pem");
pub const KEY_B: &[u8] = include_bytes!("../fixtures/idp_signing_b.pem");

/// Public half of `KEY_A`, published under kid `a`.
pub fn published_keys() -> Vec<SigningKey> {
    let jwks: JwkSet = serde_json::from_value(json!({
        "keys": [{
            "kty": "EC", "crv": "P-256", "kid": "a", "alg": "ES256",
            "x": "YFW1WiU-wA_JJY0c3UxCW3IjgG9sy1PtRAt7rv8vhFs",
            "y": "A51yH583ls972xYo86luHlsj6ehO5bDgOV7I1B-gXDI"
        }]
    }))
    .unwrap();
    let set = KeySet::from_jwks(&jwks, chrono::Utc::now());
    set.get("a").into_iter().cloned().collect()
}

fn user(user_id: &str, tenant_id: &str, role: Option<&str>) -> UserAssignmentConfig {
    UserAssignmentConfig {
        user_id: user_id.to_string(),
        tenant_id: tenant_id.to_string(),
        role: role.map(str::to_string),
    }
}

/// Tenant `contoso` has one admin (alice), a maintainer (mia), a user (bob)
/// and a user without a role (nora). Tenant `fabrikam` has its own admin.
pub fn config() -> Config {
    let mut config = Config {
        identity: IdentityConfig {
            tenant_id: TENANT.to_string(),
            client_id: "rbac-gateway".to_string(),
            audience: Some(AUDIENCE.to_string()),
            issuers: vec![ISSUER.to_string()],
            clock_skew: Duration::ZERO,
            ..IdentityConfig::default()
        },
        session: SessionConfig {
            signing_keys: vec![SessionKeyConfig {
                kid: "k1".to_string(),
                secret: "an-internal-session-secret-of-32-bytes!".to_string(),
            }],
            ..SessionConfig::default()
        },
        management: ManagementConfig {
            subscription_id: "sub-1".to_string(),
            ..ManagementConfig::default()
        },
        rbac: RbacConfig {
            users: vec![
                user("alice", TENANT, Some("ADMIN")),
                user("mia", TENANT, Some("MAINTAINER")),
                user("bob", TENANT, Some("USER")),
                user("nora", TENANT, None),
                user("erin", "fabrikam", Some("ADMIN")),
            ],
            ..RbacConfig::default()
        },
        ..Config::default()
    };
    config.obo.retry.enabled = false;
    config
}

/// Claims of a valid external user token for `oid`.
pub fn external_claims(oid: &str, now: i64) -> Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "oid": oid,
        "sub": format!("pairwise-{oid}"),
        "tid": TENANT,
        "iat": now - 10,
        "nbf": now - 10,
        "exp": now + 7200,
        "scp": "access_as_user",
        "name": oid,
    })
}

/// Sign `claims` with `pem` under `kid`.
pub fn sign_with(pem: &[u8], kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_ec_pem(pem).unwrap()).unwrap()
}

/// Sign `claims` with the published key.
pub fn sign(claims: &Value) -> String {
    sign_with(KEY_A, "a", claims)
}

/// Token endpoint answering with a programmable outcome.
pub struct StubTokenEndpoint {
    pub calls: AtomicUsize,
    outcome: Mutex<Result<TokenGrant, ExchangeError>>,
}

impl StubTokenEndpoint {
    pub fn granting() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: Mutex::new(Ok(TokenGrant {
                access_token: "delegated-token".to_string(),
                expires_in: Duration::from_secs(3600),
            })),
        }
    }

    pub fn fail_with(&self, error: ExchangeError) {
        *self.outcome.lock() = Err(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for StubTokenEndpoint {
    async fn exchange(
        &self,
        artifact: &DelegationArtifact,
        _scope: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        assert!(!artifact.expose().is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.lock().clone()
    }
}

/// A running gateway and its collaborators.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<Gateway>,
    pub endpoint: Arc<StubTokenEndpoint>,
    pub base_url: String,
    pub http: reqwest::Client,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(config()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let endpoint = Arc::new(StubTokenEndpoint::granting());
        let management_url = serve(management_stub()).await;
        let management = ManagementClient::with_client(
            &ManagementConfig {
                base_url: management_url,
                ..config.management.clone()
            },
            reqwest::Client::new(),
        )
        .unwrap();

        let gateway = GatewayBuilder::new(&config)
            .clock(Arc::clone(&clock) as SharedClock)
            .key_source(Arc::new(
                StaticKeySource::new().with_keys(ISSUER, published_keys()),
            ))
            .token_endpoint(Arc::clone(&endpoint) as Arc<dyn TokenEndpoint>)
            .management(management)
            .build()
            .unwrap();
        let gateway = Arc::new(gateway);
        let base_url = serve(create_router(
            Arc::clone(&gateway),
            Duration::from_secs(10),
        ))
        .await;

        Self {
            clock,
            gateway,
            endpoint,
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn now(&self) -> i64 {
        self.clock.unix_now()
    }

    /// A valid external token for `oid`.
    pub fn external_token(&self, oid: &str) -> String {
        sign(&external_claims(oid, self.now()))
    }

    /// Exchange an external token for `oid` and return the session token.
    pub async fn session_for(&self, oid: &str) -> String {
        let response = self
            .http
            .post(self.url("/auth/exchange"))
            .json(&json!({"external_token": self.external_token(oid)}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }
}

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });
    format!("http://{addr}")
}

fn management_stub() -> Router {
    Router::new().route(
        "/subscriptions/sub-1/providers/Microsoft.Authorization/roleAssignments",
        get(|| async {
            Json(json!({
                "value": [{
                    "id": "/subscriptions/sub-1/providers/Microsoft.Authorization/roleAssignments/ra-1",
                    "name": "ra-1",
                    "properties": {
                        "roleDefinitionId": "/providers/Microsoft.Authorization/roleDefinitions/reader",
                        "principalId": "alice",
                        "principalType": "User",
                        "scope": "/subscriptions/sub-1"
                    }
                }]
            }))
        }),
    )
}
