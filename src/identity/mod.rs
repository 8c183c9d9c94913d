//! Identity: external token validation, internal sessions and on-behalf-of
//! delegation.

pub mod audit;
pub mod external;
pub mod keys;
pub mod obo;
pub mod session;

pub use external::{ExternalClaims, ExternalTokenValidator, ValidationError, ValidatorSettings};
pub use keys::{JwksSource, KeyError, KeyResolver, KeySet, KeySource, SigningKey, StaticKeySource};
pub use obo::{
    DelegatedAccessToken, DelegationArtifact, DelegationKey, ExchangeError, HttpTokenEndpoint,
    OboClient, TokenEndpoint, TokenGrant,
};
pub use session::{
    InternalSession, IssueError, SessionIssuer, SessionKey, SessionKeyRing, SessionSubject,
    SessionVerifier,
};
