//! Per-request authentication lifecycle.
//!
//! ```text
//! Unauthenticated ─► ExternalValidated ─► InternalIssued     (exchange)
//!        │                  └──────────► Authorized         (delegation)
//!        └─────────► InternalValidated ─► Authorized         (session)
//!
//! any non-terminal stage ─► Rejected(reason)
//! ```
//!
//! Transitions only move forward; anything else is a bug and surfaces as
//! [`GatewayError::Internal`].

use std::fmt;

use tracing::{debug, warn};

use super::GatewayError;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing checked yet.
    Unauthenticated,
    /// An external token passed validation.
    ExternalValidated,
    /// An internal session was minted.
    InternalIssued,
    /// An internal session token passed verification.
    InternalValidated,
    /// The policy engine allowed the action.
    Authorized,
    /// Stopped with a reason.
    Rejected(&'static str),
}

impl Stage {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::InternalIssued | Self::Authorized | Self::Rejected(_)
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::ExternalValidated => "external_validated",
            Self::InternalIssued => "internal_issued",
            Self::InternalValidated => "internal_validated",
            Self::Authorized => "authorized",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Forward-only state machine for one request.
#[derive(Debug)]
pub struct Lifecycle {
    flow: &'static str,
    stage: Stage,
}

impl Lifecycle {
    /// Start a lifecycle for `flow` (`exchange`, `session`, `delegation`).
    #[must_use]
    pub fn start(flow: &'static str) -> Self {
        Self {
            flow,
            stage: Stage::Unauthenticated,
        }
    }

    /// Continue a session whose token was verified earlier in the request.
    #[must_use]
    pub fn verified(flow: &'static str) -> Self {
        Self {
            flow,
            stage: Stage::InternalValidated,
        }
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: Stage) -> Result<(), GatewayError> {
        let allowed = matches!(
            (self.stage, next),
            (Stage::Unauthenticated, Stage::ExternalValidated | Stage::InternalValidated)
                | (Stage::ExternalValidated, Stage::InternalIssued | Stage::Authorized)
                | (Stage::InternalValidated, Stage::Authorized)
        );
        if !allowed {
            return Err(GatewayError::Internal(format!(
                "{} lifecycle cannot move from {} to {next}",
                self.flow, self.stage
            )));
        }
        debug!(flow = self.flow, from = %self.stage, to = %next, "Lifecycle transition");
        self.stage = next;
        Ok(())
    }

    /// Stop with `reason`. Ignored once a terminal stage was reached.
    pub fn reject(&mut self, reason: &'static str) {
        if self.stage.is_terminal() {
            warn!(flow = self.flow, stage = %self.stage, reason, "Rejection after terminal stage ignored");
            return;
        }
        debug!(flow = self.flow, from = %self.stage, reason, "Lifecycle rejected");
        self.stage = Stage::Rejected(reason);
    }
}
