//! Resource-management API client.
//!
//! Lists the role assignments of the configured subscription with a
//! delegated token. Paged responses are followed through `nextLink`, but
//! only while the link stays on the configured origin so the bearer token
//! is never sent elsewhere. A listing that cannot be completed is an error,
//! never a partial result.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::ManagementConfig;
use crate::identity::DelegatedAccessToken;
use crate::{Error, Result};

const MAX_PAGES: usize = 50;

/// Resource-management API failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagementError {
    /// The request could not be sent or timed out.
    #[error("Request failed: {0}")]
    Request(String),

    /// The API answered with an error status.
    #[error("API returned {status}: {code}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Provider error code, if the body had one.
        code: String,
    },

    /// The response body could not be understood.
    #[error("Unreadable response: {0}")]
    Decode(String),

    /// Paging stopped before the last page.
    #[error("Listing incomplete: {0}")]
    Truncated(String),
}

/// One role assignment, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleAssignment {
    /// Resource id of the assignment.
    pub id: String,
    /// Assignment name (a GUID).
    pub name: String,
    /// Scope the assignment applies to.
    pub scope: String,
    /// Resource id of the role definition.
    pub role_definition_id: String,
    /// Object id of the assignee.
    pub principal_id: String,
    /// `User`, `Group`, `ServicePrincipal`...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_type: Option<String>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<WireAssignment>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct WireAssignment {
    id: String,
    name: String,
    properties: WireProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProperties {
    #[serde(default)]
    scope: String,
    role_definition_id: String,
    principal_id: String,
    principal_type: Option<String>,
}

impl From<WireAssignment> for RoleAssignment {
    fn from(wire: WireAssignment) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            scope: wire.properties.scope,
            role_definition_id: wire.properties.role_definition_id,
            principal_id: wire.properties.principal_id,
            principal_type: wire.properties.principal_type,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
}

/// Client for the role assignment listing.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    base_url: Url,
    subscription_id: String,
    scope: String,
    api_version: String,
    http: reqwest::Client,
}

impl ManagementClient {
    /// Create a client. Only HTTPS URLs are contacted.
    pub fn new(config: &ManagementConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(config.timeout)
            .build()?;
        Self::with_client(config, http)
    }

    /// Create a client over a preconfigured HTTP client.
    pub fn with_client(config: &ManagementConfig, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("management.base_url: {e}")))?;
        if config.subscription_id.is_empty() {
            return Err(Error::Config("management.subscription_id is empty".into()));
        }
        Ok(Self {
            base_url,
            subscription_id: config.subscription_id.clone(),
            scope: config.scope.clone(),
            api_version: config.api_version.clone(),
            http,
        })
    }

    /// Delegated scope the API expects.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn first_page(&self) -> String {
        format!(
            "{}/subscriptions/{}/providers/Microsoft.Authorization/roleAssignments",
            self.base_url.as_str().trim_end_matches('/'),
            self.subscription_id
        )
    }

    fn same_origin(&self, link: &str) -> bool {
        Url::parse(link).is_ok_and(|url| url.origin() == self.base_url.origin())
    }

    /// Every role assignment of the subscription.
    pub async fn list_role_assignments(
        &self,
        token: &DelegatedAccessToken,
    ) -> std::result::Result<Vec<RoleAssignment>, ManagementError> {
        let mut assignments = Vec::new();
        let mut request = self
            .http
            .get(self.first_page())
            .query(&[("api-version", self.api_version.as_str())]);

        for page_number in 1..=MAX_PAGES {
            let page = self.fetch(request, &token.access_token).await?;
            assignments.extend(page.value.into_iter().map(RoleAssignment::from));

            match page.next_link {
                Some(link) if self.same_origin(&link) => {
                    request = self.http.get(link);
                }
                Some(_) => {
                    warn!(pages = page_number, "Refusing nextLink to a foreign origin");
                    return Err(ManagementError::Truncated(
                        "nextLink points to a foreign origin".into(),
                    ));
                }
                None => {
                    debug!(pages = page_number, count = assignments.len(), "Role assignments listed");
                    return Ok(assignments);
                }
            }
        }

        warn!(max_pages = MAX_PAGES, "Role assignment listing exceeds the page limit");
        Err(ManagementError::Truncated(format!(
            "more than {MAX_PAGES} pages"
        )))
    }

    async fn fetch(
        &self,
        request: reqwest::RequestBuilder,
        bearer: &str,
    ) -> std::result::Result<Page, ManagementError> {
        let response = request
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ManagementError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error)
                .and_then(|d| d.code)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ManagementError::Status {
                status: status.as_u16(),
                code,
            });
        }

        response
            .json::<Page>()
            .await
            .map_err(|e| ManagementError::Decode(e.to_string()))
    }
}
