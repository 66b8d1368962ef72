//! Client-credentials token request and token caching
//!
//! SharePoint app-only tokens come from ACS, not from the SharePoint host:
//! `POST {authority}/{tenant_id}/tokens/OAuth/2` with a form body. The
//! `client_id` and `resource` fields are both qualified with the tenant,
//! and the resource names the SharePoint host the token is valid for.

use std::time::{Duration, Instant};

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{
    DEFAULT_TOKEN_LIFETIME_SECS, GRANT_TYPE, REFRESH_SKEW_SECS, SHAREPOINT_PRINCIPAL,
};
use crate::error::{Error, Result};

/// Credentials for one site, already resolved to a concrete tenant and domain.
#[derive(Debug, Clone, Copy)]
pub struct ClientCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a Secret<String>,
    pub tenant_id: &'a str,
    pub domain: &'a str,
}

impl ClientCredentials<'_> {
    /// `{authority}/{tenant_id}/tokens/OAuth/2`
    pub fn token_endpoint(&self, authority: &str) -> String {
        format!(
            "{}/{}/tokens/OAuth/2",
            authority.trim_end_matches('/'),
            self.tenant_id
        )
    }

    /// `{client_id}@{tenant_id}`
    pub fn qualified_client_id(&self) -> String {
        format!("{}@{}", self.client_id, self.tenant_id)
    }

    /// `00000003-0000-0ff1-ce00-000000000000/{domain}@{tenant_id}`
    pub fn resource(&self) -> String {
        format!("{SHAREPOINT_PRINCIPAL}/{}@{}", self.domain, self.tenant_id)
    }
}

/// Response from the token endpoint.
///
/// ACS sends `expires_in` as a quoted string; numbers are accepted too.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default = "default_expires_in", deserialize_with = "common::lenient_u64")]
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

fn default_expires_in() -> u64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

/// Request an app-only access token with the client-credentials grant.
///
/// 401/403 map to `InvalidCredentials`; any other non-success status or an
/// unparseable body maps to `TokenRequest`. Transport failures map to `Http`.
pub async fn request_app_token(
    client: &reqwest::Client,
    authority: &str,
    credentials: ClientCredentials<'_>,
) -> Result<TokenResponse> {
    let endpoint = credentials.token_endpoint(authority);
    let client_id = credentials.qualified_client_id();
    let resource = credentials.resource();

    debug!(endpoint = %endpoint, client_id = %credentials.client_id, "requesting app-only token");

    let response = client
        .post(&endpoint)
        .form(&[
            ("grant_type", GRANT_TYPE),
            ("client_id", client_id.as_str()),
            ("client_secret", credentials.client_secret.expose().as_str()),
            ("resource", resource.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "token endpoint rejected client ({status}): {body}"
            )));
        }

        return Err(Error::TokenRequest(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRequest(format!("invalid token response: {e}")))
}

/// An access token held in memory until it goes stale. Never persisted.
#[derive(Debug, Clone)]
pub struct CachedToken {
    access: Secret<String>,
    expires_at: Instant,
}

impl CachedToken {
    pub fn new(access: Secret<String>, lifetime: Duration) -> Self {
        Self {
            access,
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Whether the token is still usable, leaving `REFRESH_SKEW_SECS` of headroom.
    pub fn is_fresh(&self) -> bool {
        Instant::now() + Duration::from_secs(REFRESH_SKEW_SECS) < self.expires_at
    }

    pub fn bearer(&self) -> &str {
        self.access.expose()
    }
}

impl From<TokenResponse> for CachedToken {
    fn from(response: TokenResponse) -> Self {
        Self::new(response.access_token, Duration::from_secs(response.expires_in))
    }
}
