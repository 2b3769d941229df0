//! Client of the remote authorization service.
//!
//! Two documents are fetched per rendering: the permission document
//! (`/liana/v3/permissions`) and the rendering scopes (`/liana/scopes`).
//! Both calls carry the environment secret in the `forest-secret-key` header.

use crate::config::AgentConfig;
use forest_core::permission::PermissionError;
use forest_core::scope::RenderingScopes;
use forest_core::{PermissionPayload, RenderingId, ScopeError};
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue};
use serde_json::Value;
use thiserror::Error;

const SECRET_HEADER: &str = "forest-secret-key";

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authorization service answered {status} on {path}")]
    Status { status: u16, path: String },

    #[error("environment secret is not a valid header value")]
    InvalidSecret(#[from] InvalidHeaderValue),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Scope(#[from] ScopeError),
}

// =============================================================================
// CLIENT
// =============================================================================

/// HTTP client of the authorization service.
#[derive(Debug, Clone)]
pub struct ForestClient {
    base_url: String,
    client: reqwest::Client,
}

impl ForestClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        let mut secret = HeaderValue::from_str(&config.env_secret)?;
        secret.set_sensitive(true);
        headers.insert(SECRET_HEADER, secret);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: config.server_base().to_string(),
            client,
        })
    }

    async fn get_json(&self, path: &str, rendering: &RenderingId) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("renderingId", rendering.0.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    /// Permission document of a rendering.
    pub async fn permissions(&self, rendering: &RenderingId) -> Result<PermissionPayload, ClientError> {
        let raw = self.get_json("/liana/v3/permissions", rendering).await?;
        tracing::debug!(rendering_id = %rendering, "permissions fetched");
        Ok(PermissionPayload::from_value(raw)?)
    }

    /// Scopes of every collection of a rendering.
    pub async fn scopes(&self, rendering: &RenderingId) -> Result<RenderingScopes, ClientError> {
        let raw = self.get_json("/liana/scopes", rendering).await?;
        tracing::debug!(rendering_id = %rendering, "scopes fetched");
        Ok(RenderingScopes::from_value(raw)?)
    }
}
