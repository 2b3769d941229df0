//! Request extractors shared by the handlers.
//!
//! Handlers list [`KnownCollection`] before [`AuthUser`], so an unknown
//! collection is reported before the token is even looked at.

use crate::api::AppState;
use crate::api::auth;
use crate::api::error::{ApiError, api_bad_request, api_forbidden, api_no_model};
use axum::extract::{FromRequestParts, RawPathParams};
use axum::http::request::Parts;
use forest_core::User;

/// The authenticated admin user.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        auth::authenticate(&parts.headers, &state.config.auth_secret)
            .map(AuthUser)
            .map_err(|err| {
                tracing::debug!(error = %err, path = %parts.uri.path(), "authentication failed");
                api_forbidden("Forbidden")
            })
    }
}

/// The `{collection}` path segment, checked against the schema.
///
/// A `.csv` suffix marks an export request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownCollection {
    pub name: String,
    pub csv: bool,
}

impl FromRequestParts<AppState> for KnownCollection {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let params = RawPathParams::from_request_parts(parts, state)
            .await
            .map_err(|_| api_bad_request("invalid path"))?;
        let raw = params
            .iter()
            .find(|(key, _)| *key == "collection")
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| api_bad_request("missing collection"))?;

        let (name, csv) = match raw.strip_suffix(".csv") {
            Some(name) => (name.to_string(), true),
            None => (raw, false),
        };
        if state.schema.collection(&name).is_none() {
            return Err(api_no_model(&name));
        }
        Ok(Self { name, csv })
    }
}
