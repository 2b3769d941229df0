//! API error type and helpers.
//!
//! Every handler failure is rendered as a JSON:API error document:
//! `{"errors": [{"detail": "..."}]}`.
//!
//! Internal errors are logged server-side and answered with a generic detail.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use forest_core::datasource::DatasourceError;
use forest_core::{FilterError, QueryError, ScopeError, StatsError};
use serde_json::json;
use std::fmt;

/// Structured API error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "errors": [{ "detail": self.detail }] });
        (self.status, Json(body)).into_response()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.detail)
    }
}

pub fn api_bad_request(detail: &str) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        detail: detail.to_string(),
    }
}

pub fn api_forbidden(detail: &str) -> ApiError {
    ApiError {
        status: StatusCode::FORBIDDEN,
        detail: detail.to_string(),
    }
}

pub fn api_not_found(detail: &str) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        detail: detail.to_string(),
    }
}

/// Log `err` and answer with a generic 500.
pub fn api_internal(message: &str, err: &dyn fmt::Display) -> ApiError {
    tracing::error!(error = %err, "{}", message);
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: message.to_string(),
    }
}

/// 400 for a collection the schema does not describe.
pub fn api_no_model(collection: &str) -> ApiError {
    api_bad_request(&format!("no model found for resource {}", collection))
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl From<DatasourceError> for ApiError {
    fn from(err: DatasourceError) -> Self {
        match err {
            DatasourceError::NotFound { .. } => api_not_found(&err.to_string()),
            DatasourceError::Conflict { .. }
            | DatasourceError::InvalidId(_)
            | DatasourceError::Unsupported
            | DatasourceError::Query(_) => api_bad_request(&err.to_string()),
            DatasourceError::Storage(_) | DatasourceError::Encoding(_) => {
                api_internal("datasource failure", &err)
            }
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        api_bad_request(&err.to_string())
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        api_bad_request(&err.to_string())
    }
}

impl From<StatsError> for ApiError {
    fn from(err: StatsError) -> Self {
        match err {
            StatsError::Datasource(inner) => inner.into(),
            StatsError::Filter(_) | StatsError::Invalid(_) => api_bad_request(&err.to_string()),
        }
    }
}

impl From<ScopeError> for ApiError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::MissingDynamicValue { .. } | ScopeError::NotLoaded(_) => {
                tracing::warn!(error = %err, "scope cannot be applied");
                api_forbidden("Forbidden")
            }
            ScopeError::Malformed(_) => api_internal("malformed scopes", &err),
        }
    }
}
