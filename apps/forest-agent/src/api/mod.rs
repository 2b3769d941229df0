//! # HTTP API
//!
//! The agent router. Every route lives under `/forest` so a host can merge
//! it into its own router as is.
//!
//! | Route | Permission |
//! |---|---|
//! | `GET /forest` | none |
//! | `GET /forest/{collection}` | browse (export with `.csv`) |
//! | `GET /forest/{collection}/count` | browse |
//! | `POST /forest/{collection}` | add |
//! | `DELETE /forest/{collection}` | delete |
//! | `GET /forest/{collection}/{id}` | read |
//! | `PUT /forest/{collection}/{id}` | edit |
//! | `DELETE /forest/{collection}/{id}` | delete |
//! | `GET /forest/{collection}/{id}/relationships/{association}` | read |
//! | `POST /forest/stats` | live query |
//! | `POST /forest/stats/{collection}` | stat with parameters |
//! | `POST /forest/actions/{action}` | trigger |
//! | `POST /forest/actions/{action}/hooks/{hook}` | token only |

pub mod actions;
pub mod auth;
pub mod error;
pub mod extract;
pub mod permissions;
pub mod resources;
pub mod serializer;
pub mod stats;

use crate::client::{ClientError, ForestClient};
use crate::config::AgentConfig;
use axum::Router;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, Uri, request::Parts};
use axum::routing::{get, post};
use axum::Json;
use error::{ApiError, api_forbidden, api_no_model};
use forest_core::clock::default_clock;
use forest_core::{Clock, CollectionSchema, Customizations, Datasource, Permission, Schema, User};
use permissions::{PermissionService, ScopeService};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

// =============================================================================
// STATE
// =============================================================================

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub schema: Arc<Schema>,
    pub customizations: Arc<Customizations>,
    pub datasource: Arc<dyn Datasource>,
    pub permissions: PermissionService,
    pub scopes: ScopeService,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// State on the system clock, without customizations.
    pub fn new(
        config: AgentConfig,
        schema: Schema,
        datasource: Arc<dyn Datasource>,
    ) -> Result<Self, ClientError> {
        Self::with_clock(config, schema, datasource, default_clock())
    }

    pub fn with_clock(
        config: AgentConfig,
        schema: Schema,
        datasource: Arc<dyn Datasource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClientError> {
        let client = ForestClient::new(&config)?;
        Ok(Self {
            permissions: PermissionService::new(
                client.clone(),
                Arc::clone(&clock),
                config.permissions_ttl_secs,
            ),
            scopes: ScopeService::new(client, Arc::clone(&clock), config.scopes_ttl_secs),
            config: Arc::new(config),
            schema: Arc::new(schema),
            customizations: Arc::new(Customizations::new()),
            datasource,
            clock,
        })
    }

    #[must_use]
    pub fn with_customizations(mut self, customizations: Customizations) -> Self {
        self.customizations = Arc::new(customizations);
        self
    }

    /// Schema of a collection, 400 when unknown.
    pub fn collection_schema(&self, name: &str) -> Result<&CollectionSchema, ApiError> {
        self.schema.collection(name).ok_or_else(|| api_no_model(name))
    }

    /// 403 unless `user` holds `permission`.
    pub async fn require(&self, user: &User, permission: Permission) -> Result<(), ApiError> {
        if self.permissions.authorize(user, &permission).await {
            Ok(())
        } else {
            Err(api_forbidden("Forbidden"))
        }
    }
}

// =============================================================================
// ROUTER
// =============================================================================

async fn health() -> Json<Value> {
    Json(json!({}))
}

fn admin_origin(origin: &HeaderValue, _parts: &Parts) -> bool {
    origin.to_str().is_ok_and(is_admin_origin)
}

/// `localhost` on any scheme and port, or an `https` forestadmin.com subdomain.
fn is_admin_origin(origin: &str) -> bool {
    let Ok(uri) = origin.parse::<Uri>() else {
        return false;
    };
    let Some(host) = uri.host().map(str::to_ascii_lowercase) else {
        return false;
    };
    match uri.scheme_str() {
        Some("http" | "https") if host == "localhost" => true,
        Some("https") => host.ends_with(".forestadmin.com"),
        _ => false,
    }
}

/// Build the agent router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(admin_origin))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/forest", get(health))
        .route("/forest/", get(health))
        .route("/forest/stats", post(stats::live_query))
        .route("/forest/stats/{collection}", post(stats::stat_with_parameters))
        .route("/forest/actions/{action}", post(actions::trigger))
        .route("/forest/actions/{action}/hooks/{hook}", post(actions::hook))
        .route(
            "/forest/{collection}",
            get(resources::list)
                .post(resources::create)
                .delete(resources::delete_bulk),
        )
        .route("/forest/{collection}/count", get(resources::count))
        .route(
            "/forest/{collection}/{id}",
            get(resources::get_one)
                .put(resources::update)
                .delete(resources::delete_one),
        )
        .route(
            "/forest/{collection}/{id}/relationships/{association}",
            get(resources::related),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use forest_core::MemoryDatasource;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = AgentConfig::new("env", "auth").with_server_url("http://127.0.0.1:9");
        let schema = Schema::new(vec![CollectionSchema::new("Question")]);
        build_router(AppState::new(config, schema, Arc::new(MemoryDatasource::new())).unwrap())
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/forest/Question")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_empty_object() {
        let request = Request::get("/forest").body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn cors_allows_admin_origins_only() {
        let allowed = router()
            .oneshot(preflight("https://app.forestadmin.com"))
            .await
            .unwrap();
        let denied = router().oneshot(preflight("https://example.org")).await.unwrap();

        assert_eq!(
            allowed.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.forestadmin.com"
        );
        assert_eq!(
            allowed.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert!(denied.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn cors_rejects_look_alike_origins() {
        let local = router().oneshot(preflight("http://localhost:3000")).await.unwrap();
        assert_eq!(
            local.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );

        for origin in [
            "http://localhost.attacker.example",
            "https://evilforestadmin.com",
            "https://app.forestadmin.com.attacker.example",
            "http://app.forestadmin.com",
            "http://localhost@attacker.example",
        ] {
            let response = router().oneshot(preflight(origin)).await.unwrap();
            assert!(
                response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none(),
                "{origin} was allowed"
            );
        }
    }

    #[test]
    fn admin_origins() {
        assert!(is_admin_origin("https://app.forestadmin.com"));
        assert!(is_admin_origin("http://localhost"));
        assert!(is_admin_origin("https://localhost:4200"));
        assert!(!is_admin_origin("null"));
        assert!(!is_admin_origin(""));
        assert!(!is_admin_origin("ftp://localhost"));
    }

    #[tokio::test]
    async fn unknown_collection_is_reported_before_authentication() {
        let request = Request::get("/forest/Foo").body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
