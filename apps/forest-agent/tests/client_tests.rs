//! Authorization service client against a mocked server.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{AUTH_SECRET, ENV_SECRET, allow_all, rendering, user};
use forest_agent::{AgentConfig, ClientError, ForestClient};
use forest_core::{CollectionAction, Permission, PermissionCache};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client_for(server: &MockServer) -> ForestClient {
    // a trailing slash on the server URL is tolerated
    let config =
        AgentConfig::new(ENV_SECRET, AUTH_SECRET).with_server_url(format!("{}/", server.uri()));
    ForestClient::new(&config).unwrap()
}

#[tokio::test]
async fn permissions_are_fetched_with_secret_and_rendering() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liana/v3/permissions"))
        .and(query_param("renderingId", "1"))
        .and(header("forest-secret-key", ENV_SECRET))
        .respond_with(ResponseTemplate::new(200).set_body_json(allow_all()))
        .expect(1)
        .mount(&server)
        .await;

    let payload = client_for(&server).await.permissions(&rendering()).await.unwrap();

    let mut cache = PermissionCache::default();
    cache.store(&payload, &rendering(), chrono::Utc::now()).unwrap();
    assert!(cache.roles_acl_activated());
    assert!(cache.is_allowed(
        &Permission::collection("Question", CollectionAction::Browse),
        &user("1")
    ));
}

#[tokio::test]
async fn scopes_are_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liana/scopes"))
        .and(query_param("renderingId", "1"))
        .and(header("forest-secret-key", ENV_SECRET))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Question": {
                "scope": {
                    "filter": {"field": "id", "operator": "equal", "value": 1},
                    "dynamicScopesValues": {}
                }
            },
            "Choice": null
        })))
        .mount(&server)
        .await;

    let scopes = client_for(&server).await.scopes(&rendering()).await.unwrap();

    assert!(scopes.get("Question").is_some());
    assert!(scopes.get("Choice").is_none());
    assert!(scopes.scope_for(&user("1"), "Topic").unwrap().is_none());
}

#[tokio::test]
async fn error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liana/v3/permissions"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = client_for(&server).await.permissions(&rendering()).await;

    match result {
        Err(ClientError::Status { status, path }) => {
            assert_eq!(status, 404);
            assert_eq!(path, "/liana/v3/permissions");
        }
        other => panic!("expected a status error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_document_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liana/scopes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["not", "scopes"])))
        .mount(&server)
        .await;

    let result = client_for(&server).await.scopes(&rendering()).await;

    assert!(matches!(result, Err(ClientError::Scope(_))));
}
