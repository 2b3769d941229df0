//! Smart action form hooks.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::{Value, json};

fn field<'a>(body: &'a Value, name: &str) -> &'a Value {
    body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["field"] == name)
        .unwrap_or_else(|| panic!("no field {name} in {body}"))
}

#[tokio::test]
async fn load_hook_receives_default_values() {
    let agent = agent().await;

    let response = agent
        .server
        .post("/forest/actions/send-invoice/hooks/load")
        .authorization_bearer(token())
        .json(&json!({"data": {"attributes": {"ids": ["1"], "collection_name": "Question"}}}))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    let country = field(&body, "country");
    assert_eq!(country["value"], "FR");
    assert_eq!(country["enums"], json!(["FR", "US"]));
    assert_eq!(field(&body, "city")["value"], Value::Null);
}

#[tokio::test]
async fn change_hook_receives_submitted_fields() {
    let agent = agent().await;

    let response = agent
        .server
        .post("/forest/actions/send-invoice/hooks/change")
        .authorization_bearer(token())
        .json(&json!({
            "data": {
                "attributes": {
                    "ids": ["1"],
                    "collection_name": "Question",
                    "changed_field": "country",
                    "fields": [
                        {"field": "country", "type": "Enum", "enums": ["FR", "US"], "value": "US"},
                        {"field": "city", "type": "String", "value": null}
                    ]
                }
            }
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(field(&body, "country")["value"], "US");
    assert_eq!(field(&body, "city")["value"], "country");
}

#[tokio::test]
async fn hook_drops_values_outside_enums() {
    let agent = agent().await;

    let response = agent
        .server
        .post("/forest/actions/send-invoice/hooks/change")
        .authorization_bearer(token())
        .json(&json!({
            "data": {
                "attributes": {
                    "changed_field": "country",
                    "fields": [
                        {"field": "country", "type": "Enum", "enums": ["FR", "US"], "value": "DE"}
                    ]
                }
            }
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(field(&body, "country")["value"], Value::Null);
}

#[tokio::test]
async fn hook_needs_a_token() {
    let agent = agent().await;

    let response = agent
        .server
        .post("/forest/actions/send-invoice/hooks/load")
        .json(&json!({"data": {"attributes": {}}}))
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn hook_of_unknown_action_is_rejected() {
    let agent = agent().await;

    let response = agent
        .server
        .post("/forest/actions/not-exists/hooks/load")
        .authorization_bearer(token())
        .json(&json!({"data": {"attributes": {}}}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undeclared_hook_is_rejected() {
    let agent = agent().await;

    let unknown_kind = agent
        .server
        .post("/forest/actions/send-invoice/hooks/submit")
        .authorization_bearer(token())
        .json(&json!({"data": {"attributes": {}}}))
        .await;
    let without_hooks = agent
        .server
        .post("/forest/actions/mark-as-live/hooks/load")
        .authorization_bearer(token())
        .json(&json!({"data": {"attributes": {}}}))
        .await;

    unknown_kind.assert_status(StatusCode::BAD_REQUEST);
    without_hooks.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn action_handler_error_is_a_bad_request() {
    let agent = open_agent().await;

    let response = agent
        .server
        .post("/forest/actions/send-invoice")
        .authorization_bearer(token())
        .json(&json!({
            "data": {"attributes": {"collection_name": "Question", "ids": ["42"], "values": {}}}
        }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    response.assert_json(&json!({"errors": [{"detail": "no question selected"}]}));
}
