//! Fixtures shared by the agent integration tests.
//!
//! The agent runs in-process behind `axum-test`; the authorization service
//! is a `wiremock` server.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use axum_test::TestServer;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use forest_agent::api::auth::issue_token;
use forest_agent::{AgentConfig, AppState, build_router};
use forest_core::schema::{ActionField, ActionHooks, ActionSchema, Relationship};
use forest_core::{
    Attributes, CollectionSchema, Customizations, FieldSchema, MemoryDatasource, MockClock,
    PermissionPayload, Record, RecordId, RenderingId, Schema, SmartField, User,
};
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ENV_SECRET: &str = "env-secret";
pub const AUTH_SECRET: &str = "auth-secret";

// =============================================================================
// TIME, USERS AND TOKENS
// =============================================================================

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 7, 8, 9, 20, 22).unwrap()
}

pub fn user(id: &str) -> User {
    let mut user = User::new(id, "1");
    user.email = "guillaumec@forestadmin.com".into();
    user.first_name = "Guillaume".into();
    user.last_name = "Cisco".into();
    user.team = "Operations".into();
    user
}

pub fn token_for(user: &User) -> String {
    issue_token(user, AUTH_SECRET, Utc::now() + TimeDelta::hours(1)).unwrap()
}

/// Session token of user 1 on rendering 1.
pub fn token() -> String {
    token_for(&user("1"))
}

// =============================================================================
// SCHEMA AND DATA
// =============================================================================

fn send_invoice() -> ActionSchema {
    let mut action = ActionSchema::new("Send invoice");
    action.fields = vec![
        ActionField {
            field: "country".into(),
            field_type: json!("Enum"),
            enums: Some(vec![json!("FR"), json!("US")]),
            is_required: true,
            description: None,
            default_value: Some(json!("FR")),
            hook: Some("onCountryChange".into()),
        },
        ActionField {
            field: "city".into(),
            field_type: json!("String"),
            enums: None,
            is_required: false,
            description: None,
            default_value: None,
            hook: None,
        },
    ];
    action.hooks = ActionHooks {
        load: true,
        change: vec!["onCountryChange".into()],
    };
    action
}

pub fn schema() -> Schema {
    Schema::new(vec![
        CollectionSchema::new("Question")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("question_text", "String"))
            .with_field(FieldSchema::new("pub_date", "Date"))
            .with_field(FieldSchema::relation(
                "topic",
                Relationship::BelongsTo,
                "Topic.id",
                None,
            ))
            .with_field(FieldSchema::relation(
                "choice_set",
                Relationship::HasMany,
                "Choice.id",
                Some("question"),
            ))
            .with_field(FieldSchema::smart("label", "String"))
            .with_action(send_invoice())
            .with_action(ActionSchema::new("Mark as live")),
        CollectionSchema::new("Choice")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("choice_text", "String"))
            .with_field(FieldSchema::new("votes", "Number"))
            .with_field(FieldSchema::relation(
                "question",
                Relationship::BelongsTo,
                "Question.id",
                Some("choice_set"),
            )),
        CollectionSchema::new("Topic")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("name", "String")),
        CollectionSchema::new("Place")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("name", "String")),
        CollectionSchema::new("Restaurant")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("serves_hot_dogs", "Boolean"))
            .with_field(FieldSchema::new("serves_pizza", "Boolean"))
            .with_field(FieldSchema::relation(
                "place",
                Relationship::BelongsTo,
                "Place.id",
                None,
            )),
        CollectionSchema::new("Waiter")
            .with_field(FieldSchema::new("id", "Number"))
            .with_field(FieldSchema::new("name", "String")),
    ])
}

fn record(id: u64, attributes: Value) -> Record {
    let attributes: Attributes = serde_json::from_value(attributes).unwrap();
    Record::new(RecordId(id), attributes)
}

pub fn datasource() -> MemoryDatasource {
    MemoryDatasource::new()
        .with_records(
            "Question",
            vec![
                record(
                    1,
                    json!({"question_text": "what is your favorite color?",
                           "pub_date": "2021-06-02T13:52:53.528000+00:00", "topic": null}),
                ),
                record(
                    2,
                    json!({"question_text": "do you like chocolate?",
                           "pub_date": "2021-06-02T15:52:53.528000+00:00", "topic": null}),
                ),
                record(
                    3,
                    json!({"question_text": "who is your favorite singer?",
                           "pub_date": "2021-06-03T13:52:53.528000+00:00", "topic": 1}),
                ),
            ],
        )
        .with_records(
            "Choice",
            vec![
                record(1, json!({"choice_text": "yes", "votes": 2, "question": 1})),
                record(2, json!({"choice_text": "no", "votes": 0, "question": 1})),
                record(3, json!({"choice_text": "good", "votes": 1, "question": 2})),
            ],
        )
        .with_records("Topic", vec![record(1, json!({"name": "music"}))])
        .with_records(
            "Place",
            vec![
                record(1, json!({"name": "Ristorante"})),
                record(2, json!({"name": "Diner"})),
            ],
        )
        .with_records(
            "Restaurant",
            vec![record(
                1,
                json!({"serves_hot_dogs": true, "serves_pizza": false, "place": 1}),
            )],
        )
}

/// `label` smart field on Question plus the `send-invoice` handler and hooks.
pub fn customizations() -> Customizations {
    let label = SmartField::new("label")
        .getter(|r| {
            let text = r.value("question_text").unwrap_or(Value::Null);
            json!(format!("#{} {}", r.id, text.as_str().unwrap_or_default()))
        })
        .setter(|mut r, value| {
            r.attributes.insert("question_text".into(), value.clone());
            r
        });

    Customizations::new()
        .smart_field("Question", label)
        .action("Question", "send-invoice", |request| {
            if request.records.is_empty() {
                return Err("no question selected".to_string());
            }
            Ok(json!({"success": "now live"}))
        })
        .hook(
            "Question",
            "send-invoice",
            forest_core::schema::HookKind::Load,
            |request| request.fields.clone(),
        )
        .hook(
            "Question",
            "send-invoice",
            forest_core::schema::HookKind::Change,
            |request| {
                let mut fields = request.fields.clone();
                for field in &mut fields {
                    if field["field"] == json!("city") {
                        field["value"] = json!(request.changed_field.clone());
                    }
                }
                fields
            },
        )
}

// =============================================================================
// PERMISSION DOCUMENTS
// =============================================================================

fn all_flags(enabled: Value) -> Value {
    json!({
        "browseEnabled": enabled,
        "readEnabled": enabled,
        "addEnabled": enabled,
        "editEnabled": enabled,
        "deleteEnabled": enabled,
        "exportEnabled": enabled
    })
}

pub fn empty_stats() -> Value {
    json!({
        "queries": [], "leaderboards": [], "lines": [], "objectives": [],
        "percentages": [], "pies": [], "values": []
    })
}

/// Roles ACL document granting everything on every collection.
pub fn allow_all() -> Value {
    let mut collections = serde_json::Map::new();
    for name in ["Question", "Choice", "Topic", "Place", "Restaurant", "Waiter"] {
        collections.insert(
            name.to_string(),
            json!({"collection": all_flags(json!(true)), "actions": {}}),
        );
    }
    collections["Question"]["actions"] = json!({
        "Send invoice": {"triggerEnabled": true},
        "Mark as live": {"triggerEnabled": true}
    });
    json!({
        "data": {"collections": collections, "renderings": {"1": {}}},
        "stats": empty_stats(),
        "meta": {"rolesACLActivated": true}
    })
}

/// `allow_all` with one Question collection flag replaced.
pub fn with_question_flag(flag: &str, value: Value) -> Value {
    let mut payload = allow_all();
    payload["data"]["collections"]["Question"]["collection"][flag] = value;
    payload
}

pub fn payload(value: Value) -> PermissionPayload {
    PermissionPayload::from_value(value).unwrap()
}

pub fn rendering() -> RenderingId {
    RenderingId("1".into())
}

// =============================================================================
// AUTHORIZATION SERVICE MOCKS
// =============================================================================

pub async fn mount_permissions(authz: &MockServer, status: u16, body: Value) {
    Mock::given(method("GET"))
        .and(path("/liana/v3/permissions"))
        .and(query_param("renderingId", "1"))
        .and(header("forest-secret-key", ENV_SECRET))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(authz)
        .await;
}

pub async fn mount_scopes(authz: &MockServer, status: u16, body: Value) {
    Mock::given(method("GET"))
        .and(path("/liana/scopes"))
        .and(query_param("renderingId", "1"))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(authz)
        .await;
}

// =============================================================================
// AGENT
// =============================================================================

pub struct Agent {
    pub server: TestServer,
    pub authz: MockServer,
    pub state: AppState,
    pub clock: MockClock,
    pub datasource: MemoryDatasource,
}

pub async fn agent_with(datasource: MemoryDatasource) -> Agent {
    let authz = MockServer::start().await;
    let config = AgentConfig::new(ENV_SECRET, AUTH_SECRET).with_server_url(authz.uri());
    let clock = MockClock::new(now());
    let state = AppState::with_clock(
        config,
        schema(),
        Arc::new(datasource.clone()),
        Arc::new(clock.clone()),
    )
    .unwrap()
    .with_customizations(customizations());
    let server = TestServer::new(build_router(state.clone())).unwrap();
    Agent {
        server,
        authz,
        state,
        clock,
        datasource,
    }
}

pub async fn agent() -> Agent {
    agent_with(datasource()).await
}

/// Agent whose authorization service grants everything with no scope.
pub async fn open_agent() -> Agent {
    let agent = agent().await;
    mount_permissions(&agent.authz, 200, allow_all()).await;
    mount_scopes(&agent.authz, 200, json!({})).await;
    agent
}
