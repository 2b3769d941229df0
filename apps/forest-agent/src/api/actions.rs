//! Smart action handlers.
//!
//! Actions are addressed by the last segment of their endpoint. Triggering
//! one needs `triggerEnabled` on it; running its form hooks only needs a
//! valid session token.

use crate::api::AppState;
use crate::api::error::{ApiError, api_bad_request, api_forbidden, api_internal, api_no_model, api_not_found};
use crate::api::extract::AuthUser;
use axum::Json;
use axum::extract::{Path, State};
use forest_core::action::{BulkSelection, format_enums};
use forest_core::schema::{ActionRequest, ActionSchema, HookKind, HookRequest};
use forest_core::{Attributes, Permission};
use serde_json::{Map, Value, json};

fn request_attributes(body: &Value) -> Result<&Map<String, Value>, ApiError> {
    body.pointer("/data/attributes")
        .and_then(Value::as_object)
        .ok_or_else(|| api_bad_request("missing data.attributes"))
}

/// `POST /forest/actions/{action}`
pub async fn trigger(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(endpoint_name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let attributes = request_attributes(&body)?;
    let collection_name = attributes
        .get("collection_name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let collection = state
        .schema
        .collection(collection_name)
        .ok_or_else(|| api_no_model(collection_name))?;
    let action = collection.action(&endpoint_name).ok_or_else(|| {
        tracing::info!(collection = %collection_name, action = %endpoint_name, "unknown action");
        api_forbidden("Forbidden")
    })?;

    state
        .require(
            &user,
            Permission::TriggerAction {
                collection: collection.name.clone(),
                action: action.name.clone(),
            },
        )
        .await?;

    let handler = state
        .customizations
        .action_code(&collection.name, &endpoint_name)
        .and_then(|code| code.handler.clone())
        .ok_or_else(|| api_not_found(&format!("no handler for action {}", action.name)))?;

    let scope = state.scopes.scope_for(&user, &collection.name).await?;
    let records = BulkSelection::from_attributes(attributes).resolve(
        state.datasource.scan(&collection.name)?,
        &collection.name,
        scope.as_ref(),
        state.clock.now(),
    )?;
    let values: Attributes = attributes
        .get("values")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let request = ActionRequest {
        collection: collection.name.clone(),
        action: action.name.clone(),
        records,
        values,
        user,
    };
    tracing::info!(
        collection = %request.collection,
        action = %request.action,
        targets = request.records.len(),
        user_id = %request.user.id,
        "action triggered"
    );
    handler(&request).map(Json).map_err(|message| api_bad_request(&message))
}

/// Form fields of an action with their default values.
fn default_fields(action: &ActionSchema) -> Result<Vec<Value>, ApiError> {
    action
        .fields
        .iter()
        .map(|field| {
            let mut value = serde_json::to_value(field)
                .map_err(|err| api_internal("cannot render action field", &err))?;
            if let Value::Object(object) = &mut value {
                let default = field.default_value.clone().unwrap_or(Value::Null);
                object.insert("value".into(), default);
            }
            Ok(value)
        })
        .collect()
}

/// `POST /forest/actions/{action}/hooks/{hook}`
pub async fn hook(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Path((endpoint_name, hook_name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let (collection, action) = state
        .schema
        .find_action(&endpoint_name)
        .ok_or_else(|| api_bad_request("action not found"))?;
    let kind = HookKind::parse(&hook_name)
        .ok_or_else(|| api_bad_request(&format!("unknown hook {}", hook_name)))?;
    let declared = match kind {
        HookKind::Load => action.hooks.load,
        HookKind::Change => !action.hooks.change.is_empty(),
    };
    let hook = state
        .customizations
        .hook_for(&collection.name, &endpoint_name, kind)
        .filter(|_| declared)
        .ok_or_else(|| api_bad_request(&format!("no {} hook on {}", hook_name, action.name)))?;

    let attributes = body
        .pointer("/data/attributes")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let (fields, changed_field) = match kind {
        HookKind::Load => (default_fields(action)?, None),
        HookKind::Change => (
            attributes
                .get("fields")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            attributes
                .get("changed_field")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
    };

    let request = HookRequest {
        collection: collection.name.clone(),
        action: action.name.clone(),
        fields,
        ids: BulkSelection::from_attributes(&attributes).ids,
        changed_field,
    };
    let mut fields = hook(&request);
    format_enums(&mut fields);
    Ok(Json(json!({ "fields": fields })))
}
