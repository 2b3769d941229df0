//! Chart handlers.
//!
//! Both routes answer `{data: {type: "stats", id, attributes: {value}}}`.

use crate::api::AppState;
use crate::api::error::{ApiError, api_bad_request};
use crate::api::extract::{AuthUser, KnownCollection};
use axum::Json;
use axum::extract::State;
use forest_core::stats::{self, ChartType};
use forest_core::{Permission, StatRequest};
use serde_json::{Map, Value, json};
use uuid::Uuid;

fn stat_document(value: Value) -> Value {
    json!({
        "data": {
            "type": "stats",
            "id": Uuid::new_v4().to_string(),
            "attributes": { "value": value },
        }
    })
}

/// `POST /forest/stats/{collection}`: a chart built in the admin UI.
pub async fn stat_with_parameters(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    state
        .require(
            &user,
            Permission::StatWithParameters {
                request: body.clone(),
            },
        )
        .await?;

    let request = StatRequest::from_body(&body, &collection.name)?;
    state.collection_schema(&request.collection)?;
    let scope = state.scopes.scope_for(&user, &request.collection).await?;
    let value = stats::compute(
        &request,
        &state.schema,
        state.datasource.as_ref(),
        scope.as_ref(),
        state.clock.now(),
    )?;
    tracing::debug!(collection = %request.collection, chart = ?request.chart, "chart computed");
    Ok(Json(stat_document(value)))
}

/// `POST /forest/stats`: a chart backed by a raw SQL query.
pub async fn live_query(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    let query = body
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| api_bad_request("missing query"))?
        .to_string();
    state
        .require(&user, Permission::LiveQuery { query: query.clone() })
        .await?;

    if !query.trim_start().to_lowercase().starts_with("select") {
        return Err(api_bad_request("Only SELECT queries are allowed."));
    }
    let chart = ChartType::parse(
        body.get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| api_bad_request("missing chart type"))?,
    )?;
    let rows = state.datasource.live_query(&query)?;
    let value = stats::from_live_query(chart, &rows)?;
    Ok(Json(stat_document(value)))
}
