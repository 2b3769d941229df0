//! CRUD handlers.
//!
//! Every handler checks the collection permission first, then applies the
//! user's scope: records outside of it are invisible and untouchable.

use crate::api::AppState;
use crate::api::error::{ApiError, api_bad_request, api_internal, api_not_found};
use crate::api::extract::{AuthUser, KnownCollection};
use crate::api::serializer::{collection_document, document};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use forest_core::action::BulkSelection;
use forest_core::filter::parse_timezone;
use forest_core::schema::Relationship;
use forest_core::smart_field::{apply_getters, apply_setters};
use forest_core::{
    Attributes, CollectionAction, CollectionSchema, EvalContext, ListQuery, Permission, Record,
    RecordId, User,
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

type Params = Query<BTreeMap<String, String>>;

// =============================================================================
// HELPERS
// =============================================================================

fn parse_id(raw: &str) -> Result<RecordId, ApiError> {
    raw.parse()
        .map_err(|_| api_bad_request(&format!("invalid record id {}", raw)))
}

/// Clock and `timezone` parameter of a single-record request.
fn request_context(
    state: &AppState,
    params: &BTreeMap<String, String>,
) -> Result<EvalContext, ApiError> {
    let timezone = parse_timezone(params.get("timezone").map(String::as_str))?;
    Ok(EvalContext::new(state.clock.now(), timezone))
}

/// A record the user is allowed to see, if any.
async fn find_scoped(
    state: &AppState,
    user: &User,
    collection: &str,
    id: RecordId,
    ctx: &EvalContext,
) -> Result<Option<Record>, ApiError> {
    let scope = state.scopes.scope_for(user, collection).await?;
    Ok(state
        .datasource
        .get(collection, id)?
        .filter(|record| scope.as_ref().is_none_or(|s| s.matches(record, ctx))))
}

async fn scoped_record(
    state: &AppState,
    user: &User,
    collection: &str,
    id: RecordId,
    ctx: &EvalContext,
) -> Result<Record, ApiError> {
    find_scoped(state, user, collection, id, ctx)
        .await?
        .ok_or_else(|| api_not_found(&format!("record {} not found in {}", id, collection)))
}

/// `data.attributes` and `data.relationships` of a write body.
fn body_parts(body: &Value) -> Result<(Attributes, Map<String, Value>), ApiError> {
    let data = body
        .get("data")
        .ok_or_else(|| api_bad_request("missing data"))?;
    let object = |key: &str| {
        data.get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    };
    Ok((object("attributes"), object("relationships")))
}

/// Copy belongs-to linkages into `attributes`, checking the targets exist.
fn link_relationships(
    state: &AppState,
    collection: &CollectionSchema,
    attributes: &mut Attributes,
    relationships: &Map<String, Value>,
) -> Result<(), ApiError> {
    for field in collection.belongs_to() {
        let Some(linkage) = relationships.get(&field.field) else {
            continue;
        };
        let target = field.referenced_collection().unwrap_or_default();
        let raw = match linkage.get("data") {
            None | Some(Value::Null) => {
                attributes.insert(field.field.clone(), Value::Null);
                continue;
            }
            Some(data) => data.get("id").cloned().unwrap_or(Value::Null),
        };
        let id = RecordId::from_json(&raw)
            .ok_or_else(|| api_bad_request(&format!("invalid id {} for {}", raw, field.field)))?;
        if state.datasource.get(target, id)?.is_none() {
            return Err(api_bad_request(&format!(
                "Instance {} with pk {} does not exists",
                target, id
            )));
        }
        attributes.insert(field.field.clone(), Value::from(id.0));
    }
    Ok(())
}

/// Incoming attributes that may be stored directly.
fn writable(collection: &CollectionSchema, incoming: &Attributes) -> Attributes {
    incoming
        .iter()
        .filter(|(name, _)| *name != "id")
        .filter(|(name, _)| {
            collection.field(name).is_none_or(|f| {
                f.relationship.is_none() || f.relationship == Some(Relationship::BelongsTo)
            })
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn csv_cell(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

// =============================================================================
// LIST, COUNT, EXPORT
// =============================================================================

pub async fn list(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Query(params): Params,
) -> Result<Response, ApiError> {
    if collection.csv {
        return export(&state, &collection.name, &user, &params).await;
    }
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Browse))
        .await?;

    let schema = state.collection_schema(&name)?;
    let query = ListQuery::parse(&params, &name)?;
    let scope = state.scopes.scope_for(&user, &name).await?;
    let ctx = query.context(state.clock.now());

    let mut page = query.apply(state.datasource.scan(&name)?, scope.as_ref(), &ctx);
    apply_getters(&mut page, schema, &state.customizations, query.fields.as_deref());
    tracing::debug!(collection = %name, returned = page.len(), "list");
    Ok(Json(collection_document(schema, &page, query.fields.as_deref())).into_response())
}

pub async fn count(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Browse))
        .await?;

    let query = ListQuery::parse(&params, &name)?;
    let scope = state.scopes.scope_for(&user, &name).await?;
    let ctx = query.context(state.clock.now());
    let count = query.count(state.datasource.scan(&name)?, scope.as_ref(), &ctx);
    Ok(Json(json!({ "count": count })))
}

async fn export(
    state: &AppState,
    name: &str,
    user: &User,
    params: &BTreeMap<String, String>,
) -> Result<Response, ApiError> {
    state
        .require(user, Permission::collection(name, CollectionAction::Export))
        .await?;

    let schema = state.collection_schema(name)?;
    let query = ListQuery::parse(params, name)?;
    let scope = state.scopes.scope_for(user, name).await?;
    let ctx = query.context(state.clock.now());

    let mut records = query.select(state.datasource.scan(name)?, scope.as_ref(), &ctx);
    apply_getters(&mut records, schema, &state.customizations, query.fields.as_deref());

    let columns: Vec<String> = query.fields.clone().unwrap_or_else(|| {
        schema
            .fields
            .iter()
            .filter(|f| !f.is_list())
            .map(|f| f.field.clone())
            .collect()
    });

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .map_err(|err| api_internal("csv export failed", &err))?;
    for record in &records {
        writer
            .write_record(columns.iter().map(|c| csv_cell(record.value(c))))
            .map_err(|err| api_internal("csv export failed", &err))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| api_internal("csv export failed", &err))?;

    let filename = params.get("filename").map_or(name, String::as_str);
    tracing::info!(collection = %name, rows = records.len(), "export");
    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.csv\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

// =============================================================================
// CREATE, READ, UPDATE
// =============================================================================

pub async fn create(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Add))
        .await?;

    let schema = state.collection_schema(&name)?;
    let (incoming, relationships) = body_parts(&body)?;
    let mut attributes = writable(schema, &incoming);
    if let Some(id) = incoming.get("id") {
        attributes.insert("id".into(), id.clone());
    }
    link_relationships(&state, schema, &mut attributes, &relationships)?;

    // the key is assigned by the datasource
    let draft = apply_setters(
        Record::new(RecordId(0), attributes),
        schema,
        &state.customizations,
        &incoming,
    );
    let created = state.datasource.insert(&name, draft.attributes)?;
    tracing::info!(collection = %name, id = %created.id, user_id = %user.id, "record created");

    let mut records = [created];
    apply_getters(&mut records, schema, &state.customizations, None);
    Ok(Json(document(schema, &records[0])))
}

pub async fn get_one(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Path((_, id)): Path<(String, String)>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Read))
        .await?;

    let schema = state.collection_schema(&name)?;
    let ctx = request_context(&state, &params)?;
    let record = scoped_record(&state, &user, &name, parse_id(&id)?, &ctx).await?;
    let mut records = [record];
    apply_getters(&mut records, schema, &state.customizations, None);
    Ok(Json(document(schema, &records[0])))
}

pub async fn update(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Path((_, id)): Path<(String, String)>,
    Query(params): Params,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Edit))
        .await?;

    let schema = state.collection_schema(&name)?;
    let ctx = request_context(&state, &params)?;
    let mut record = scoped_record(&state, &user, &name, parse_id(&id)?, &ctx).await?;
    let (incoming, relationships) = body_parts(&body)?;
    record.attributes.extend(writable(schema, &incoming));
    link_relationships(&state, schema, &mut record.attributes, &relationships)?;

    let record = apply_setters(record, schema, &state.customizations, &incoming);
    let saved = state.datasource.update(&name, record)?;
    tracing::info!(collection = %name, id = %saved.id, user_id = %user.id, "record updated");

    let mut records = [saved];
    apply_getters(&mut records, schema, &state.customizations, None);
    Ok(Json(document(schema, &records[0])))
}

// =============================================================================
// DELETE
// =============================================================================

pub async fn delete_one(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Path((_, id)): Path<(String, String)>,
    Query(params): Params,
) -> Result<StatusCode, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Delete))
        .await?;

    let id = parse_id(&id)?;
    let ctx = request_context(&state, &params)?;
    if find_scoped(&state, &user, &name, id, &ctx).await?.is_some() {
        state.datasource.delete(&name, id)?;
        tracing::info!(collection = %name, %id, user_id = %user.id, "record deleted");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Delete `ids`, or every record matching the subset query minus the
/// excluded ids.
pub async fn delete_bulk(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Delete))
        .await?;

    let attributes = body
        .pointer("/data/attributes")
        .and_then(Value::as_object)
        .ok_or_else(|| api_bad_request("missing data.attributes"))?;
    let selection = BulkSelection::from_attributes(attributes);
    let scope = state.scopes.scope_for(&user, &name).await?;
    let targets = selection.resolve(
        state.datasource.scan(&name)?,
        &name,
        scope.as_ref(),
        state.clock.now(),
    )?;

    for record in &targets {
        state.datasource.delete(&name, record.id)?;
    }
    tracing::info!(collection = %name, deleted = targets.len(), user_id = %user.id, "bulk delete");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// RELATIONSHIPS
// =============================================================================

/// Records linked to a parent through one of its relationship fields.
pub async fn related(
    State(state): State<AppState>,
    collection: KnownCollection,
    AuthUser(user): AuthUser,
    Path((_, id, association)): Path<(String, String, String)>,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    let name = collection.name;
    state
        .require(&user, Permission::collection(&name, CollectionAction::Read))
        .await?;

    let schema = state.collection_schema(&name)?;
    let parent_ctx = request_context(&state, &params)?;
    let parent = scoped_record(&state, &user, &name, parse_id(&id)?, &parent_ctx).await?;
    let field = schema
        .field(&association)
        .filter(|f| f.relationship.is_some())
        .ok_or_else(|| api_not_found(&format!("no relationship {} on {}", association, name)))?;
    let target = field
        .referenced_collection()
        .ok_or_else(|| api_bad_request(&format!("{} has no reference", association)))?;
    let target_schema = state.collection_schema(target)?;

    let candidates: Vec<Record> = match field.relationship {
        Some(Relationship::BelongsTo) => parent
            .attributes
            .get(&field.field)
            .and_then(RecordId::from_json)
            .map(|fk| state.datasource.get(target, fk))
            .transpose()?
            .flatten()
            .into_iter()
            .collect(),
        Some(Relationship::HasMany | Relationship::HasOne) => {
            let inverse = field.inverse_of.as_deref().ok_or_else(|| {
                api_bad_request(&format!("{} has no inverse relationship", association))
            })?;
            state
                .datasource
                .scan(target)?
                .into_iter()
                .filter(|r| r.attributes.get(inverse).and_then(RecordId::from_json) == Some(parent.id))
                .collect()
        }
        _ => {
            return Err(api_bad_request(&format!(
                "relationship {} is not supported",
                association
            )));
        }
    };

    let query = ListQuery::parse(&params, target)?;
    let scope = state.scopes.scope_for(&user, target).await?;
    let ctx = query.context(state.clock.now());
    let mut page = query.apply(candidates, scope.as_ref(), &ctx);
    apply_getters(&mut page, target_schema, &state.customizations, query.fields.as_deref());
    Ok(Json(collection_document(target_schema, &page, query.fields.as_deref())))
}
