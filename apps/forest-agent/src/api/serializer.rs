//! JSON:API documents.
//!
//! A record becomes `{type, id, attributes, relationships, links}`.
//! Relationship fields never appear in `attributes`; each gets a `related`
//! link and belongs-to fields also carry their linkage (`data`).

use forest_core::schema::Relationship;
use forest_core::{CollectionSchema, Record, RecordId};
use serde_json::{Map, Value, json};

/// Resource type of a collection.
pub fn resource_type(collection: &str) -> String {
    collection.to_lowercase()
}

pub fn record_link(collection: &str, id: RecordId) -> String {
    format!("/forest/{}/{}", collection, id)
}

/// Resource object of one record.
///
/// `fields` restricts the attributes to the requested ones.
pub fn resource(collection: &CollectionSchema, record: &Record, fields: Option<&[String]>) -> Value {
    let self_link = record_link(&collection.name, record.id);

    let attributes: Map<String, Value> = record
        .attributes
        .iter()
        .filter(|(name, _)| {
            collection
                .field(name)
                .is_none_or(|f| f.relationship.is_none())
        })
        .filter(|(name, _)| fields.is_none_or(|wanted| wanted.iter().any(|w| w == *name)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut relationships = Map::new();
    for field in collection.relationships() {
        let mut relationship = Map::new();
        relationship.insert(
            "links".into(),
            json!({ "related": format!("{}/relationships/{}", self_link, field.field) }),
        );
        if field.relationship == Some(Relationship::BelongsTo) {
            let linkage = record
                .attributes
                .get(&field.field)
                .and_then(RecordId::from_json)
                .map_or(Value::Null, |id| {
                    json!({
                        "type": resource_type(field.referenced_collection().unwrap_or_default()),
                        "id": id.to_string(),
                    })
                });
            relationship.insert("data".into(), linkage);
        }
        relationships.insert(field.field.clone(), Value::Object(relationship));
    }

    json!({
        "type": resource_type(&collection.name),
        "id": record.id.to_string(),
        "attributes": attributes,
        "relationships": relationships,
        "links": { "self": self_link },
    })
}

/// Document holding a single record.
pub fn document(collection: &CollectionSchema, record: &Record) -> Value {
    json!({
        "data": resource(collection, record, None),
        "links": { "self": record_link(&collection.name, record.id) },
    })
}

/// Document holding a list of records.
pub fn collection_document(
    collection: &CollectionSchema,
    records: &[Record],
    fields: Option<&[String]>,
) -> Value {
    let data: Vec<Value> = records
        .iter()
        .map(|record| resource(collection, record, fields))
        .collect();
    json!({ "data": data })
}
