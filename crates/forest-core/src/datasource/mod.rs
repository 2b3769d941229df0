//! # Datasources
//!
//! Record storage behind the resource routes.
//!
//! - [`MemoryDatasource`]: `BTreeMap` backed, for tests and embedding.
//! - [`RedbDatasource`]: persistent, one redb table per collection.
//!
//! Records are addressed by collection name and [`RecordId`]. The `id` key
//! never appears inside stored attributes.

mod memory;
mod redb_store;

pub use memory::{LiveQueryHandler, MemoryDatasource};
pub use redb_store::RedbDatasource;

use crate::{Attributes, Record, RecordId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasourceError {
    #[error("record {id} not found in {collection}")]
    NotFound { collection: String, id: RecordId },

    #[error("record {id} already exists in {collection}")]
    Conflict { collection: String, id: RecordId },

    #[error("invalid id: {0}")]
    InvalidId(Value),

    #[error("live queries are not supported by this datasource")]
    Unsupported,

    #[error("query failed: {0}")]
    Query(String),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Storage operations the agent needs.
///
/// Implementations use interior mutability so a datasource can be shared
/// across request handlers.
pub trait Datasource: Send + Sync {
    /// All records of a collection in id order. Unknown collections are empty.
    fn scan(&self, collection: &str) -> Result<Vec<Record>, DatasourceError>;

    /// A record by id.
    fn get(&self, collection: &str, id: RecordId) -> Result<Option<Record>, DatasourceError>;

    /// Store a new record.
    ///
    /// An `id` attribute picks the primary key, otherwise the next free one is
    /// used.
    fn insert(&self, collection: &str, attributes: Attributes) -> Result<Record, DatasourceError>;

    /// Replace an existing record.
    fn update(&self, collection: &str, record: Record) -> Result<Record, DatasourceError>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, collection: &str, id: RecordId) -> Result<bool, DatasourceError>;

    /// Run a raw SQL query for live-query charts.
    fn live_query(&self, _query: &str) -> Result<Vec<Attributes>, DatasourceError> {
        Err(DatasourceError::Unsupported)
    }
}

/// Split an explicit `id` attribute off `attributes`.
pub(crate) fn take_id(attributes: &mut Attributes) -> Result<Option<RecordId>, DatasourceError> {
    match attributes.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => RecordId::from_json(&value)
            .map(Some)
            .ok_or(DatasourceError::InvalidId(value)),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend shares.
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    pub fn insert_assigns_ids(ds: &dyn Datasource) {
        let first = ds.insert("Question", attrs(json!({"question_text": "a"}))).unwrap();
        let second = ds.insert("Question", attrs(json!({"question_text": "b"}))).unwrap();
        assert_eq!(first.id, RecordId(1));
        assert_eq!(second.id, RecordId(2));
        assert!(!second.attributes.contains_key("id"));

        let explicit = ds
            .insert("Question", attrs(json!({"id": "10", "question_text": "c"})))
            .unwrap();
        assert_eq!(explicit.id, RecordId(10));
        let next = ds.insert("Question", attrs(json!({"question_text": "d"}))).unwrap();
        assert_eq!(next.id, RecordId(11));

        let conflict = ds.insert("Question", attrs(json!({"id": 1})));
        assert!(matches!(conflict, Err(DatasourceError::Conflict { .. })));
    }

    pub fn crud_roundtrip(ds: &dyn Datasource) {
        let created = ds.insert("Choice", attrs(json!({"choice_text": "yes"}))).unwrap();
        assert_eq!(ds.get("Choice", created.id).unwrap(), Some(created.clone()));
        assert_eq!(ds.get("Choice", RecordId(99)).unwrap(), None);

        let mut changed = created.clone();
        changed.attributes.insert("choice_text".into(), json!("no"));
        ds.update("Choice", changed.clone()).unwrap();
        assert_eq!(ds.get("Choice", created.id).unwrap(), Some(changed));

        let missing = Record::new(RecordId(42), Attributes::new());
        assert!(matches!(
            ds.update("Choice", missing),
            Err(DatasourceError::NotFound { .. })
        ));

        assert!(ds.delete("Choice", created.id).unwrap());
        assert!(!ds.delete("Choice", created.id).unwrap());
        assert!(ds.scan("Choice").unwrap().is_empty());
    }

    pub fn scan_is_ordered_and_isolated(ds: &dyn Datasource) {
        for text in ["c", "a", "b"] {
            ds.insert("Topic", attrs(json!({"name": text}))).unwrap();
        }
        ds.insert("Place", attrs(json!({"name": "x"}))).unwrap();

        let ids: Vec<_> = ds.scan("Topic").unwrap().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(ds.scan("Place").unwrap().len(), 1);
        assert!(ds.scan("Unknown").unwrap().is_empty());
    }
}
