use super::{Datasource, DatasourceError, take_id};
use crate::{Attributes, Record, RecordId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

pub type LiveQueryHandler =
    Arc<dyn Fn(&str) -> Result<Vec<Attributes>, String> + Send + Sync>;

type Tables = BTreeMap<String, BTreeMap<RecordId, Attributes>>;

/// In-memory datasource.
#[derive(Default, Clone)]
pub struct MemoryDatasource {
    tables: Arc<RwLock<Tables>>,
    live_queries: Option<LiveQueryHandler>,
}

impl fmt::Debug for MemoryDatasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoryDatasource")
            .field("collections", &tables.keys().collect::<Vec<_>>())
            .field("live_queries", &self.live_queries.is_some())
            .finish()
    }
}

impl MemoryDatasource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a collection.
    #[must_use]
    pub fn with_records(self, collection: &str, records: Vec<Record>) -> Self {
        {
            let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
            let table = tables.entry(collection.to_string()).or_default();
            for record in records {
                table.insert(record.id, record.attributes);
            }
        }
        self
    }

    /// Answer live queries with `handler`.
    #[must_use]
    pub fn with_live_queries(
        mut self,
        handler: impl Fn(&str) -> Result<Vec<Attributes>, String> + Send + Sync + 'static,
    ) -> Self {
        self.live_queries = Some(Arc::new(handler));
        self
    }
}

impl Datasource for MemoryDatasource {
    fn scan(&self, collection: &str) -> Result<Vec<Record>, DatasourceError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, attributes)| Record::new(*id, attributes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get(&self, collection: &str, id: RecordId) -> Result<Option<Record>, DatasourceError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .and_then(|table| table.get(&id))
            .map(|attributes| Record::new(id, attributes.clone())))
    }

    fn insert(&self, collection: &str, mut attributes: Attributes) -> Result<Record, DatasourceError> {
        let explicit = take_id(&mut attributes)?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(collection.to_string()).or_default();

        let id = match explicit {
            Some(id) if table.contains_key(&id) => {
                return Err(DatasourceError::Conflict {
                    collection: collection.to_string(),
                    id,
                });
            }
            Some(id) => id,
            None => RecordId(
                table
                    .last_key_value()
                    .map_or(1, |(last, _)| last.0.saturating_add(1)),
            ),
        };
        table.insert(id, attributes.clone());
        Ok(Record::new(id, attributes))
    }

    fn update(&self, collection: &str, record: Record) -> Result<Record, DatasourceError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let slot = tables
            .get_mut(collection)
            .and_then(|table| table.get_mut(&record.id))
            .ok_or_else(|| DatasourceError::NotFound {
                collection: collection.to_string(),
                id: record.id,
            })?;
        *slot = record.attributes.clone();
        Ok(record)
    }

    fn delete(&self, collection: &str, id: RecordId) -> Result<bool, DatasourceError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get_mut(collection)
            .and_then(|table| table.remove(&id))
            .is_some())
    }

    fn live_query(&self, query: &str) -> Result<Vec<Attributes>, DatasourceError> {
        match &self.live_queries {
            Some(handler) => handler(query).map_err(DatasourceError::Query),
            None => Err(DatasourceError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::datasource::contract;
    use serde_json::json;

    #[test]
    fn insert_assigns_ids() {
        contract::insert_assigns_ids(&MemoryDatasource::new());
    }

    #[test]
    fn crud_roundtrip() {
        contract::crud_roundtrip(&MemoryDatasource::new());
    }

    #[test]
    fn scan_is_ordered_and_isolated() {
        contract::scan_is_ordered_and_isolated(&MemoryDatasource::new());
    }

    #[test]
    fn clones_share_tables() {
        let ds = MemoryDatasource::new();
        let other = ds.clone();
        ds.insert("Question", Attributes::new()).unwrap();
        assert_eq!(other.scan("Question").unwrap().len(), 1);
    }

    #[test]
    fn live_queries_need_a_handler() {
        assert!(matches!(
            MemoryDatasource::new().live_query("SELECT 1"),
            Err(DatasourceError::Unsupported)
        ));

        let ds = MemoryDatasource::new().with_live_queries(|_| {
            let mut row = Attributes::new();
            row.insert("value".into(), json!(3));
            Ok(vec![row])
        });
        assert_eq!(ds.live_query("SELECT 1").unwrap()[0]["value"], json!(3));
    }
}
