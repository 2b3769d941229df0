//! redb-backed datasource.
//!
//! Each collection is a `u64 -> JSON bytes` table named after the collection.
//! Every write runs in its own transaction.

use super::{Datasource, DatasourceError, take_id};
use crate::{Attributes, Record, RecordId};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use std::path::Path;

fn table(collection: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(collection)
}

fn storage<E: Into<redb::Error>>(err: E) -> DatasourceError {
    DatasourceError::Storage(err.into())
}

fn decode(id: u64, bytes: &[u8]) -> Result<Record, DatasourceError> {
    let attributes: Attributes = serde_json::from_slice(bytes)?;
    Ok(Record::new(RecordId(id), attributes))
}

/// Persistent datasource stored in a single redb file.
#[derive(Debug)]
pub struct RedbDatasource {
    db: Database,
}

impl RedbDatasource {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self, DatasourceError> {
        let db = Database::create(path).map_err(storage)?;
        tracing::info!(path = %path.display(), "redb datasource opened");
        Ok(Self { db })
    }
}

impl Datasource for RedbDatasource {
    fn scan(&self, collection: &str) -> Result<Vec<Record>, DatasourceError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(table(collection)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(storage(err)),
        };
        let mut records = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (id, bytes) = entry.map_err(storage)?;
            records.push(decode(id.value(), bytes.value())?);
        }
        Ok(records)
    }

    fn get(&self, collection: &str, id: RecordId) -> Result<Option<Record>, DatasourceError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(table(collection)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(storage(err)),
        };
        match table.get(id.0).map_err(storage)? {
            Some(bytes) => decode(id.0, bytes.value()).map(Some),
            None => Ok(None),
        }
    }

    fn insert(&self, collection: &str, mut attributes: Attributes) -> Result<Record, DatasourceError> {
        let explicit = take_id(&mut attributes)?;
        let bytes = serde_json::to_vec(&attributes)?;

        let txn = self.db.begin_write().map_err(storage)?;
        let id = {
            let mut table = txn.open_table(table(collection)).map_err(storage)?;
            let id = match explicit {
                Some(id) => {
                    if table.get(id.0).map_err(storage)?.is_some() {
                        return Err(DatasourceError::Conflict {
                            collection: collection.to_string(),
                            id,
                        });
                    }
                    id
                }
                None => {
                    let last = table.last().map_err(storage)?.map(|(k, _)| k.value());
                    RecordId(last.map_or(1, |k| k.saturating_add(1)))
                }
            };
            table.insert(id.0, bytes.as_slice()).map_err(storage)?;
            id
        };
        txn.commit().map_err(storage)?;
        Ok(Record::new(id, attributes))
    }

    fn update(&self, collection: &str, record: Record) -> Result<Record, DatasourceError> {
        let bytes = serde_json::to_vec(&record.attributes)?;
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(table(collection)).map_err(storage)?;
            if table.get(record.id.0).map_err(storage)?.is_none() {
                return Err(DatasourceError::NotFound {
                    collection: collection.to_string(),
                    id: record.id,
                });
            }
            table.insert(record.id.0, bytes.as_slice()).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(record)
    }

    fn delete(&self, collection: &str, id: RecordId) -> Result<bool, DatasourceError> {
        let txn = self.db.begin_write().map_err(storage)?;
        let existed = {
            let mut table = txn.open_table(table(collection)).map_err(storage)?;
            let removed = table.remove(id.0).map_err(storage)?;
            removed.is_some()
        };
        txn.commit().map_err(storage)?;
        Ok(existed)
    }
}
