//! # Forest Core
//!
//! The policy and query engine of the Forest admin agent.
//!
//! This crate holds everything that can be decided without touching the
//! network: permission evaluation, the TTL caches behind it, row-level scopes,
//! filter trees, list queries, smart fields and chart computation. The agent
//! app (`apps/forest-agent`) feeds it with documents fetched from the remote
//! authorization service and with records from a [`datasource::Datasource`].
//!
//! ## Layout
//!
//! ```text
//! clock ──► cache ──► permission (PermissionCache, evaluation)
//!                └──► scope      (ScopeCache, dynamic values)
//! filter ──► query ──► datasource (memory, redb)
//!       └──► stats
//! schema ──► smart_field, action
//! ```

pub mod action;
pub mod cache;
pub mod clock;
pub mod datasource;
pub mod filter;
pub mod permission;
pub mod query;
pub mod schema;
pub mod scope;
pub mod smart_field;
pub mod stats;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub use cache::TtlCache;
pub use clock::{Clock, MockClock, SystemClock};
pub use datasource::{Datasource, DatasourceError, MemoryDatasource, RedbDatasource};
pub use filter::{EvalContext, Filter, FilterError};
pub use permission::{CollectionAction, Enabled, Permission, PermissionCache, PermissionPayload};
pub use query::{ListQuery, QueryError};
pub use schema::{CollectionSchema, Customizations, FieldSchema, Schema, SmartField};
pub use scope::{ScopeCache, ScopeError};
pub use stats::{StatRequest, StatsError};

// =============================================================================
// RECORD IDENTIFIERS
// =============================================================================

/// Primary key of a record inside a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(RecordId)
    }
}

impl RecordId {
    /// Read an id from a JSON value (`1` or `"1"`).
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(RecordId),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Attribute map of a record. Insertion order is preserved.
pub type Attributes = serde_json::Map<String, Value>;

// =============================================================================
// RECORD
// =============================================================================

/// A row of a collection as seen by the agent.
///
/// The primary key is kept outside of `attributes`; [`Record::value`] still
/// resolves the `id` field so filters and sorts can address it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub attributes: Attributes,
}

impl Record {
    /// Create a record from an id and its attributes.
    #[must_use]
    pub fn new(id: RecordId, attributes: Attributes) -> Self {
        Self { id, attributes }
    }

    /// Look up a field, `id` included.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<Value> {
        if field == "id" {
            return Some(Value::from(self.id.0));
        }
        self.attributes.get(field).cloned()
    }
}

// =============================================================================
// USERS
// =============================================================================

/// Identifier of an admin user, normalized to its decimal string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Identifier of a rendering (UI layout bound to a set of roles).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderingId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RenderingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authenticated admin user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub team: String,
    pub role_id: Option<String>,
    pub rendering_id: RenderingId,
}

impl User {
    /// Minimal user, mostly useful for tests and embedding hosts.
    #[must_use]
    pub fn new(id: impl Into<String>, rendering_id: impl Into<String>) -> Self {
        Self {
            id: UserId(id.into()),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            team: String::new(),
            role_id: None,
            rendering_id: RenderingId(rendering_id.into()),
        }
    }
}

/// Render a JSON scalar as the identifier string used in permission lists.
///
/// Numbers keep their decimal form, strings are taken verbatim, anything
/// else has no identifier form.
#[must_use]
pub fn identifier_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
