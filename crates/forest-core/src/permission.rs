//! # Permission Engine
//!
//! Model, cache and evaluation of the permission documents served by the
//! remote authorization service (`/liana/v3/permissions`).
//!
//! ## Document shapes
//!
//! With roles ACL activated the document is global:
//!
//! ```json
//! {"data": {"collections": {"Question": {
//!      "collection": {"browseEnabled": true, "readEnabled": ["1"], "...": null},
//!      "actions": {"Send invoice": {"triggerEnabled": true}}}},
//!   "renderings": {"1": {}}},
//!  "stats": {"queries": ["SELECT ..."], "leaderboards": [{"type": "Leaderboard", "...": "..."}]},
//!  "meta": {"rolesACLActivated": true}}
//! ```
//!
//! Without it, `data` holds the legacy per-rendering format
//! (`list/show/create/update/delete/export/searchToEdit` and
//! `actions.{name}.{allowed, users}`), converted on load.
//!
//! ## Freshness
//!
//! Collection permissions and rendering stats are cached separately, each
//! with its own fetch instant. A collection or action check only looks at the
//! collection entry; a chart check only looks at the rendering stats entry.

use crate::cache::{DEFAULT_PERMISSIONS_TTL_SECS, TtlCache};
use crate::{RenderingId, User, identifier_string};
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while loading a permission document.
#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("malformed permission document: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// ENABLED FLAG
// =============================================================================

/// Value of a `*Enabled` flag.
///
/// `null` locks everybody out, a list grants access to the listed user or
/// role identifiers only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Enabled {
    Allowed(bool),
    #[default]
    LockedOut,
    Only(Vec<String>),
}

impl Enabled {
    /// Whether this flag lets `user` through.
    #[must_use]
    pub fn allows(&self, user: &User) -> bool {
        match self {
            Enabled::Allowed(allowed) => *allowed,
            Enabled::LockedOut => false,
            Enabled::Only(ids) => ids.iter().any(|id| {
                *id == user.id.0 || user.role_id.as_deref().is_some_and(|role| id == role)
            }),
        }
    }
}

impl<'de> Deserialize<'de> for Enabled {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(Enabled::Allowed(b)),
            Value::Null => Ok(Enabled::LockedOut),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    identifier_string(item).ok_or_else(|| {
                        de::Error::custom(format!("invalid identifier in permission list: {item}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Enabled::Only),
            other => Err(de::Error::custom(format!(
                "expected a boolean, null or a list, got {other}"
            ))),
        }
    }
}

impl Serialize for Enabled {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Enabled::Allowed(b) => serializer.serialize_bool(*b),
            Enabled::LockedOut => serializer.serialize_none(),
            Enabled::Only(ids) => ids.serialize(serializer),
        }
    }
}

// =============================================================================
// PERMISSION SETS
// =============================================================================

/// Operations on a collection guarded by an `*Enabled` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionAction {
    Browse,
    Read,
    Add,
    Edit,
    Delete,
    Export,
}

impl CollectionAction {
    /// Name of the flag in permission documents.
    #[must_use]
    pub fn flag_name(self) -> &'static str {
        match self {
            CollectionAction::Browse => "browseEnabled",
            CollectionAction::Read => "readEnabled",
            CollectionAction::Add => "addEnabled",
            CollectionAction::Edit => "editEnabled",
            CollectionAction::Delete => "deleteEnabled",
            CollectionAction::Export => "exportEnabled",
        }
    }
}

/// Collection-level flags. A flag missing from the document is locked out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionPermissions {
    #[serde(rename = "browseEnabled", default)]
    pub browse: Enabled,
    #[serde(rename = "readEnabled", default)]
    pub read: Enabled,
    #[serde(rename = "addEnabled", default)]
    pub add: Enabled,
    #[serde(rename = "editEnabled", default)]
    pub edit: Enabled,
    #[serde(rename = "deleteEnabled", default)]
    pub delete: Enabled,
    #[serde(rename = "exportEnabled", default)]
    pub export: Enabled,
}

impl CollectionPermissions {
    #[must_use]
    pub fn flag(&self, action: CollectionAction) -> &Enabled {
        match action {
            CollectionAction::Browse => &self.browse,
            CollectionAction::Read => &self.read,
            CollectionAction::Add => &self.add,
            CollectionAction::Edit => &self.edit,
            CollectionAction::Delete => &self.delete,
            CollectionAction::Export => &self.export,
        }
    }
}

/// Permission of a smart action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPermission {
    #[serde(rename = "triggerEnabled", default)]
    pub trigger: Enabled,
}

/// Everything known about one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    #[serde(default)]
    pub collection: CollectionPermissions,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionPermission>,
}

/// Collection name to permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    pub collections: BTreeMap<String, CollectionEntry>,
}

// =============================================================================
// LEGACY FORMAT
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyFlags {
    list: bool,
    show: bool,
    create: bool,
    update: bool,
    delete: bool,
    export: bool,
    #[serde(rename = "searchToEdit")]
    search_to_edit: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyAction {
    allowed: bool,
    users: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyCollection {
    collection: LegacyFlags,
    actions: BTreeMap<String, LegacyAction>,
}

impl From<LegacyCollection> for CollectionEntry {
    fn from(legacy: LegacyCollection) -> Self {
        let flags = legacy.collection;
        let collection = CollectionPermissions {
            browse: Enabled::Allowed(flags.list || flags.search_to_edit),
            read: Enabled::Allowed(flags.show),
            add: Enabled::Allowed(flags.create),
            edit: Enabled::Allowed(flags.update),
            delete: Enabled::Allowed(flags.delete),
            export: Enabled::Allowed(flags.export),
        };
        let actions = legacy
            .actions
            .into_iter()
            .map(|(name, action)| {
                let trigger = match (action.allowed, action.users) {
                    (false, _) => Enabled::Allowed(false),
                    (true, None) => Enabled::Allowed(true),
                    (true, Some(users)) => {
                        Enabled::Only(users.iter().filter_map(identifier_string).collect())
                    }
                };
                (name, ActionPermission { trigger })
            })
            .collect();
        CollectionEntry {
            collection,
            actions,
        }
    }
}

// =============================================================================
// STATS PERMISSIONS
// =============================================================================

/// Chart definitions a rendering is allowed to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsPermissions {
    pub queries: Vec<String>,
    pub leaderboards: Vec<Value>,
    pub lines: Vec<Value>,
    pub objectives: Vec<Value>,
    pub percentages: Vec<Value>,
    pub pies: Vec<Value>,
    pub values: Vec<Value>,
}

impl StatsPermissions {
    /// Allow-list matching a chart type name (`Value`, `Pie`, ...).
    #[must_use]
    pub fn pool(&self, chart_type: &str) -> Option<&[Value]> {
        let pool = match chart_type {
            "Value" => &self.values,
            "Objective" => &self.objectives,
            "Pie" => &self.pies,
            "Line" => &self.lines,
            "Leaderboard" => &self.leaderboards,
            "Percentage" => &self.percentages,
            _ => return None,
        };
        Some(pool.as_slice())
    }

    /// Whether a raw SQL query is one of the allowed live queries.
    #[must_use]
    pub fn allows_live_query(&self, query: &str) -> bool {
        let wanted = normalize_query(query);
        self.queries.iter().any(|q| normalize_query(q) == wanted)
    }

    /// Whether a chart request (admin UI body) matches an allowed definition.
    #[must_use]
    pub fn allows_stat(&self, request: &Map<String, Value>) -> bool {
        let normalized = normalize_stat(request);
        let Some(chart_type) = normalized.get("type").and_then(Value::as_str) else {
            return false;
        };
        let Some(pool) = self.pool(chart_type) else {
            return false;
        };
        pool.iter()
            .filter_map(Value::as_object)
            .any(|entry| normalize_stat(entry) == normalized)
    }
}

/// Collapse whitespace and drop trailing semicolons.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

/// Bring a chart request or definition to the permission vocabulary.
///
/// Body keys are renamed, `timezone` and nulls are dropped, and filters
/// sent as JSON text are parsed so both sides compare structurally.
#[must_use]
pub fn normalize_stat(raw: &Map<String, Value>) -> BTreeMap<String, Value> {
    raw.iter()
        .filter(|(key, value)| !value.is_null() && key.as_str() != "timezone")
        .map(|(key, value)| {
            let key = match key.as_str() {
                "collection" => "sourceCollectionId",
                "aggregate" => "aggregator",
                "aggregate_field" => "aggregateFieldName",
                "group_by_field" | "group_by_date_field" => "groupByFieldName",
                "time_range" => "timeRange",
                "label_field" => "labelFieldName",
                "relationship_field" => "relationshipFieldName",
                "filters" => "filter",
                other => other,
            };
            let value = match value {
                Value::String(text) if text.trim_start().starts_with('{') => {
                    serde_json::from_str(text).unwrap_or_else(|_| value.clone())
                }
                Value::String(text) if key == "limit" => {
                    text.parse::<u64>().map(Value::from).unwrap_or_else(|_| value.clone())
                }
                _ => value.clone(),
            };
            (key.to_string(), value)
        })
        .collect()
}

// =============================================================================
// PAYLOAD
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadMeta {
    #[serde(rename = "rolesACLActivated", default)]
    pub roles_acl_activated: bool,
}

/// Permission document as served by the authorization service.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionPayload {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub stats: Option<StatsPermissions>,
    #[serde(default)]
    pub meta: PayloadMeta,
}

impl PermissionPayload {
    /// Parse a raw document.
    pub fn from_value(value: Value) -> Result<Self, PermissionError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Extract the collection permissions, converting the legacy format.
    pub fn permission_set(&self) -> Result<PermissionSet, PermissionError> {
        if self.meta.roles_acl_activated {
            let collections = self
                .data
                .get("collections")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            return Ok(PermissionSet {
                collections: serde_json::from_value(collections)?,
            });
        }

        let legacy: BTreeMap<String, LegacyCollection> = match &self.data {
            Value::Null => BTreeMap::new(),
            data => serde_json::from_value(data.clone())?,
        };
        Ok(PermissionSet {
            collections: legacy
                .into_iter()
                .map(|(name, c)| (name, CollectionEntry::from(c)))
                .collect(),
        })
    }
}

// =============================================================================
// PERMISSION REQUEST
// =============================================================================

/// What an incoming request needs to be allowed.
#[derive(Debug, Clone, PartialEq)]
pub enum Permission {
    Collection {
        collection: String,
        action: CollectionAction,
    },
    TriggerAction {
        collection: String,
        action: String,
    },
    LiveQuery {
        query: String,
    },
    StatWithParameters {
        request: Map<String, Value>,
    },
}

impl Permission {
    pub fn collection(collection: impl Into<String>, action: CollectionAction) -> Self {
        Permission::Collection {
            collection: collection.into(),
            action,
        }
    }

    /// Chart checks are answered from rendering stats.
    #[must_use]
    pub fn uses_stats(&self) -> bool {
        matches!(
            self,
            Permission::LiveQuery { .. } | Permission::StatWithParameters { .. }
        )
    }

    /// Short label for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Permission::Collection { collection, action } => {
                format!("{}:{}", collection, action.flag_name())
            }
            Permission::TriggerAction { collection, action } => {
                format!("{}:action:{}", collection, action)
            }
            Permission::LiveQuery { .. } => "liveQueries".to_string(),
            Permission::StatWithParameters { .. } => "statWithParameters".to_string(),
        }
    }
}

// =============================================================================
// PERMISSION CACHE
// =============================================================================

/// Where collection permissions are stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SetKey {
    /// Roles ACL: one document for every rendering.
    Global,
    /// Legacy: one document per rendering.
    Rendering(RenderingId),
}

/// Cached permission state of the agent.
#[derive(Debug, Clone)]
pub struct PermissionCache {
    roles_acl_activated: bool,
    sets: TtlCache<SetKey, PermissionSet>,
    stats: TtlCache<RenderingId, Option<StatsPermissions>>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::with_ttl_secs(DEFAULT_PERMISSIONS_TTL_SECS)
    }
}

impl PermissionCache {
    #[must_use]
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            roles_acl_activated: false,
            sets: TtlCache::new(ttl),
            stats: TtlCache::new(ttl),
        }
    }

    #[must_use]
    pub fn with_ttl_secs(secs: i64) -> Self {
        Self::new(TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::zero()))
    }

    /// Mode reported by the last stored document.
    #[must_use]
    pub fn roles_acl_activated(&self) -> bool {
        self.roles_acl_activated
    }

    fn set_key(&self, rendering: &RenderingId) -> SetKey {
        if self.roles_acl_activated {
            SetKey::Global
        } else {
            SetKey::Rendering(rendering.clone())
        }
    }

    /// When the entry answering `permission` was fetched.
    #[must_use]
    pub fn fetched_at(
        &self,
        permission: &Permission,
        rendering: &RenderingId,
    ) -> Option<DateTime<Utc>> {
        if permission.uses_stats() {
            self.stats.fetched_at(rendering)
        } else {
            self.sets.fetched_at(&self.set_key(rendering))
        }
    }

    /// Whether the entry answering `permission` is missing or expired.
    #[must_use]
    pub fn needs_refresh(
        &self,
        permission: &Permission,
        rendering: &RenderingId,
        now: DateTime<Utc>,
    ) -> bool {
        if permission.uses_stats() {
            !self.stats.is_fresh(rendering, now)
        } else {
            !self.sets.is_fresh(&self.set_key(rendering), now)
        }
    }

    /// Record a freshly fetched document for `rendering`.
    pub fn store(
        &mut self,
        payload: &PermissionPayload,
        rendering: &RenderingId,
        now: DateTime<Utc>,
    ) -> Result<(), PermissionError> {
        let set = payload.permission_set()?;
        self.roles_acl_activated = payload.meta.roles_acl_activated;
        let key = self.set_key(rendering);
        self.sets.insert(key, set, now);
        self.stats.insert(rendering.clone(), payload.stats.clone(), now);
        tracing::debug!(
            rendering_id = %rendering,
            roles_acl = self.roles_acl_activated,
            cached_renderings = self.stats.len(),
            "permissions cached"
        );
        Ok(())
    }

    /// Evaluate `permission` for `user` against whatever is cached.
    ///
    /// Staleness is not considered here; nothing cached means denied.
    #[must_use]
    pub fn is_allowed(&self, permission: &Permission, user: &User) -> bool {
        let rendering = &user.rendering_id;
        match permission {
            Permission::Collection { collection, action } => self
                .collection_entry(rendering, collection)
                .is_some_and(|entry| entry.collection.flag(*action).allows(user)),
            Permission::TriggerAction { collection, action } => self
                .collection_entry(rendering, collection)
                .and_then(|entry| entry.actions.get(action))
                .is_some_and(|a| a.trigger.allows(user)),
            Permission::LiveQuery { query } => self
                .rendering_stats(rendering)
                .is_some_and(|stats| stats.allows_live_query(query)),
            Permission::StatWithParameters { request } => self
                .rendering_stats(rendering)
                .is_some_and(|stats| stats.allows_stat(request)),
        }
    }

    fn collection_entry(&self, rendering: &RenderingId, collection: &str) -> Option<&CollectionEntry> {
        self.sets
            .get_any(&self.set_key(rendering))
            .and_then(|set| set.collections.get(collection))
    }

    fn rendering_stats(&self, rendering: &RenderingId) -> Option<&StatsPermissions> {
        self.stats.get_any(rendering).and_then(Option::as_ref)
    }

    /// Forget everything, including the roles ACL mode.
    pub fn clear(&mut self) {
        self.roles_acl_activated = false;
        self.sets.clear();
        self.stats.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
