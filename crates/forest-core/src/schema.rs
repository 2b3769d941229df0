//! # Collection Schema
//!
//! Description of the collections exposed to the admin UI, in the shape of
//! `.forestadmin-schema.json`, plus the code-level customizations (smart
//! fields, action handlers and hooks) registered by the host application.

use crate::{Attributes, Record, RecordId, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid schema: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Kind of a relationship field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
}

fn yes() -> bool {
    true
}

/// A field of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field: String,
    /// `"String"`, `"Number"`, `"Date"`, ... or a one-element array for lists.
    #[serde(rename = "type")]
    pub field_type: Value,
    #[serde(default)]
    pub is_virtual: bool,
    /// `"<Collection>.<key>"` for relationships.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub inverse_of: Option<String>,
    #[serde(default)]
    pub relationship: Option<Relationship>,
    #[serde(default)]
    pub enums: Option<Vec<Value>>,
    #[serde(default = "yes")]
    pub is_filterable: bool,
    #[serde(default = "yes")]
    pub is_sortable: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_required: bool,
}

impl FieldSchema {
    /// A plain stored field.
    pub fn new(field: impl Into<String>, field_type: &str) -> Self {
        Self {
            field: field.into(),
            field_type: Value::from(field_type),
            is_virtual: false,
            reference: None,
            inverse_of: None,
            relationship: None,
            enums: None,
            is_filterable: true,
            is_sortable: true,
            is_read_only: false,
            is_required: false,
        }
    }

    /// A computed field backed by a [`SmartField`].
    pub fn smart(field: impl Into<String>, field_type: &str) -> Self {
        Self {
            is_virtual: true,
            is_filterable: false,
            is_sortable: false,
            is_read_only: true,
            ..Self::new(field, field_type)
        }
    }

    /// A relationship to `reference` (`"Collection.id"`).
    pub fn relation(
        field: impl Into<String>,
        relationship: Relationship,
        reference: &str,
        inverse_of: Option<&str>,
    ) -> Self {
        let field_type = match relationship {
            Relationship::HasMany | Relationship::BelongsToMany => Value::from(vec!["Number"]),
            Relationship::BelongsTo | Relationship::HasOne => Value::from("Number"),
        };
        Self {
            field_type,
            reference: Some(reference.to_string()),
            inverse_of: inverse_of.map(str::to_string),
            relationship: Some(relationship),
            ..Self::new(field, "Number")
        }
    }

    #[must_use]
    pub fn with_enums(mut self, enums: Vec<Value>) -> Self {
        self.enums = Some(enums);
        self
    }

    /// Collection named by `reference`.
    #[must_use]
    pub fn referenced_collection(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .map(|r| r.split_once('.').map_or(r, |(collection, _)| collection))
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        self.field_type.is_array()
    }
}

/// A field of an action form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionField {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: Value,
    #[serde(default)]
    pub enums: Option<Vec<Value>>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "defaultValue")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub hook: Option<String>,
}

/// Hooks declared by an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionHooks {
    #[serde(default)]
    pub load: bool,
    #[serde(default)]
    pub change: Vec<String>,
}

/// An action exposed on a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSchema {
    pub name: String,
    pub endpoint: String,
    #[serde(rename = "type", default = "single")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<ActionField>,
    #[serde(default)]
    pub hooks: ActionHooks,
    #[serde(default)]
    pub download: bool,
}

fn single() -> String {
    "single".to_string()
}

impl ActionSchema {
    /// An action reachable at `/forest/actions/<dasherized name>`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let endpoint = format!("/forest/actions/{}", dasherize(&name));
        Self {
            name,
            endpoint,
            kind: single(),
            fields: Vec::new(),
            hooks: ActionHooks::default(),
            download: false,
        }
    }

    /// Last path segment of the endpoint, which routes address.
    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        crate::action::action_name_from_endpoint(&self.endpoint)
    }
}

fn dasherize(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// A collection exposed to the admin UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub actions: Vec<ActionSchema>,
    #[serde(default = "yes")]
    pub is_searchable: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            actions: Vec::new(),
            is_searchable: true,
            is_read_only: false,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: ActionSchema) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field == name)
    }

    pub fn virtual_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_virtual)
    }

    /// Stored belongs-to fields; their attribute holds the foreign id.
    pub fn belongs_to(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields
            .iter()
            .filter(|f| f.relationship == Some(Relationship::BelongsTo))
    }

    pub fn relationships(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.relationship.is_some())
    }

    /// Action addressed by the last segment of its endpoint.
    #[must_use]
    pub fn action(&self, endpoint_name: &str) -> Option<&ActionSchema> {
        self.actions
            .iter()
            .find(|a| a.endpoint_name() == endpoint_name)
    }
}

/// All collections of the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub collections: Vec<CollectionSchema>,
    #[serde(default)]
    pub meta: Value,
}

impl Schema {
    pub fn new(collections: Vec<CollectionSchema>) -> Self {
        Self {
            collections,
            meta: Value::Null,
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a `.forestadmin-schema.json` file.
    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Find an action anywhere in the schema.
    #[must_use]
    pub fn find_action(&self, endpoint_name: &str) -> Option<(&CollectionSchema, &ActionSchema)> {
        self.collections
            .iter()
            .find_map(|c| c.action(endpoint_name).map(|a| (c, a)))
    }
}

// =============================================================================
// CUSTOMIZATIONS
// =============================================================================

pub type Getter = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
pub type Setter = Arc<dyn Fn(Record, &Value) -> Record + Send + Sync>;

/// Code behind a virtual field.
#[derive(Clone)]
pub struct SmartField {
    pub name: String,
    pub get: Option<Getter>,
    pub set: Option<Setter>,
}

impl SmartField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            get: None,
            set: None,
        }
    }

    #[must_use]
    pub fn getter(mut self, get: impl Fn(&Record) -> Value + Send + Sync + 'static) -> Self {
        self.get = Some(Arc::new(get));
        self
    }

    #[must_use]
    pub fn setter(mut self, set: impl Fn(Record, &Value) -> Record + Send + Sync + 'static) -> Self {
        self.set = Some(Arc::new(set));
        self
    }
}

impl fmt::Debug for SmartField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartField")
            .field("name", &self.name)
            .field("get", &self.get.is_some())
            .field("set", &self.set.is_some())
            .finish()
    }
}

/// What an action handler receives.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub collection: String,
    pub action: String,
    /// Targets, already restricted to the user's scope.
    pub records: Vec<Record>,
    pub values: Attributes,
    pub user: User,
}

impl ActionRequest {
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }
}

/// What a load or change hook receives.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub collection: String,
    pub action: String,
    /// Form fields as JSON objects (`field`, `type`, `value`, `enums`, ...).
    pub fields: Vec<Value>,
    pub ids: Vec<RecordId>,
    pub changed_field: Option<String>,
}

pub type ActionHandler = Arc<dyn Fn(&ActionRequest) -> Result<Value, String> + Send + Sync>;
pub type Hook = Arc<dyn Fn(&HookRequest) -> Vec<Value> + Send + Sync>;

/// Handler and hooks of one action.
#[derive(Clone, Default)]
pub struct ActionCode {
    pub handler: Option<ActionHandler>,
    pub load: Option<Hook>,
    pub change: Option<Hook>,
}

impl fmt::Debug for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCode")
            .field("handler", &self.handler.is_some())
            .field("load", &self.load.is_some())
            .field("change", &self.change.is_some())
            .finish()
    }
}

/// The two hook kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Load,
    Change,
}

impl HookKind {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "load" => Some(HookKind::Load),
            "change" => Some(HookKind::Change),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CollectionCode {
    smart_fields: Vec<SmartField>,
    actions: BTreeMap<String, ActionCode>,
}

/// Code registered by the host for its collections.
///
/// Actions are keyed by their endpoint name.
#[derive(Debug, Clone, Default)]
pub struct Customizations {
    collections: BTreeMap<String, CollectionCode>,
}

impl Customizations {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn smart_field(mut self, collection: &str, field: SmartField) -> Self {
        self.entry(collection).smart_fields.push(field);
        self
    }

    #[must_use]
    pub fn action(
        mut self,
        collection: &str,
        endpoint_name: &str,
        handler: impl Fn(&ActionRequest) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.action_entry(collection, endpoint_name).handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn hook(
        mut self,
        collection: &str,
        endpoint_name: &str,
        kind: HookKind,
        hook: impl Fn(&HookRequest) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        let code = self.action_entry(collection, endpoint_name);
        let hook: Hook = Arc::new(hook);
        match kind {
            HookKind::Load => code.load = Some(hook),
            HookKind::Change => code.change = Some(hook),
        }
        self
    }

    fn entry(&mut self, collection: &str) -> &mut CollectionCode {
        self.collections.entry(collection.to_string()).or_default()
    }

    fn action_entry(&mut self, collection: &str, endpoint_name: &str) -> &mut ActionCode {
        self.entry(collection)
            .actions
            .entry(endpoint_name.to_string())
            .or_default()
    }

    #[must_use]
    pub fn smart_fields(&self, collection: &str) -> &[SmartField] {
        self.collections
            .get(collection)
            .map_or(&[][..], |c| c.smart_fields.as_slice())
    }

    #[must_use]
    pub fn smart_field_named(&self, collection: &str, name: &str) -> Option<&SmartField> {
        self.smart_fields(collection).iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn action_code(&self, collection: &str, endpoint_name: &str) -> Option<&ActionCode> {
        self.collections
            .get(collection)
            .and_then(|c| c.actions.get(endpoint_name))
    }

    /// Registered hook of an action, if any.
    #[must_use]
    pub fn hook_for(&self, collection: &str, endpoint_name: &str, kind: HookKind) -> Option<&Hook> {
        let code = self.action_code(collection, endpoint_name)?;
        match kind {
            HookKind::Load => code.load.as_ref(),
            HookKind::Change => code.change.as_ref(),
        }
    }
}
