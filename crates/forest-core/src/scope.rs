//! Row-level scopes.
//!
//! A rendering may restrict the records its users see in a collection with a
//! filter. Condition values starting with `$currentUser` are placeholders,
//! resolved per user from the `dynamicScopesValues` shipped with the scope:
//!
//! ```json
//! {"Question": {"scope": {
//!     "filter": {"aggregator": "and", "conditions": [
//!         {"field": "question_text", "operator": "equal", "value": "$currentUser.firstName"}]},
//!     "dynamicScopesValues": {"users": {"1": {"$currentUser.firstName": "John"}}}}}}
//! ```

use crate::cache::{DEFAULT_SCOPES_TTL_SECS, TtlCache};
use crate::filter::{Filter, and_optional};
use crate::{RenderingId, User};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const PLACEHOLDER_PREFIX: &str = "$currentUser";

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("no dynamic value for {placeholder} (user {user_id})")]
    MissingDynamicValue {
        placeholder: String,
        user_id: String,
    },

    #[error("scopes of rendering {0} are not loaded")]
    NotLoaded(RenderingId),

    #[error("malformed scopes document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Per-user values of the placeholders used by a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicValues {
    #[serde(default)]
    pub users: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Scope of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionScope {
    pub filter: Filter,
    #[serde(rename = "dynamicScopesValues", default)]
    pub dynamic_values: DynamicValues,
}

impl CollectionScope {
    /// The filter with every placeholder replaced by `user`'s value.
    pub fn resolve(&self, user: &User) -> Result<Filter, ScopeError> {
        let values = self.dynamic_values.users.get(&user.id.0);
        self.filter.try_map_values(&mut |value| match value {
            Value::String(text) if text.starts_with(PLACEHOLDER_PREFIX) => values
                .and_then(|v| v.get(text))
                .cloned()
                .ok_or_else(|| ScopeError::MissingDynamicValue {
                    placeholder: text.clone(),
                    user_id: user.id.0.clone(),
                }),
            other => Ok(other.clone()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ScopeEntry {
    #[serde(default)]
    scope: Option<CollectionScope>,
}

/// Scopes of a rendering, by collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderingScopes {
    collections: BTreeMap<String, Option<ScopeEntry>>,
}

impl RenderingScopes {
    /// Parse the document served by `/liana/scopes`.
    pub fn from_value(value: Value) -> Result<Self, ScopeError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Attach a scope to a collection.
    pub fn insert(&mut self, collection: impl Into<String>, scope: CollectionScope) {
        self.collections
            .insert(collection.into(), Some(ScopeEntry { scope: Some(scope) }));
    }

    #[must_use]
    pub fn get(&self, collection: &str) -> Option<&CollectionScope> {
        self.collections
            .get(collection)
            .and_then(Option::as_ref)
            .and_then(|entry| entry.scope.as_ref())
    }

    /// Resolved scope of `collection` for `user`, `None` when unscoped.
    pub fn scope_for(&self, user: &User, collection: &str) -> Result<Option<Filter>, ScopeError> {
        self.get(collection).map(|s| s.resolve(user)).transpose()
    }
}

/// Combine a request filter with a scope.
#[must_use]
pub fn append_scope(existing: Option<Filter>, scope: Option<Filter>) -> Option<Filter> {
    and_optional(existing, scope)
}

/// State of a rendering's cached scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// Scopes cached per rendering.
#[derive(Debug, Clone)]
pub struct ScopeCache {
    entries: TtlCache<RenderingId, RenderingScopes>,
}

impl Default for ScopeCache {
    fn default() -> Self {
        Self::with_ttl_secs(DEFAULT_SCOPES_TTL_SECS)
    }
}

impl ScopeCache {
    #[must_use]
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            entries: TtlCache::new(ttl),
        }
    }

    #[must_use]
    pub fn with_ttl_secs(secs: i64) -> Self {
        Self {
            entries: TtlCache::with_ttl_secs(secs),
        }
    }

    #[must_use]
    pub fn freshness(&self, rendering: &RenderingId, now: DateTime<Utc>) -> Freshness {
        if self.entries.is_fresh(rendering, now) {
            Freshness::Fresh
        } else if self.entries.contains(rendering) {
            Freshness::Stale
        } else {
            Freshness::Missing
        }
    }

    pub fn store(&mut self, rendering: RenderingId, scopes: RenderingScopes, now: DateTime<Utc>) {
        tracing::debug!(rendering_id = %rendering, "scopes cached");
        self.entries.insert(rendering, scopes, now);
        tracing::trace!(cached = self.entries.len(), "scope cache size");
    }

    /// Resolved scope of `collection` for `user`, from whatever is cached.
    pub fn scope_for(&self, user: &User, collection: &str) -> Result<Option<Filter>, ScopeError> {
        self.entries
            .get_any(&user.rendering_id)
            .ok_or_else(|| ScopeError::NotLoaded(user.rendering_id.clone()))?
            .scope_for(user, collection)
    }

    #[must_use]
    pub fn fetched_at(&self, rendering: &RenderingId) -> Option<DateTime<Utc>> {
        self.entries.fetched_at(rendering)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::filter::Operator;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 7, 8, 9, 20, 22).unwrap()
    }

    fn document() -> Value {
        json!({
            "Question": {"scope": {
                "filter": {"aggregator": "and", "conditions": [
                    {"field": "question_text", "operator": "equal", "value": "$currentUser.firstName"},
                    {"field": "id", "operator": "greater_than", "value": 0}
                ]},
                "dynamicScopesValues": {"users": {"1": {"$currentUser.firstName": "what is your favorite color?"}}}
            }},
            "Choice": {"scope": null},
            "Place": null
        })
    }

    #[test]
    fn placeholders_resolve_per_user() {
        let scopes = RenderingScopes::from_value(document()).unwrap();
        let filter = scopes
            .scope_for(&User::new("1", "1"), "Question")
            .unwrap()
            .unwrap();
        let values: Vec<_> = filter.leaves().into_iter().map(|c| c.value.clone()).collect();
        assert_eq!(values, vec![json!("what is your favorite color?"), json!(0)]);
    }

    #[test]
    fn missing_dynamic_value_is_an_error() {
        let scopes = RenderingScopes::from_value(document()).unwrap();
        let err = scopes.scope_for(&User::new("2", "1"), "Question").unwrap_err();
        assert!(matches!(err, ScopeError::MissingDynamicValue { .. }));
    }

    #[test]
    fn unscoped_collections() {
        let scopes = RenderingScopes::from_value(document()).unwrap();
        let user = User::new("1", "1");
        assert!(scopes.scope_for(&user, "Choice").unwrap().is_none());
        assert!(scopes.scope_for(&user, "Place").unwrap().is_none());
        assert!(scopes.scope_for(&user, "Restaurant").unwrap().is_none());
    }

    #[test]
    fn append_scope_combines_with_and() {
        let a = Filter::condition("id", Operator::Equal, json!(1));
        let b = Filter::condition("id", Operator::Equal, json!(2));
        assert_eq!(append_scope(None, None), None);
        assert_eq!(append_scope(Some(a.clone()), None), Some(a.clone()));
        assert_eq!(append_scope(None, Some(b.clone())), Some(b.clone()));
        assert_eq!(
            append_scope(Some(a.clone()), Some(b.clone())),
            Some(Filter::and(vec![a, b]))
        );
    }

    #[test]
    fn cache_freshness_transitions() {
        let mut cache = ScopeCache::with_ttl_secs(300);
        let rendering = RenderingId("1".into());
        assert_eq!(cache.freshness(&rendering, t0()), Freshness::Missing);
        assert!(matches!(
            cache.scope_for(&User::new("1", "1"), "Question"),
            Err(ScopeError::NotLoaded(_))
        ));

        cache.store(rendering.clone(), RenderingScopes::default(), t0());
        assert_eq!(cache.freshness(&rendering, t0()), Freshness::Fresh);

        let later = t0() + TimeDelta::seconds(300);
        assert_eq!(cache.freshness(&rendering, later), Freshness::Stale);
        // stale scopes still answer
        assert!(cache.scope_for(&User::new("1", "1"), "Question").unwrap().is_none());
    }
}
