//! # List Queries
//!
//! Parsing and evaluation of the query string of list, count and export
//! requests:
//!
//! | Parameter | Meaning |
//! |---|---|
//! | `page[number]`, `page[size]` | pagination, defaults 1 and 15 |
//! | `sort` | `field` or `-field` |
//! | `search` | free text |
//! | `filters` | JSON filter tree |
//! | `fields[<collection>]` | comma separated field list |
//! | `timezone` | IANA name used by date operators |

use crate::filter::{self, EvalContext, Filter, FilterError};
use crate::{Record, RecordId};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 15;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("invalid {parameter}: {value}")]
    InvalidParameter { parameter: String, value: String },
}

/// Sort order of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    /// Parse `field` or `-field`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (field, descending) = match text.strip_prefix('-') {
            Some(field) => (field, true),
            None => (text, false),
        };
        (!field.is_empty()).then(|| Sort {
            field: field.to_string(),
            descending,
        })
    }
}

/// One-based page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    #[must_use]
    pub fn offset(&self) -> usize {
        self.number.saturating_sub(1).saturating_mul(self.size)
    }
}

/// Parsed list request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: Option<Filter>,
    pub search: Option<String>,
    pub sort: Option<Sort>,
    pub page: Page,
    /// `fields[<collection>]` of the queried collection.
    pub fields: Option<Vec<String>>,
    /// Every `fields[...]` parameter, by collection or relationship name.
    pub all_fields: BTreeMap<String, Vec<String>>,
    pub timezone: Tz,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: None,
            search: None,
            sort: None,
            page: Page::default(),
            fields: None,
            all_fields: BTreeMap::new(),
            timezone: Tz::UTC,
        }
    }
}

fn positive(parameter: &str, value: &str) -> Result<usize, QueryError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| QueryError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
        })
}

impl ListQuery {
    /// Parse query-string parameters of a request on `collection`.
    pub fn parse(params: &BTreeMap<String, String>, collection: &str) -> Result<Self, QueryError> {
        let mut query = ListQuery::default();

        for (key, value) in params {
            match key.as_str() {
                "page[number]" => query.page.number = positive(key, value)?,
                "page[size]" => query.page.size = positive(key, value)?,
                "sort" => query.sort = Sort::parse(value),
                "search" => {
                    let term = value.trim();
                    query.search = (!term.is_empty()).then(|| term.to_string());
                }
                "filters" | "filter" if !value.trim().is_empty() => {
                    query.filter = Some(Filter::parse(value)?);
                }
                "timezone" => query.timezone = filter::parse_timezone(Some(value))?,
                _ => {
                    if let Some(name) = key
                        .strip_prefix("fields[")
                        .and_then(|rest| rest.strip_suffix(']'))
                    {
                        let list: Vec<String> = value
                            .split(',')
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .map(str::to_string)
                            .collect();
                        query.all_fields.insert(name.to_string(), list);
                    }
                }
            }
        }
        query.fields = query.all_fields.get(collection).cloned();
        Ok(query)
    }

    /// Parse the `all_records_subset_query` object sent by bulk operations.
    pub fn from_subset_query(
        subset: &Map<String, Value>,
        collection: &str,
    ) -> Result<Self, QueryError> {
        let params = subset
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => return None,
                    other => other.to_string(),
                };
                Some((k.clone(), text))
            })
            .collect();
        Self::parse(&params, collection)
    }

    /// Evaluation context of this request at `now`.
    #[must_use]
    pub fn context(&self, now: DateTime<Utc>) -> EvalContext {
        EvalContext::new(now, self.timezone)
    }

    fn matches_search(&self, record: &Record) -> bool {
        let Some(term) = &self.search else {
            return true;
        };
        if let Ok(id) = term.parse::<u64>() {
            if record.id == RecordId(id) {
                return true;
            }
        }
        let needle = term.to_lowercase();
        record
            .attributes
            .values()
            .filter_map(Value::as_str)
            .any(|text| text.to_lowercase().contains(&needle))
    }

    /// Records matching filter, scope and search, sorted, not paginated.
    #[must_use]
    pub fn select(
        &self,
        records: impl IntoIterator<Item = Record>,
        scope: Option<&Filter>,
        ctx: &EvalContext,
    ) -> Vec<Record> {
        let mut selected: Vec<Record> = records
            .into_iter()
            .filter(|r| self.filter.as_ref().is_none_or(|f| f.matches(r, ctx)))
            .filter(|r| scope.is_none_or(|s| s.matches(r, ctx)))
            .filter(|r| self.matches_search(r))
            .collect();

        selected.sort_by(|a, b| {
            let by_field = self.sort.as_ref().map_or(Ordering::Equal, |sort| {
                let left = a.value(&sort.field).unwrap_or(Value::Null);
                let right = b.value(&sort.field).unwrap_or(Value::Null);
                let order = sort_order(&left, &right);
                if sort.descending { order.reverse() } else { order }
            });
            by_field.then(a.id.cmp(&b.id))
        });
        selected
    }

    /// One page of matching records.
    #[must_use]
    pub fn apply(
        &self,
        records: impl IntoIterator<Item = Record>,
        scope: Option<&Filter>,
        ctx: &EvalContext,
    ) -> Vec<Record> {
        self.select(records, scope, ctx)
            .into_iter()
            .skip(self.page.offset())
            .take(self.page.size)
            .collect()
    }

    /// Number of matching records, pagination ignored.
    #[must_use]
    pub fn count(
        &self,
        records: impl IntoIterator<Item = Record>,
        scope: Option<&Filter>,
        ctx: &EvalContext,
    ) -> usize {
        self.select(records, scope, ctx).len()
    }
}

/// Nulls first, then natural order of numbers, dates, strings and booleans.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => filter::compare(a, b).unwrap_or(Ordering::Equal),
    }
}
