//! # Charts
//!
//! Computation of dashboard charts, either from chart parameters
//! (`POST /forest/stats/{collection}`) or from live SQL queries
//! (`POST /forest/stats`).
//!
//! | Type | Value shape |
//! |---|---|
//! | `Value` | `{"countCurrent": n, "countPrevious": n?}` |
//! | `Objective`, `Percentage` | `{"value": n}` |
//! | `Pie`, `Leaderboard` | `[{"key": k, "value": n}]` |
//! | `Line` | `[{"label": l, "values": {"value": n}}]` |

use crate::datasource::{Datasource, DatasourceError};
use crate::filter::{self, EvalContext, Filter, FilterError};
use crate::schema::{Relationship, Schema};
use crate::{Attributes, Record, RecordId};
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Datasource(#[from] DatasourceError),

    #[error("invalid chart request: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> StatsError {
    StatsError::Invalid(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartType {
    Value,
    Objective,
    Percentage,
    Pie,
    Line,
    Leaderboard,
}

impl ChartType {
    pub fn parse(name: &str) -> Result<Self, StatsError> {
        serde_json::from_value(Value::from(name)).map_err(|_| invalid(format!("unknown chart type {name}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    Count,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    Day,
    Week,
    Month,
    Year,
}

impl TimeRange {
    fn bucket(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            TimeRange::Day => Some(date),
            TimeRange::Week => {
                Some(date - TimeDelta::days(i64::from(date.weekday().num_days_from_monday())))
            }
            TimeRange::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
            TimeRange::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        }
    }

    fn next(self, bucket: NaiveDate) -> Option<NaiveDate> {
        match self {
            TimeRange::Day => bucket.succ_opt(),
            TimeRange::Week => bucket.checked_add_signed(TimeDelta::weeks(1)),
            TimeRange::Month => bucket.checked_add_months(Months::new(1)),
            TimeRange::Year => bucket.checked_add_months(Months::new(12)),
        }
    }

    fn label(self, bucket: NaiveDate) -> String {
        let pattern = match self {
            TimeRange::Day => "%d/%m/%Y",
            TimeRange::Week => "W%V-%G",
            TimeRange::Month => "%b %Y",
            TimeRange::Year => "%Y",
        };
        bucket.format(pattern).to_string()
    }
}

/// Chart parameters as sent by the admin UI.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRequest {
    pub chart: ChartType,
    pub collection: String,
    pub aggregate: Aggregate,
    pub aggregate_field: Option<String>,
    pub group_by_field: Option<String>,
    pub time_range: Option<TimeRange>,
    pub label_field: Option<String>,
    pub relationship_field: Option<String>,
    pub limit: Option<usize>,
    pub filter: Option<Filter>,
    pub timezone: chrono_tz::Tz,
}

fn text(body: &Map<String, Value>, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl StatRequest {
    /// Read a request body. `collection` defaults to the route's collection.
    pub fn from_body(body: &Map<String, Value>, collection: &str) -> Result<Self, StatsError> {
        let chart = ChartType::parse(
            body.get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("missing chart type"))?,
        )?;
        let aggregate = match body.get("aggregate").and_then(Value::as_str) {
            None => Aggregate::Count,
            Some(name) => serde_json::from_value(Value::from(name))
                .map_err(|_| invalid(format!("unknown aggregate {name}")))?,
        };
        let time_range = match body.get("time_range").and_then(Value::as_str) {
            None => None,
            Some(name) => Some(
                serde_json::from_value(Value::from(name))
                    .map_err(|_| invalid(format!("unknown time range {name}")))?,
            ),
        };
        let filter = match body.get("filters").or_else(|| body.get("filter")) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(value) => Some(Filter::from_json(value)?),
        };
        let limit = body.get("limit").and_then(|v| match v {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

        let request = StatRequest {
            chart,
            collection: text(body, "collection").unwrap_or_else(|| collection.to_string()),
            aggregate,
            aggregate_field: text(body, "aggregate_field"),
            group_by_field: text(body, "group_by_field").or_else(|| text(body, "group_by_date_field")),
            time_range,
            label_field: text(body, "label_field"),
            relationship_field: text(body, "relationship_field"),
            limit,
            filter,
            timezone: filter::parse_timezone(body.get("timezone").and_then(Value::as_str))?,
        };
        if request.aggregate == Aggregate::Sum && request.aggregate_field.is_none() {
            return Err(invalid("Sum needs an aggregate_field"));
        }
        Ok(request)
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn aggregate(records: &[&Record], how: Aggregate, field: Option<&str>) -> f64 {
    match (how, field) {
        (Aggregate::Sum, Some(field)) => records
            .iter()
            .map(|r| r.value(field).as_ref().map_or(0.0, as_f64))
            .sum(),
        _ => records.len() as f64,
    }
}

/// Compute a chart from its parameters. `scope` restricts the source
/// collection.
pub fn compute(
    request: &StatRequest,
    schema: &Schema,
    datasource: &dyn Datasource,
    scope: Option<&Filter>,
    now: DateTime<Utc>,
) -> Result<Value, StatsError> {
    let ctx = EvalContext::new(now, request.timezone);
    let records = datasource.scan(&request.collection)?;
    let selected = |ctx: &EvalContext| select(&records, request.filter.as_ref(), scope, ctx);
    let field = request.aggregate_field.as_deref();

    let value = match request.chart {
        ChartType::Value => {
            let current = aggregate(&selected(&ctx), request.aggregate, field);
            let previous = request
                .filter
                .as_ref()
                .and_then(|f| f.previous_period(&ctx))
                .map(|prev| aggregate(&selected(&prev), request.aggregate, field));
            let mut value = json!({"countCurrent": number(current)});
            if let Some(previous) = previous {
                value["countPrevious"] = number(previous);
            }
            value
        }
        ChartType::Objective | ChartType::Percentage => {
            json!({"value": number(aggregate(&selected(&ctx), request.aggregate, field))})
        }
        ChartType::Pie => pie(&selected(&ctx), request)?,
        ChartType::Line => line(&selected(&ctx), request)?,
        ChartType::Leaderboard => leaderboard(&selected(&ctx), request, schema, datasource)?,
    };
    Ok(value)
}

fn select<'a>(
    records: &'a [Record],
    filter: Option<&Filter>,
    scope: Option<&Filter>,
    ctx: &EvalContext,
) -> Vec<&'a Record> {
    records
        .iter()
        .filter(|r| filter.is_none_or(|f| f.matches(r, ctx)))
        .filter(|r| scope.is_none_or(|s| s.matches(r, ctx)))
        .collect()
}

fn pie(records: &[&Record], request: &StatRequest) -> Result<Value, StatsError> {
    let group_by = request
        .group_by_field
        .as_deref()
        .ok_or_else(|| invalid("Pie needs a group_by_field"))?;

    let mut groups: BTreeMap<String, (Value, Vec<&Record>)> = BTreeMap::new();
    for record in records {
        let key = record.value(group_by).unwrap_or(Value::Null);
        if key.is_null() {
            continue;
        }
        groups
            .entry(key.to_string())
            .or_insert_with(|| (key.clone(), Vec::new()))
            .1
            .push(record);
    }

    let mut entries: Vec<(Value, f64)> = groups
        .into_values()
        .map(|(key, members)| {
            let total = aggregate(&members, request.aggregate, request.aggregate_field.as_deref());
            (key, total)
        })
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(Value::Array(
        entries
            .into_iter()
            .map(|(key, value)| json!({"key": key, "value": number(value)}))
            .collect(),
    ))
}

fn line(records: &[&Record], request: &StatRequest) -> Result<Value, StatsError> {
    let group_by = request
        .group_by_field
        .as_deref()
        .ok_or_else(|| invalid("Line needs a group_by_date_field"))?;
    let range = request
        .time_range
        .ok_or_else(|| invalid("Line needs a time_range"))?;

    let mut buckets: BTreeMap<NaiveDate, Vec<&Record>> = BTreeMap::new();
    for record in records {
        let Some(date) = record
            .value(group_by)
            .and_then(|v| filter::parse_date(&v, request.timezone))
        else {
            continue;
        };
        let local = date.with_timezone(&request.timezone).date_naive();
        if let Some(bucket) = range.bucket(local) {
            buckets.entry(bucket).or_default().push(record);
        }
    }

    let (Some(first), Some(last)) = (
        buckets.keys().next().copied(),
        buckets.keys().next_back().copied(),
    ) else {
        return Ok(Value::Array(Vec::new()));
    };

    let mut points = Vec::new();
    let mut cursor = Some(first);
    while let Some(bucket) = cursor.filter(|b| *b <= last) {
        let total = buckets.get(&bucket).map_or(0.0, |members| {
            aggregate(members, request.aggregate, request.aggregate_field.as_deref())
        });
        points.push(json!({"label": range.label(bucket), "values": {"value": number(total)}}));
        cursor = range.next(bucket);
    }
    Ok(Value::Array(points))
}

fn leaderboard(
    records: &[&Record],
    request: &StatRequest,
    schema: &Schema,
    datasource: &dyn Datasource,
) -> Result<Value, StatsError> {
    let label_field = request
        .label_field
        .as_deref()
        .ok_or_else(|| invalid("Leaderboard needs a label_field"))?;
    let relationship = request
        .relationship_field
        .as_deref()
        .ok_or_else(|| invalid("Leaderboard needs a relationship_field"))?;

    let field = schema
        .collection(&request.collection)
        .and_then(|c| c.field(relationship))
        .filter(|f| {
            matches!(
                f.relationship,
                Some(Relationship::HasMany | Relationship::BelongsToMany)
            )
        })
        .ok_or_else(|| invalid(format!("{relationship} is not a has-many relationship")))?;
    let (Some(target), Some(inverse)) = (field.referenced_collection(), field.inverse_of.as_deref())
    else {
        return Err(invalid(format!("{relationship} has no inverse relationship")));
    };

    let related = datasource.scan(target)?;
    let mut by_parent: BTreeMap<RecordId, Vec<&Record>> = BTreeMap::new();
    for child in &related {
        if let Some(parent) = child.value(inverse).as_ref().and_then(RecordId::from_json) {
            by_parent.entry(parent).or_default().push(child);
        }
    }

    let mut entries: Vec<(Value, f64)> = records
        .iter()
        .map(|parent| {
            let children = by_parent.get(&parent.id).map_or(&[][..], Vec::as_slice);
            let total = aggregate(children, request.aggregate, request.aggregate_field.as_deref());
            (parent.value(label_field).unwrap_or(Value::Null), total)
        })
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1));
    if let Some(limit) = request.limit {
        entries.truncate(limit);
    }
    Ok(Value::Array(
        entries
            .into_iter()
            .map(|(key, value)| json!({"key": key, "value": number(value)}))
            .collect(),
    ))
}

/// Shape live query rows as a chart of type `chart`.
///
/// Rows carry `value`, plus `key` for grouped charts and `objective` for
/// objectives. A `Value` chart reads `previous` for the previous period.
pub fn from_live_query(chart: ChartType, rows: &[Attributes]) -> Result<Value, StatsError> {
    let field = |row: &Attributes, name: &str| row.get(name).cloned().unwrap_or(Value::Null);
    let first = || {
        rows.first()
            .ok_or_else(|| invalid("the query returned no row"))
    };
    let value = match chart {
        ChartType::Value => {
            let row = first()?;
            let mut value = json!({"countCurrent": field(row, "value")});
            if let Some(previous) = row.get("previous").filter(|v| !v.is_null()) {
                value["countPrevious"] = previous.clone();
            }
            value
        }
        ChartType::Objective => {
            let row = first()?;
            json!({"value": field(row, "value"), "objective": field(row, "objective")})
        }
        ChartType::Percentage => json!({"value": field(first()?, "value")}),
        ChartType::Pie | ChartType::Leaderboard => Value::Array(
            rows.iter()
                .map(|row| json!({"key": field(row, "key"), "value": field(row, "value")}))
                .collect(),
        ),
        ChartType::Line => Value::Array(
            rows.iter()
                .map(|row| json!({"label": field(row, "key"), "values": {"value": field(row, "value")}}))
                .collect(),
        ),
    };
    Ok(value)
}
