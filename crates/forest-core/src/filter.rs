//! # Filter Trees
//!
//! Boolean expression trees over `field / operator / value` conditions, as
//! sent by the admin UI in `filters` query parameters, stored in segment and
//! chart definitions, and used as row-level scopes.
//!
//! ```json
//! {"aggregator": "and", "conditions": [
//!     {"field": "question_text", "operator": "contains", "value": "what"},
//!     {"field": "pub_date", "operator": "previous_month", "value": null}
//! ]}
//! ```
//!
//! Date operators are evaluated in the request timezone against the `now`
//! carried by [`EvalContext`].

use crate::Record;
use chrono::{
    DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while reading a filter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter JSON: {0}")]
    Json(String),

    #[error("unknown filter operator: {0}")]
    UnknownOperator(String),

    #[error("unknown filter aggregator: {0}")]
    UnknownAggregator(String),

    #[error("malformed filter: {0}")]
    Malformed(String),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

// =============================================================================
// OPERATORS
// =============================================================================

/// How conditions of an aggregation are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    And,
    Or,
}

/// Condition operators understood by the admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Present,
    Blank,
    In,
    IncludesAll,
    Before,
    After,
    Past,
    Future,
    Today,
    Yesterday,
    PreviousXDays,
    PreviousXDaysToDate,
    PreviousWeek,
    PreviousWeekToDate,
    PreviousMonth,
    PreviousMonthToDate,
    PreviousQuarter,
    PreviousQuarterToDate,
    PreviousYear,
    PreviousYearToDate,
    BeforeXHoursAgo,
    AfterXHoursAgo,
}

impl Operator {
    /// Parse the wire name of an operator.
    pub fn parse(name: &str) -> Result<Self, FilterError> {
        serde_json::from_value(Value::String(name.to_string()))
            .map_err(|_| FilterError::UnknownOperator(name.to_string()))
    }

    /// Operators that select a calendar period relative to `now`.
    #[must_use]
    pub fn is_date_period(self) -> bool {
        matches!(
            self,
            Operator::Today
                | Operator::Yesterday
                | Operator::PreviousXDays
                | Operator::PreviousXDaysToDate
                | Operator::PreviousWeek
                | Operator::PreviousWeekToDate
                | Operator::PreviousMonth
                | Operator::PreviousMonthToDate
                | Operator::PreviousQuarter
                | Operator::PreviousQuarterToDate
                | Operator::PreviousYear
                | Operator::PreviousYearToDate
        )
    }
}

// =============================================================================
// FILTER
// =============================================================================

/// A leaf condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// A filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "Value")]
pub enum Filter {
    Aggregation {
        aggregator: Aggregator,
        conditions: Vec<Filter>,
    },
    Condition(Condition),
}

impl TryFrom<Value> for Filter {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Filter::from_json(&value)
    }
}

impl Filter {
    /// Build an `and` of the given filters.
    #[must_use]
    pub fn and(conditions: Vec<Filter>) -> Self {
        Filter::Aggregation {
            aggregator: Aggregator::And,
            conditions,
        }
    }

    /// Build an `or` of the given filters.
    #[must_use]
    pub fn or(conditions: Vec<Filter>) -> Self {
        Filter::Aggregation {
            aggregator: Aggregator::Or,
            conditions,
        }
    }

    /// Shorthand for a leaf condition.
    pub fn condition(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Filter::Condition(Condition::new(field, operator, value))
    }

    /// Parse the JSON text form used in query strings.
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FilterError::Json(e.to_string()))?;
        Self::from_json(&value)
    }

    /// Read a filter from its JSON form. A JSON string is parsed as text first.
    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        match value {
            Value::String(text) => Self::parse(text),
            Value::Object(map) => {
                if let Some(aggregator) = map.get("aggregator") {
                    let aggregator = match aggregator.as_str() {
                        Some(name) if name.eq_ignore_ascii_case("and") => Aggregator::And,
                        Some(name) if name.eq_ignore_ascii_case("or") => Aggregator::Or,
                        _ => return Err(FilterError::UnknownAggregator(aggregator.to_string())),
                    };
                    let conditions = map
                        .get("conditions")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            FilterError::Malformed("aggregation without conditions".into())
                        })?
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Filter::Aggregation {
                        aggregator,
                        conditions,
                    });
                }

                let field = map
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FilterError::Malformed("condition without field".into()))?;
                let operator = map
                    .get("operator")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FilterError::Malformed("condition without operator".into()))?;
                Ok(Filter::condition(
                    field,
                    Operator::parse(operator)?,
                    map.get("value").cloned().unwrap_or(Value::Null),
                ))
            }
            other => Err(FilterError::Malformed(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    /// Serialize back to JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Iterate over every leaf condition of the tree.
    pub fn leaves(&self) -> Vec<&Condition> {
        match self {
            Filter::Condition(c) => vec![c],
            Filter::Aggregation { conditions, .. } => {
                conditions.iter().flat_map(Filter::leaves).collect()
            }
        }
    }

    /// Rewrite every leaf value through `f`.
    pub fn try_map_values<E>(
        &self,
        f: &mut impl FnMut(&Value) -> Result<Value, E>,
    ) -> Result<Filter, E> {
        match self {
            Filter::Condition(c) => Ok(Filter::Condition(Condition {
                field: c.field.clone(),
                operator: c.operator,
                value: f(&c.value)?,
            })),
            Filter::Aggregation {
                aggregator,
                conditions,
            } => Ok(Filter::Aggregation {
                aggregator: *aggregator,
                conditions: conditions
                    .iter()
                    .map(|c| c.try_map_values(f))
                    .collect::<Result<Vec<_>, E>>()?,
            }),
        }
    }

    /// Evaluate the tree against a record.
    ///
    /// An empty `and` matches everything, an empty `or` matches nothing.
    #[must_use]
    pub fn matches(&self, record: &Record, ctx: &EvalContext) -> bool {
        match self {
            Filter::Condition(c) => condition_matches(c, record, ctx),
            Filter::Aggregation {
                aggregator: Aggregator::And,
                conditions,
            } => conditions.iter().all(|f| f.matches(record, ctx)),
            Filter::Aggregation {
                aggregator: Aggregator::Or,
                conditions,
            } => conditions.iter().any(|f| f.matches(record, ctx)),
        }
    }

    /// Context under which this filter selects the period preceding the one
    /// it selects under `ctx`.
    ///
    /// Only defined when the tree holds exactly one date-period condition.
    #[must_use]
    pub fn previous_period(&self, ctx: &EvalContext) -> Option<EvalContext> {
        let mut periods = self
            .leaves()
            .into_iter()
            .filter(|c| c.operator.is_date_period());
        let condition = periods.next()?;
        if periods.next().is_some() {
            return None;
        }

        let local = ctx.now.with_timezone(&ctx.timezone);
        let shifted = match condition.operator {
            Operator::Today | Operator::Yesterday => local - TimeDelta::days(1),
            Operator::PreviousXDays | Operator::PreviousXDaysToDate => {
                local.checked_sub_signed(TimeDelta::try_days(as_count(&condition.value)?)?)?
            }
            Operator::PreviousWeek | Operator::PreviousWeekToDate => local - TimeDelta::weeks(1),
            Operator::PreviousMonth | Operator::PreviousMonthToDate => {
                local.checked_sub_months(Months::new(1))?
            }
            Operator::PreviousQuarter | Operator::PreviousQuarterToDate => {
                local.checked_sub_months(Months::new(3))?
            }
            Operator::PreviousYear | Operator::PreviousYearToDate => {
                local.checked_sub_months(Months::new(12))?
            }
            _ => return None,
        };
        Some(EvalContext {
            now: shifted.with_timezone(&Utc),
            timezone: ctx.timezone,
        })
    }
}

/// Combine two optional filters with `and`.
#[must_use]
pub fn and_optional(left: Option<Filter>, right: Option<Filter>) -> Option<Filter> {
    match (left, right) {
        (None, None) => None,
        (Some(f), None) | (None, Some(f)) => Some(f),
        (Some(l), Some(r)) => Some(Filter::and(vec![l, r])),
    }
}

// =============================================================================
// EVALUATION CONTEXT
// =============================================================================

/// Clock and timezone used to evaluate relative date operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    pub now: DateTime<Utc>,
    pub timezone: Tz,
}

impl EvalContext {
    #[must_use]
    pub fn new(now: DateTime<Utc>, timezone: Tz) -> Self {
        Self { now, timezone }
    }

    /// Context in UTC.
    #[must_use]
    pub fn utc(now: DateTime<Utc>) -> Self {
        Self::new(now, Tz::UTC)
    }
}

/// Parse an IANA timezone name, `None` meaning UTC.
pub fn parse_timezone(name: Option<&str>) -> Result<Tz, FilterError> {
    match name {
        None => Ok(Tz::UTC),
        Some(n) if n.trim().is_empty() => Ok(Tz::UTC),
        Some(n) => n
            .parse::<Tz>()
            .map_err(|_| FilterError::UnknownTimezone(n.to_string())),
    }
}

// =============================================================================
// CONDITION EVALUATION
// =============================================================================

fn condition_matches(c: &Condition, record: &Record, ctx: &EvalContext) -> bool {
    let actual = record.value(&c.field).unwrap_or(Value::Null);
    let expected = &c.value;

    match c.operator {
        Operator::Equal => loose_eq(&actual, expected),
        Operator::NotEqual => !loose_eq(&actual, expected),
        Operator::GreaterThan => compare(&actual, expected) == Some(Ordering::Greater),
        Operator::LessThan => compare(&actual, expected) == Some(Ordering::Less),
        Operator::Contains => with_strings(&actual, expected, |a, e| a.contains(e)),
        Operator::NotContains => !with_strings(&actual, expected, |a, e| a.contains(e)),
        Operator::StartsWith => with_strings(&actual, expected, |a, e| a.starts_with(e)),
        Operator::EndsWith => with_strings(&actual, expected, |a, e| a.ends_with(e)),
        Operator::Present => !is_blank(&actual),
        Operator::Blank => is_blank(&actual),
        Operator::In => value_list(expected).iter().any(|e| loose_eq(&actual, e)),
        Operator::IncludesAll => match &actual {
            Value::Array(items) => value_list(expected)
                .iter()
                .all(|e| items.iter().any(|i| loose_eq(i, e))),
            _ => false,
        },
        Operator::Before => match (parse_date(&actual, ctx.timezone), parse_date(expected, ctx.timezone)) {
            (Some(a), Some(e)) => a < e,
            _ => false,
        },
        Operator::After => match (parse_date(&actual, ctx.timezone), parse_date(expected, ctx.timezone)) {
            (Some(a), Some(e)) => a > e,
            _ => false,
        },
        _ => {
            let Some(date) = parse_date(&actual, ctx.timezone) else {
                return false;
            };
            period(c.operator, expected, ctx).is_some_and(|range| range.contains(date))
        }
    }
}

/// Half-open `[start, end)` instant range, each bound optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl DateRange {
    fn bounded(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| instant >= s) && self.end.is_none_or(|e| instant < e)
    }
}

fn period(operator: Operator, value: &Value, ctx: &EvalContext) -> Option<DateRange> {
    let tz = ctx.timezone;
    let now = ctx.now;
    let today = now.with_timezone(&tz).date_naive();
    let today_start = local_midnight(tz, today)?;

    let week_start = today - TimeDelta::days(i64::from(today.weekday().num_days_from_monday()));
    let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
    let quarter_month = (today.month() - 1) / 3 * 3 + 1;
    let quarter_start = NaiveDate::from_ymd_opt(today.year(), quarter_month, 1)?;
    let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;

    let range = match operator {
        Operator::Past => DateRange {
            start: None,
            end: Some(now),
        },
        Operator::Future => DateRange {
            start: Some(now + TimeDelta::nanoseconds(1)),
            end: None,
        },
        Operator::Today => DateRange::bounded(today_start, local_midnight(tz, today.succ_opt()?)?),
        Operator::Yesterday => DateRange::bounded(local_midnight(tz, today.pred_opt()?)?, today_start),
        Operator::PreviousXDays => {
            let start = days_before(today, as_count(value)?)?;
            DateRange::bounded(local_midnight(tz, start)?, today_start)
        }
        Operator::PreviousXDaysToDate => {
            let start = days_before(today, as_count(value)?.saturating_sub(1))?;
            DateRange::bounded(local_midnight(tz, start)?, now)
        }
        Operator::PreviousWeek => DateRange::bounded(
            local_midnight(tz, week_start - TimeDelta::weeks(1))?,
            local_midnight(tz, week_start)?,
        ),
        Operator::PreviousWeekToDate => DateRange::bounded(local_midnight(tz, week_start)?, now),
        Operator::PreviousMonth => DateRange::bounded(
            local_midnight(tz, month_start.checked_sub_months(Months::new(1))?)?,
            local_midnight(tz, month_start)?,
        ),
        Operator::PreviousMonthToDate => DateRange::bounded(local_midnight(tz, month_start)?, now),
        Operator::PreviousQuarter => DateRange::bounded(
            local_midnight(tz, quarter_start.checked_sub_months(Months::new(3))?)?,
            local_midnight(tz, quarter_start)?,
        ),
        Operator::PreviousQuarterToDate => {
            DateRange::bounded(local_midnight(tz, quarter_start)?, now)
        }
        Operator::PreviousYear => DateRange::bounded(
            local_midnight(tz, year_start.checked_sub_months(Months::new(12))?)?,
            local_midnight(tz, year_start)?,
        ),
        Operator::PreviousYearToDate => DateRange::bounded(local_midnight(tz, year_start)?, now),
        Operator::BeforeXHoursAgo => DateRange {
            start: None,
            end: Some(hours_before(now, as_count(value)?)?),
        },
        Operator::AfterXHoursAgo => DateRange {
            start: Some(
                hours_before(now, as_count(value)?)?.checked_add_signed(TimeDelta::nanoseconds(1))?,
            ),
            end: None,
        },
        _ => return None,
    };
    Some(range)
}

/// `None` when the count does not fit the calendar.
fn days_before(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_sub_signed(TimeDelta::try_days(days)?)
}

fn hours_before(now: DateTime<Utc>, hours: i64) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(TimeDelta::try_hours(hours)?)
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
}

fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a date or datetime value. Naive values are taken in `tz`.
pub fn parse_date(value: &Value, tz: Tz) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(d) = DateTime::parse_from_rfc3339(text) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|d| d.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| local_midnight(tz, d))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality that tolerates the number/string mix of query strings.
pub(crate) fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(e)) if a == e)
        }
        (Value::Bool(a), Value::String(e)) | (Value::String(e), Value::Bool(a)) => {
            e.parse::<bool>().is_ok_and(|e| e == *a)
        }
        _ => false,
    }
}

/// Ordering between a record value and a condition value.
pub(crate) fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&e);
    }
    if let (Some(a), Some(e)) = (parse_date(actual, Tz::UTC), parse_date(expected, Tz::UTC)) {
        return Some(a.cmp(&e));
    }
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => Some(a.cmp(e)),
        _ => None,
    }
}

fn with_strings(actual: &Value, expected: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(e)) => f(a, e),
        _ => false,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

// =============================================================================
// TESTS
// =============================================================================
