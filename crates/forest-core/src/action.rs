//! Helpers shared by smart actions, their hooks and bulk deletes.

use crate::filter::Filter;
use crate::query::{ListQuery, QueryError};
use crate::{Record, RecordId};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Last path segment of an action endpoint.
#[must_use]
pub fn action_name_from_endpoint(endpoint: &str) -> &str {
    endpoint
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(endpoint)
}

/// Null out form values that are not one of the field's enums.
///
/// A list-typed field keeps its value as long as one item is a valid enum.
pub fn format_enums(fields: &mut [Value]) {
    for field in fields.iter_mut().filter_map(Value::as_object_mut) {
        let Some(enums) = field.get("enums").and_then(Value::as_array).cloned() else {
            continue;
        };
        let is_list = field.get("type").is_some_and(Value::is_array);
        let value = field.get("value").cloned().unwrap_or(Value::Null);

        let invalid = if is_list {
            match &value {
                Value::Array(items) => !items.iter().any(|item| enums.contains(item)),
                _ => false,
            }
        } else {
            !enums.contains(&value)
        };
        if invalid {
            field.insert("value".into(), Value::Null);
        }
    }
}

/// Records targeted by an action or a bulk delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSelection {
    pub ids: Vec<RecordId>,
    pub all_records: bool,
    pub subset_query: Option<Map<String, Value>>,
    pub excluded: Vec<RecordId>,
}

fn id_list(value: Option<&Value>) -> Vec<RecordId> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(RecordId::from_json).collect())
        .unwrap_or_default()
}

impl BulkSelection {
    /// Read `ids`, `all_records`, `all_records_subset_query` and
    /// `all_records_ids_excluded` from `data.attributes`.
    #[must_use]
    pub fn from_attributes(attributes: &Map<String, Value>) -> Self {
        Self {
            ids: id_list(attributes.get("ids")),
            all_records: attributes
                .get("all_records")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            subset_query: attributes
                .get("all_records_subset_query")
                .and_then(Value::as_object)
                .cloned(),
            excluded: id_list(attributes.get("all_records_ids_excluded")),
        }
    }

    /// Matching records of `collection`, restricted to `scope`.
    ///
    /// The scope is evaluated in the subset query's `timezone`, explicit ids
    /// included.
    pub fn resolve(
        &self,
        records: Vec<Record>,
        collection: &str,
        scope: Option<&Filter>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, QueryError> {
        let query = match &self.subset_query {
            Some(subset) => ListQuery::from_subset_query(subset, collection)?,
            None => ListQuery::default(),
        };
        let ctx = query.context(now);

        if self.all_records {
            let excluded: BTreeSet<_> = self.excluded.iter().collect();
            return Ok(query
                .select(records, scope, &ctx)
                .into_iter()
                .filter(|r| !excluded.contains(&r.id))
                .collect());
        }

        let wanted: BTreeSet<_> = self.ids.iter().collect();
        Ok(records
            .into_iter()
            .filter(|r| wanted.contains(&r.id))
            .filter(|r| scope.is_none_or(|s| s.matches(r, &ctx)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::Attributes;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn endpoint_name() {
        assert_eq!(action_name_from_endpoint("/forest/actions/send-invoice"), "send-invoice");
        assert_eq!(action_name_from_endpoint("/forest/actions/send-invoice/"), "send-invoice");
        assert_eq!(action_name_from_endpoint("mark-as-live"), "mark-as-live");
    }

    #[test]
    fn enums_are_enforced() {
        let mut fields = vec![
            json!({"field": "country", "type": "Enum", "enums": ["FR", "US"], "value": "UK"}),
            json!({"field": "city", "type": "Enum", "enums": ["Paris"], "value": "Paris"}),
            json!({"field": "tags", "type": ["Enum"], "enums": ["a", "b"], "value": ["c", "d"]}),
            json!({"field": "labels", "type": ["Enum"], "enums": ["a", "b"], "value": ["c", "a"]}),
            json!({"field": "free", "type": "String", "value": "anything"}),
        ];
        format_enums(&mut fields);
        let values: Vec<_> = fields.iter().map(|f| f["value"].clone()).collect();
        assert_eq!(
            values,
            vec![json!(null), json!("Paris"), json!(null), json!(["c", "a"]), json!("anything")]
        );
    }

    fn questions() -> Vec<Record> {
        ["what is your favorite color?", "do you like chocolate?", "who is your favorite singer?"]
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut attributes = Attributes::new();
                attributes.insert("question_text".into(), json!(text));
                Record::new(RecordId(i as u64 + 1), attributes)
            })
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 7, 8, 9, 20, 23).unwrap()
    }

    #[test]
    fn explicit_ids_respect_scope() {
        let selection =
            BulkSelection::from_attributes(json!({"ids": ["1", 2]}).as_object().unwrap());
        assert_eq!(selection.ids, vec![RecordId(1), RecordId(2)]);

        let scope = Filter::parse(r#"{"field":"question_text","operator":"contains","value":"color"}"#)
            .unwrap();
        let ids: Vec<_> = selection
            .resolve(questions(), "Question", Some(&scope), now())
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![RecordId(1)]);
    }

    #[test]
    fn all_records_use_subset_query_and_exclusions() {
        let selection = BulkSelection::from_attributes(
            json!({
                "ids": ["1"],
                "all_records": true,
                "all_records_subset_query": {
                    "page[number]": 1, "page[size]": 15, "sort": "-id",
                    "filters": "{\"field\":\"question_text\",\"operator\":\"contains\",\"value\":\"favorite\"}"
                },
                "all_records_ids_excluded": ["3"]
            })
            .as_object()
            .unwrap(),
        );
        let ids: Vec<_> = selection
            .resolve(questions(), "Question", None, now())
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![RecordId(1)]);
    }

    #[test]
    fn explicit_ids_follow_subset_query_timezone() {
        // 2021-07-07T22:30Z is already July 8th in Paris, not in UTC
        let mut records = questions();
        records[0]
            .attributes
            .insert("pub_date".into(), json!("2021-07-07T22:30:00Z"));
        let scope = Filter::parse(r#"{"field":"pub_date","operator":"today","value":null}"#).unwrap();
        let resolve = |attributes: Value| {
            BulkSelection::from_attributes(attributes.as_object().unwrap())
                .resolve(records.clone(), "Question", Some(&scope), now())
                .unwrap()
                .len()
        };

        assert_eq!(resolve(json!({"ids": ["1"]})), 0);
        assert_eq!(
            resolve(json!({
                "ids": ["1"],
                "all_records_subset_query": {"timezone": "Europe/Paris"}
            })),
            1
        );
    }
}
