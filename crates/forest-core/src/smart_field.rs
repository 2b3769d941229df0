//! Smart fields: virtual fields computed by host code.
//!
//! A getter fills a virtual attribute on records going out; a setter folds
//! an incoming virtual attribute into the record before it is stored.

use crate::schema::{CollectionSchema, Customizations, FieldSchema};
use crate::{Attributes, Record};

/// Virtual fields to compute for a request.
///
/// `requested` is the `fields[<collection>]` list of the request. Without it
/// every virtual field is computed, otherwise only the requested ones.
#[must_use]
pub fn smart_fields_for_request<'a>(
    collection: &'a CollectionSchema,
    requested: Option<&[String]>,
) -> Vec<&'a FieldSchema> {
    collection
        .virtual_fields()
        .filter(|f| requested.is_none_or(|names| names.iter().any(|n| *n == f.field)))
        .collect()
}

/// Run the getters of the requested virtual fields on `records`.
pub fn apply_getters(
    records: &mut [Record],
    collection: &CollectionSchema,
    customizations: &Customizations,
    requested: Option<&[String]>,
) {
    let getters: Vec<_> = smart_fields_for_request(collection, requested)
        .into_iter()
        .filter_map(|f| customizations.smart_field_named(&collection.name, &f.field))
        .filter_map(|sf| sf.get.as_ref().map(|get| (sf.name.as_str(), get)))
        .collect();
    if getters.is_empty() {
        return;
    }

    for record in records.iter_mut() {
        for (name, get) in &getters {
            let value = get(record);
            record.attributes.insert((*name).to_string(), value);
        }
    }
}

/// Run the setter of every virtual field present in `attributes`.
#[must_use]
pub fn apply_setters(
    mut record: Record,
    collection: &CollectionSchema,
    customizations: &Customizations,
    attributes: &Attributes,
) -> Record {
    for field in collection.virtual_fields() {
        let Some(value) = attributes.get(&field.field) else {
            continue;
        };
        let setter = customizations
            .smart_field_named(&collection.name, &field.field)
            .and_then(|sf| sf.set.as_ref());
        if let Some(set) = setter {
            record = set(record, value);
        }
    }
    // virtual values are never stored as such
    for field in collection.virtual_fields() {
        record.attributes.remove(&field.field);
    }
    record
}
