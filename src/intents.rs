//! Intent resolution.
//!
//! Intents are abstract capability tags: a service declares which intents it
//! *requires* before it may cross a process boundary, and the exporting side
//! declares which intents it can *provide* (the service's own guarantees plus
//! whatever the chosen transport guarantees). Export is allowed only when
//! every required intent is provided.
//!
//! All functions here are pure; the export gate itself lives in the broadcast
//! handler.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::Error;
use crate::model::{PROP_EXPORTED_INTENTS, PROP_EXPORTED_INTENTS_EXTRA, PROP_INTENTS};

/// Reads a property that may be a single string or an array of strings.
///
/// A missing key yields the empty set. Any other value shape is a
/// [`Error::TypeMismatch`]; nothing is silently coerced.
fn string_set(properties: &BTreeMap<String, Value>, key: &str) -> Result<BTreeSet<String>, Error> {
    match properties.get(key) {
        None => Ok(BTreeSet::new()),
        Some(Value::String(single)) => Ok(BTreeSet::from([single.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(Error::TypeMismatch {
                    key: key.to_string(),
                    found: json_type_name(other),
                }),
            })
            .collect(),
        Some(other) => Err(Error::TypeMismatch {
            key: key.to_string(),
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Intents the service requires in order to be exported.
///
/// Union of `service.exported.intents` and `service.exported.intents.extra`.
pub fn required_intents(
    properties: &BTreeMap<String, Value>,
) -> Result<BTreeSet<String>, Error> {
    let mut required = string_set(properties, PROP_EXPORTED_INTENTS)?;
    required.extend(string_set(properties, PROP_EXPORTED_INTENTS_EXTRA)?);
    Ok(required)
}

/// Intents guaranteed for the service: its own `service.intents` declaration
/// plus the intents the chosen transport guarantees.
pub fn provided_intents(
    properties: &BTreeMap<String, Value>,
    transport_intents: &BTreeSet<String>,
) -> Result<BTreeSet<String>, Error> {
    let mut provided = string_set(properties, PROP_INTENTS)?;
    provided.extend(transport_intents.iter().cloned());
    Ok(provided)
}

/// True iff every required intent is provided.
pub fn intents_resolved(provided: &BTreeSet<String>, required: &BTreeSet<String>) -> bool {
    required.is_subset(provided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn props(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn required_accepts_string_and_array() {
        let properties = props(&[
            (PROP_EXPORTED_INTENTS, json!("confidentiality")),
            (PROP_EXPORTED_INTENTS_EXTRA, json!(["ordering", "integrity"])),
        ]);
        let required = required_intents(&properties).unwrap();
        assert_eq!(
            required,
            BTreeSet::from([
                "confidentiality".to_string(),
                "integrity".to_string(),
                "ordering".to_string(),
            ])
        );
    }

    #[test]
    fn required_rejects_other_shapes() {
        let properties = props(&[(PROP_EXPORTED_INTENTS, json!(42))]);
        assert_eq!(
            required_intents(&properties),
            Err(Error::TypeMismatch {
                key: PROP_EXPORTED_INTENTS.to_string(),
                found: "number",
            })
        );

        let properties = props(&[(PROP_EXPORTED_INTENTS_EXTRA, json!([true]))]);
        assert!(matches!(
            required_intents(&properties),
            Err(Error::TypeMismatch { found: "boolean", .. })
        ));
    }

    #[test]
    fn provided_unions_service_and_transport_intents() {
        let properties = props(&[(PROP_INTENTS, json!(["integrity"]))]);
        let transport = BTreeSet::from(["confidentiality".to_string()]);
        let provided = provided_intents(&properties, &transport).unwrap();
        assert_eq!(
            provided,
            BTreeSet::from(["confidentiality".to_string(), "integrity".to_string()])
        );
    }

    #[test]
    fn empty_required_is_always_resolved() {
        assert!(intents_resolved(&BTreeSet::new(), &BTreeSet::new()));
        assert!(intents_resolved(
            &BTreeSet::from(["anything".to_string()]),
            &BTreeSet::new()
        ));
    }

    proptest! {
        #[test]
        fn resolved_iff_subset(
            provided in proptest::collection::btree_set("[a-c]{1,2}", 0..6),
            required in proptest::collection::btree_set("[a-c]{1,2}", 0..6),
        ) {
            let resolved = intents_resolved(&provided, &required);
            prop_assert_eq!(resolved, required.iter().all(|tag| provided.contains(tag)));
        }
    }
}
