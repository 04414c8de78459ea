//! Property-based tests for filter-evaluator invariants.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use strand_pipeline::filter::EventFilter;

/// Generates a primitive JSON value (string, number, or boolean).
fn arb_primitive() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-zA-Z0-9_-]{0,12}".prop_map(Value::from),
        any::<i32>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(Value::from),
    ]
}

/// Generates a flat document of 1..6 primitive fields.
fn arb_flat_document() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,8}", arb_primitive(), 1..6)
        .prop_map(|fields| fields.into_iter().collect())
}

proptest! {
    /// `eval([v], {k: v})` is true for any primitive `v`.
    #[test]
    fn primitive_self_equality(key in "[a-z]{1,8}", value in arb_primitive()) {
        let filter = EventFilter::from_value(&json!({ &key: [value.clone()] })).unwrap();
        let document = json!({ &key: value });
        prop_assert!(filter.matches(&document));
    }

    /// `eval([v], {k: v'})` is false whenever `v' != v`.
    #[test]
    fn primitive_inequality(
        key in "[a-z]{1,8}",
        expected in arb_primitive(),
        actual in arb_primitive(),
    ) {
        prop_assume!(expected != actual);
        // Integer/float encodings of the same number still compare equal.
        prop_assume!(expected.as_f64().is_none() || expected.as_f64() != actual.as_f64());

        let filter = EventFilter::from_value(&json!({ &key: [expected] })).unwrap();
        let document = json!({ &key: actual });
        prop_assert!(!filter.matches(&document));
    }

    /// A filter built from every field of a document matches that document,
    /// independent of field insertion order.
    #[test]
    fn document_matches_its_own_field_filter(fields in arb_flat_document()) {
        let filter_doc: Map<String, Value> = fields
            .iter()
            .map(|(key, value)| (key.clone(), json!([value])))
            .collect();
        let filter = EventFilter::from_value(&Value::Object(filter_doc)).unwrap();

        let document = Value::Object(fields.clone());
        prop_assert!(filter.matches(&document));

        // Reversed insertion order yields the same document semantics.
        let reversed: Map<String, Value> = fields.into_iter().rev().collect();
        prop_assert!(filter.matches(&Value::Object(reversed)));
    }

    /// Evaluation is total: arbitrary documents never panic the evaluator.
    #[test]
    fn evaluation_is_total(
        fields in arb_flat_document(),
        bound in any::<i32>(),
    ) {
        let filter = EventFilter::from_value(&json!({
            "n": [{"$gt": bound}],
            "s": [{"$startsWith": "x"}],
            "missing": [{"$exists": false}],
        }))
        .unwrap();
        // Result is unspecified here; only totality matters.
        let _ = filter.matches(&Value::Object(fields));
    }

    /// Numeric range matchers respect inclusive bounds.
    #[test]
    fn between_is_inclusive(lo in -1000i64..1000, width in 0i64..1000, n in -2000i64..2000) {
        let hi = lo + width;
        let filter = EventFilter::from_value(&json!({"n": [{"$between": [lo, hi]}]})).unwrap();
        let matched = filter.matches(&json!({"n": n}));
        prop_assert_eq!(matched, n >= lo && n <= hi);
    }
}
