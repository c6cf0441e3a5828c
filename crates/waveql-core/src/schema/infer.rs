// SPDX-License-Identifier: Apache-2.0

//! Schema inference from semi-structured records.

use serde_json::Value as Json;

use crate::types::{parse_timestamp, Column, DataType, Schema};

/// Infers a schema from `records`, looking at no more than `sample_size` of them.
///
/// The sample is spread evenly over the whole sequence (indices
/// `i * n / sample_size`) so that fields which only appear late in a result
/// still have a chance to be seen. A `sample_size` of 0 means "all records".
pub fn infer(records: &[Json], sample_size: usize) -> Schema {
    let n = records.len();
    let merged = if sample_size == 0 || n <= sample_size {
        records
            .iter()
            .fold(DataType::Null, |acc, r| merge_types(&acc, &record_type(r)))
    } else {
        (0..sample_size)
            .map(|i| &records[i * n / sample_size])
            .fold(DataType::Null, |acc, r| merge_types(&acc, &record_type(r)))
    };

    match merged {
        DataType::Struct(columns) => Schema::new(columns),
        _ => Schema::default(),
    }
}

/// Type of one record seen as a row. Scalars and arrays become a single
/// `value` column.
fn record_type(record: &Json) -> DataType {
    match record {
        Json::Object(_) => infer_json_type(record),
        other => DataType::Struct(vec![Column::new(
            "value",
            infer_json_type(other),
            other.is_null(),
        )]),
    }
}

/// Type of a single JSON value.
pub fn infer_json_type(value: &Json) -> DataType {
    match value {
        Json::Null => DataType::Null,
        Json::Bool(_) => DataType::Boolean,
        Json::Number(n) => {
            if n.is_i64() {
                DataType::Integer
            } else {
                DataType::Float
            }
        }
        Json::String(s) => {
            if parse_timestamp(s).is_some() {
                DataType::Timestamp
            } else {
                DataType::String
            }
        }
        Json::Array(items) => DataType::List(Box::new(
            items
                .iter()
                .fold(DataType::Null, |acc, item| merge_types(&acc, &infer_json_type(item))),
        )),
        Json::Object(map) => DataType::Struct(
            map.iter()
                .map(|(name, v)| Column::new(name.as_str(), infer_json_type(v), v.is_null()))
                .collect(),
        ),
    }
}

/// Least common type of two observations.
///
/// Null defers to the other side, integer and float widen to float, structs
/// merge field-wise, lists merge their element types, and any other
/// disagreement falls back to string.
pub fn merge_types(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (DataType::Integer, DataType::Float) | (DataType::Float, DataType::Integer) => DataType::Float,
        (DataType::Struct(left), DataType::Struct(right)) => DataType::Struct(merge_fields(left, right)),
        (DataType::List(left), DataType::List(right)) => DataType::List(Box::new(merge_types(left, right))),
        (left, right) if left == right => left.clone(),
        _ => DataType::String,
    }
}

/// `schema` with each column widened just enough to hold `record`.
///
/// Only existing columns change; top-level fields that the schema does not
/// know are ignored. Struct columns still pick up new nested fields through
/// [`merge_types`].
pub fn widen_to_fit(schema: &Schema, record: &Json) -> Schema {
    let DataType::Struct(observed) = record_type(record) else {
        return schema.clone();
    };
    Schema::new(
        schema
            .columns
            .iter()
            .map(|column| match observed.iter().find(|o| o.name == column.name) {
                Some(o) => Column::new(
                    column.name.clone(),
                    merge_types(&column.data_type, &o.data_type),
                    column.nullable || o.nullable,
                ),
                None => column.clone(),
            })
            .collect(),
    )
}

/// Union of two field lists. A field missing on either side is nullable.
fn merge_fields(left: &[Column], right: &[Column]) -> Vec<Column> {
    let mut merged: Vec<Column> = left
        .iter()
        .map(|l| match right.iter().find(|r| r.name == l.name) {
            Some(r) => Column::new(
                l.name.clone(),
                merge_types(&l.data_type, &r.data_type),
                l.nullable || r.nullable,
            ),
            None => Column::new(l.name.clone(), l.data_type.clone(), true),
        })
        .collect();

    for r in right {
        if !left.iter().any(|l| l.name == r.name) {
            merged.push(Column::new(r.name.clone(), r.data_type.clone(), true));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn int_and_float_widen_and_null_defers() {
        let records = vec![json!({"a": 1, "b": "x"}), json!({"a": 2.5, "b": null})];
        let schema = infer(&records, 2);
        assert_eq!(schema.column("a").unwrap().data_type, DataType::Float);
        let b = schema.column("b").unwrap();
        assert_eq!(b.data_type, DataType::String);
        assert!(b.nullable);
        assert!(!schema.column("a").unwrap().nullable);
    }

    #[test]
    fn sample_is_spread_across_records() {
        // Only the last record carries `late`; an even spread over 10 records
        // with a sample of 5 looks at indices 0, 2, 4, 6, 8.
        let mut records: Vec<Json> = (0..10).map(|i| json!({"id": i})).collect();
        records[8] = json!({"id": 8, "late": true});
        let schema = infer(&records, 5);
        assert_eq!(schema.column("late").unwrap().data_type, DataType::Boolean);
        assert!(schema.column("late").unwrap().nullable);
    }

    #[test]
    fn nested_structs_and_lists() {
        let records = vec![
            json!({"user": {"name": "a", "profile": {"score": 1}}, "tags": ["x"]}),
            json!({"user": {"name": "b", "profile": {"score": 1.5, "rank": 3}}, "tags": []}),
        ];
        let schema = infer(&records, 100);
        let path = |p: &str| p.split('.').map(String::from).collect::<Vec<_>>();
        assert_eq!(schema.resolve_path(&path("user.profile.score")), Some(&DataType::Float));
        assert_eq!(schema.resolve_path(&path("user.profile.rank")), Some(&DataType::Integer));
        assert_eq!(
            schema.column("tags").unwrap().data_type,
            DataType::List(Box::new(DataType::String))
        );
    }

    #[test]
    fn timestamps_and_conflicts() {
        let records = vec![
            json!({"opened_at": "2024-01-05 10:00:00", "flag": true}),
            json!({"opened_at": "2024-01-06T11:30:00Z", "flag": 1}),
        ];
        let schema = infer(&records, 0);
        assert_eq!(schema.column("opened_at").unwrap().data_type, DataType::Timestamp);
        assert_eq!(schema.column("flag").unwrap().data_type, DataType::String);
    }

    #[test]
    fn widening_to_fit_one_record() {
        let schema = Schema::new(vec![
            Column::new("id", DataType::Integer, false),
            Column::new("score", DataType::Integer, false),
            Column::new("opened_at", DataType::Timestamp, true),
        ]);
        let widened = widen_to_fit(&schema, &json!({"id": 7, "score": 2.5, "opened_at": "soon", "extra": 1}));
        assert_eq!(widened.column_names(), vec!["id", "score", "opened_at"]);
        assert_eq!(widened.columns[0].data_type, DataType::Integer);
        assert_eq!(widened.columns[1].data_type, DataType::Float);
        assert_eq!(widened.columns[2].data_type, DataType::String);

        let row = json!({"id": 8, "score": null});
        assert!(widen_to_fit(&schema, &row).structurally_eq(&schema));
    }

    #[test]
    fn scalar_records_are_wrapped() {
        let schema = infer(&[json!(1), json!(2)], 10);
        assert_eq!(schema.column_names(), vec!["value"]);
        assert_eq!(schema.columns[0].data_type, DataType::Integer);
    }

    #[test]
    fn empty_input_gives_empty_schema() {
        assert!(infer(&[], 10).is_empty());
    }

    pub(crate) fn arb_type() -> impl Strategy<Value = DataType> {
        let leaf = prop_oneof![
            Just(DataType::Null),
            Just(DataType::Boolean),
            Just(DataType::Integer),
            Just(DataType::Float),
            Just(DataType::String),
            Just(DataType::Timestamp),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                inner.clone().prop_map(|t| DataType::List(Box::new(t))),
                prop::collection::btree_map("[a-d]", (inner, any::<bool>()), 0..4).prop_map(
                    |fields| DataType::Struct(
                        fields
                            .into_iter()
                            .map(|(name, (t, nullable))| Column::new(name, t, nullable))
                            .collect()
                    )
                ),
            ]
        })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_type(), b in arb_type()) {
            prop_assert_eq!(merge_types(&a, &b), merge_types(&b, &a));
        }

        #[test]
        fn null_is_identity(t in arb_type()) {
            prop_assert_eq!(merge_types(&DataType::Null, &t), t.clone());
            prop_assert_eq!(merge_types(&t, &DataType::Null), t);
        }

        #[test]
        fn merge_is_idempotent(t in arb_type()) {
            prop_assert_eq!(merge_types(&t, &t), t);
        }

        #[test]
        fn numeric_widening_is_float(x in any::<i64>(), y in any::<f64>().prop_filter("finite", |f| f.is_finite() && f.fract() != 0.0)) {
            let records = vec![json!({"n": x}), json!({"n": y})];
            prop_assert_eq!(&infer(&records, 0).columns[0].data_type, &DataType::Float);
        }
    }
}
