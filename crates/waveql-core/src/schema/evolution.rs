// SPDX-License-Identifier: Apache-2.0

//! Structural schema diffs and evolution strategies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::merge_types;
use crate::types::{Column, DataType, Schema};

/// A single structural difference between two schemas.
/// Paths are dotted for nested struct fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaChange {
    Added { path: String, data_type: DataType },
    Removed { path: String },
    TypeChanged { path: String, old: DataType, new: DataType },
}

impl SchemaChange {
    pub fn path(&self) -> &str {
        match self {
            SchemaChange::Added { path, .. }
            | SchemaChange::Removed { path }
            | SchemaChange::TypeChanged { path, .. } => path,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::Added { path, data_type } => write!(f, "+{path}: {data_type}"),
            SchemaChange::Removed { path } => write!(f, "-{path}"),
            SchemaChange::TypeChanged { path, old, new } => write!(f, "~{path}: {old} -> {new}"),
        }
    }
}

/// How the registry reacts when a source starts returning a different shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    /// Union of old and new fields, types widened.
    #[default]
    ForwardCompatible,
    /// Any difference is an error carrying the diff.
    Strict,
    /// The newly observed schema replaces the cached one.
    Replace,
}

/// Structural diff from `old` to `new`, recursing into struct columns.
pub fn diff(old: &Schema, new: &Schema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    diff_fields("", &old.columns, &new.columns, &mut changes);
    changes
}

fn diff_fields(prefix: &str, old: &[Column], new: &[Column], out: &mut Vec<SchemaChange>) {
    let path_of = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    for o in old {
        match new.iter().find(|n| n.name == o.name) {
            None => out.push(SchemaChange::Removed { path: path_of(o.name.as_str()) }),
            Some(n) => match (&o.data_type, &n.data_type) {
                (DataType::Struct(of), DataType::Struct(nf)) => diff_fields(&path_of(o.name.as_str()), of, nf, out),
                (ot, nt) if ot != nt => out.push(SchemaChange::TypeChanged {
                    path: path_of(o.name.as_str()),
                    old: ot.clone(),
                    new: nt.clone(),
                }),
                _ => {}
            },
        }
    }

    for n in new {
        if !old.iter().any(|o| o.name == n.name) {
            out.push(SchemaChange::Added {
                path: path_of(n.name.as_str()),
                data_type: n.data_type.clone(),
            });
        }
    }
}

/// Applies a change list produced by [`diff`]. Changes whose parent path no
/// longer exists are skipped.
pub fn apply_changes(schema: &Schema, changes: &[SchemaChange]) -> Schema {
    let mut columns = schema.columns.clone();
    for change in changes {
        let parts: Vec<&str> = change.path().split('.').collect();
        let Some((leaf, parent)) = parts.split_last() else {
            continue;
        };
        let Some(fields) = fields_at(&mut columns, parent) else {
            continue;
        };
        match change {
            SchemaChange::Added { data_type, .. } => {
                if !fields.iter().any(|c| c.name == *leaf) {
                    fields.push(Column::new(*leaf, data_type.clone(), true));
                }
            }
            SchemaChange::Removed { .. } => fields.retain(|c| c.name != *leaf),
            SchemaChange::TypeChanged { new, .. } => {
                if let Some(column) = fields.iter_mut().find(|c| c.name == *leaf) {
                    column.data_type = new.clone();
                }
            }
        }
    }
    Schema::new(columns)
}

fn fields_at<'a>(columns: &'a mut Vec<Column>, parent: &[&str]) -> Option<&'a mut Vec<Column>> {
    match parent.split_first() {
        None => Some(columns),
        Some((head, rest)) => {
            let column = columns.iter_mut().find(|c| c.name == *head)?;
            match &mut column.data_type {
                DataType::Struct(fields) => fields_at(fields, rest),
                _ => None,
            }
        }
    }
}

/// Forward-compatible merge: every field of either schema, types widened.
/// Existing column order is kept and new columns are appended.
pub fn merge_schemas(current: &Schema, observed: &Schema) -> Schema {
    match merge_types(&current.as_struct(), &observed.as_struct()) {
        DataType::Struct(columns) => Schema::new(columns),
        _ => current.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn schema(columns: Vec<(&str, DataType)>) -> Schema {
        Schema::new(
            columns
                .into_iter()
                .map(|(n, t)| Column::new(n, t, true))
                .collect(),
        )
    }

    #[test]
    fn diff_recurses_into_structs() {
        let old = schema(vec![
            ("id", DataType::Integer),
            ("user", DataType::Struct(vec![Column::new("name", DataType::String, true)])),
            ("legacy", DataType::String),
        ]);
        let new = schema(vec![
            ("id", DataType::String),
            (
                "user",
                DataType::Struct(vec![
                    Column::new("name", DataType::String, true),
                    Column::new("email", DataType::String, true),
                ]),
            ),
        ]);

        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                SchemaChange::TypeChanged {
                    path: "id".into(),
                    old: DataType::Integer,
                    new: DataType::String
                },
                SchemaChange::Added {
                    path: "user.email".into(),
                    data_type: DataType::String
                },
                SchemaChange::Removed { path: "legacy".into() },
            ]
        );
        assert!(apply_changes(&old, &changes).structurally_eq(&new));
    }

    #[test]
    fn identical_schemas_have_empty_diff() {
        let s = schema(vec![("a", DataType::Integer), ("b", DataType::Timestamp)]);
        assert!(diff(&s, &s).is_empty());
    }

    #[test]
    fn forward_merge_keeps_old_columns() {
        let current = schema(vec![("a", DataType::Integer), ("b", DataType::String)]);
        let observed = schema(vec![("a", DataType::Float), ("c", DataType::Boolean)]);
        let merged = merge_schemas(&current, &observed);
        assert_eq!(merged.column_names(), vec!["a", "b", "c"]);
        assert_eq!(merged.column("a").unwrap().data_type, DataType::Float);
    }

    #[test]
    fn change_display() {
        let change = SchemaChange::TypeChanged {
            path: "p".into(),
            old: DataType::Integer,
            new: DataType::Float,
        };
        assert_eq!(change.to_string(), "~p: integer -> float");
    }

    fn arb_schema() -> impl Strategy<Value = Schema> {
        let leaf = prop_oneof![
            Just(DataType::Boolean),
            Just(DataType::Integer),
            Just(DataType::Float),
            Just(DataType::String),
        ];
        let field_type = leaf.prop_recursive(2, 12, 3, |inner| {
            prop::collection::btree_map("[a-c]", inner, 0..3).prop_map(|fields| {
                DataType::Struct(
                    fields
                        .into_iter()
                        .map(|(n, t)| Column::new(n, t, true))
                        .collect(),
                )
            })
        });
        prop::collection::btree_map("[a-e]", field_type, 0..5).prop_map(|cols| {
            Schema::new(
                cols.into_iter()
                    .map(|(n, t)| Column::new(n, t, true))
                    .collect(),
            )
        })
    }

    proptest! {
        #[test]
        fn apply_of_diff_reaches_target(old in arb_schema(), new in arb_schema()) {
            let changes = diff(&old, &new);
            prop_assert!(apply_changes(&old, &changes).structurally_eq(&new));
        }
    }
}
