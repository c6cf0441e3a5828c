// SPDX-License-Identifier: Apache-2.0

//! Schema cache keyed by `(source, table)`.
//!
//! Entries are published by replacement: readers clone the `Arc<Schema>` and
//! keep using it even if a newer version is published while they run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::schema::{diff, infer, merge_schemas, EvolutionStrategy, SchemaChange};
use crate::types::{Column, DataType, Schema, TableKey};

#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub schema: Arc<Schema>,
    /// Starts at 1 and increases on every publish for the key.
    pub version: u64,
    pub inferred_at: Instant,
}

pub struct SchemaRegistry {
    entries: RwLock<HashMap<TableKey, SchemaEntry>>,
    strategy: EvolutionStrategy,
    sample_size: usize,
    ttl: Option<Duration>,
}

impl SchemaRegistry {
    pub fn new(strategy: EvolutionStrategy, sample_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            strategy,
            sample_size,
            ttl: None,
        }
    }

    /// Entries older than `ttl` are treated as absent and re-inferred.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn strategy(&self) -> EvolutionStrategy {
        self.strategy
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn entry(&self, key: &TableKey) -> Option<SchemaEntry> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if let Some(ttl) = self.ttl {
            if entry.inferred_at.elapsed() > ttl {
                return None;
            }
        }
        Some(entry.clone())
    }

    pub fn get(&self, key: &TableKey) -> Option<Arc<Schema>> {
        self.entry(key).map(|e| e.schema)
    }

    /// Publishes `schema` as the current version for `key`.
    pub fn publish(&self, key: TableKey, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        let mut entries = self.entries.write();
        let version = entries.get(&key).map(|e| e.version + 1).unwrap_or(1);
        debug!(table = %key, version, schema = %schema, "Publishing schema");
        entries.insert(
            key,
            SchemaEntry {
                schema: schema.clone(),
                version,
                inferred_at: Instant::now(),
            },
        );
        schema
    }

    /// Infers from a sample of `records` and publishes the result.
    pub fn infer_and_publish(&self, key: TableKey, records: &[serde_json::Value]) -> Arc<Schema> {
        let schema = infer(records, self.sample_size);
        self.publish(key, schema)
    }

    /// Reconciles a schema observed on freshly fetched data with the cached one.
    ///
    /// Columns observed only as null carry no type information and are
    /// ignored, as are columns absent from the observation (a page not
    /// mentioning a field says nothing about its removal). Returns the changes
    /// that were detected; under `Strict` a non-empty change set is an error.
    pub fn observe(&self, key: &TableKey, observed: &Schema) -> EngineResult<Vec<SchemaChange>> {
        let observed = strip_null_columns(observed);
        let Some(current) = self.get(key) else {
            self.publish(key.clone(), observed);
            return Ok(Vec::new());
        };

        let merged = merge_schemas(&current, &observed);
        let changes = diff(&current, &merged);
        if changes.is_empty() {
            return Ok(changes);
        }

        match self.strategy {
            EvolutionStrategy::Strict => {
                return Err(EngineError::schema_evolution(
                    key.source_id.clone(),
                    key.table.clone(),
                    changes,
                ));
            }
            EvolutionStrategy::ForwardCompatible => {
                self.publish(key.clone(), merged);
            }
            EvolutionStrategy::Replace => {
                self.publish(key.clone(), observed);
            }
        }
        info!(table = %key, changes = changes.len(), strategy = ?self.strategy, "Schema evolved");
        Ok(changes)
    }

    pub fn invalidate(&self, key: &TableKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drops every cached schema of one source.
    pub fn invalidate_source(&self, source_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.source_id != source_id);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(EvolutionStrategy::default(), 100)
    }
}

fn strip_null_columns(schema: &Schema) -> Schema {
    Schema::new(strip_null_fields(&schema.columns))
}

fn strip_null_fields(columns: &[Column]) -> Vec<Column> {
    columns
        .iter()
        .filter(|c| c.data_type != DataType::Null)
        .map(|c| match &c.data_type {
            DataType::Struct(fields) => Column::new(
                c.name.clone(),
                DataType::Struct(strip_null_fields(fields)),
                c.nullable,
            ),
            _ => c.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> TableKey {
        TableKey::new("sn", "incident")
    }

    fn observed(records: &[serde_json::Value]) -> Schema {
        infer(records, 0)
    }

    #[test]
    fn publish_bumps_version_and_keeps_old_arcs_alive() {
        let registry = SchemaRegistry::default();
        let first = registry.infer_and_publish(key(), &[json!({"a": 1})]);
        let second = registry.infer_and_publish(key(), &[json!({"a": 1, "b": "x"})]);
        assert_eq!(registry.entry(&key()).unwrap().version, 2);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn forward_compatible_widens_and_unions() {
        let registry = SchemaRegistry::default();
        registry.infer_and_publish(key(), &[json!({"a": 1})]);
        let changes = registry
            .observe(&key(), &observed(&[json!({"a": 1.5, "b": true})]))
            .unwrap();
        assert_eq!(changes.len(), 2);
        let schema = registry.get(&key()).unwrap();
        assert_eq!(schema.column("a").unwrap().data_type, DataType::Float);
        assert_eq!(schema.column("b").unwrap().data_type, DataType::Boolean);
    }

    #[test]
    fn null_only_and_missing_columns_are_not_changes() {
        let registry = SchemaRegistry::new(EvolutionStrategy::Strict, 10);
        registry.infer_and_publish(key(), &[json!({"a": 1, "b": "x"})]);
        let changes = registry
            .observe(&key(), &observed(&[json!({"a": 2, "c": null})]))
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn strict_rejects_with_diff() {
        let registry = SchemaRegistry::new(EvolutionStrategy::Strict, 10);
        registry.infer_and_publish(key(), &[json!({"a": 1})]);
        let err = registry
            .observe(&key(), &observed(&[json!({"a": "text"})]))
            .unwrap_err();
        match err {
            EngineError::SchemaEvolution { table, changes, .. } => {
                assert_eq!(table, "incident");
                assert_eq!(changes[0].path(), "a");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Strict leaves the cached schema untouched.
        assert_eq!(registry.entry(&key()).unwrap().version, 1);
    }

    #[test]
    fn replace_publishes_observation() {
        let registry = SchemaRegistry::new(EvolutionStrategy::Replace, 10);
        registry.infer_and_publish(key(), &[json!({"a": 1, "b": 2})]);
        registry
            .observe(&key(), &observed(&[json!({"a": "x"})]))
            .unwrap();
        assert_eq!(registry.get(&key()).unwrap().column_names(), vec!["a"]);
    }

    #[test]
    fn ttl_expires_entries() {
        let registry = SchemaRegistry::default().with_ttl(Some(Duration::ZERO));
        registry.infer_and_publish(key(), &[json!({"a": 1})]);
        std::thread::sleep(Duration::from_millis(2));
        assert!(registry.get(&key()).is_none());
    }

    #[test]
    fn invalidation() {
        let registry = SchemaRegistry::default();
        registry.infer_and_publish(key(), &[json!({"a": 1})]);
        registry.infer_and_publish(TableKey::new("sn", "problem"), &[json!({"a": 1})]);
        registry.infer_and_publish(TableKey::new("jira", "issue"), &[json!({"a": 1})]);
        assert!(registry.invalidate(&key()));
        assert!(!registry.invalidate(&key()));
        assert_eq!(registry.invalidate_source("sn"), 1);
        assert_eq!(registry.len(), 1);
    }
}
