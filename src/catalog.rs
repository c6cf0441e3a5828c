// SPDX-License-Identifier: Apache-2.0

//! Source catalog
//!
//! Transports registered on a connection, keyed by source id (the schema
//! qualifier used in SQL). Sources that fail unrecoverably are remembered so
//! later queries fail fast until the source is reset.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use waveql_core::capability::Capability;
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::traits::SourceTransport;

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub kind: String,
    pub is_default: bool,
    pub failure: Option<String>,
}

#[derive(Default)]
pub struct SourceCatalog {
    sources: RwLock<HashMap<String, Arc<dyn SourceTransport>>>,
    default_source: RwLock<Option<String>>,
    failed: RwLock<HashMap<String, String>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a source. The first registered source becomes
    /// the default for unqualified table names.
    pub fn register(&self, id: impl Into<String>, transport: Arc<dyn SourceTransport>) {
        let id = id.into();
        {
            let mut default = self.default_source.write();
            if default.is_none() {
                *default = Some(id.clone());
            }
        }
        self.failed.write().remove(&id);
        self.sources.write().insert(id, transport);
    }

    pub fn set_default(&self, id: &str) -> EngineResult<()> {
        if !self.sources.read().contains_key(id) {
            return Err(EngineError::query_error(format!("unknown source '{id}'")));
        }
        *self.default_source.write() = Some(id.to_string());
        Ok(())
    }

    pub fn default_source(&self) -> Option<String> {
        self.default_source.read().clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.read().contains_key(id)
    }

    /// Transport for `id`; fails fast when the source is marked failed.
    pub fn get(&self, id: &str) -> EngineResult<Arc<dyn SourceTransport>> {
        if let Some(reason) = self.failed.read().get(id) {
            return Err(EngineError::transport_fatal(
                id,
                format!("source is marked failed ({reason}); reset it to retry"),
            ));
        }
        self.sources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::query_error(format!("unknown source '{id}'")))
    }

    /// Capabilities of every registered source.
    pub fn capabilities(&self) -> HashMap<String, Capability> {
        self.sources
            .read()
            .iter()
            .map(|(id, t)| (id.clone(), t.capabilities()))
            .collect()
    }

    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(source_id = id, reason = %reason, "source marked failed");
        self.failed.write().insert(id.to_string(), reason);
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.read().contains_key(id)
    }

    /// Clears the failed mark; returns whether one was set.
    pub fn reset(&self, id: &str) -> bool {
        self.failed.write().remove(id).is_some()
    }

    pub fn list(&self) -> Vec<SourceInfo> {
        let default = self.default_source();
        let failed = self.failed.read();
        let mut infos: Vec<SourceInfo> = self
            .sources
            .read()
            .iter()
            .map(|(id, t)| SourceInfo {
                id: id.clone(),
                kind: t.source_kind().to_string(),
                is_default: default.as_deref() == Some(id.as_str()),
                failure: failed.get(id).cloned(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn clear(&self) {
        self.sources.write().clear();
        self.failed.write().clear();
        *self.default_source.write() = None;
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveql_core::capability::{DialectKind, FragmentEncoding};
    use waveql_drivers::MemoryTransport;

    fn memory() -> Arc<dyn SourceTransport> {
        Arc::new(MemoryTransport::new(Capability::full(
            DialectKind::Sql,
            FragmentEncoding::SqlWhere,
        )))
    }

    #[test]
    fn first_source_is_default() {
        let catalog = SourceCatalog::new();
        catalog.register("crm", memory());
        catalog.register("files", memory());
        assert_eq!(catalog.default_source().as_deref(), Some("crm"));
        catalog.set_default("files").unwrap();
        assert_eq!(catalog.default_source().as_deref(), Some("files"));
        assert!(catalog.set_default("nope").is_err());
        assert_eq!(catalog.list().len(), 2);
    }

    #[test]
    fn failed_sources_fail_fast_until_reset() {
        let catalog = SourceCatalog::new();
        catalog.register("crm", memory());
        catalog.mark_failed("crm", "HTTP 401");

        let err = catalog.get("crm").err().unwrap();
        assert!(matches!(err, EngineError::Transport { retryable: false, .. }));
        assert_eq!(catalog.list()[0].failure.as_deref(), Some("HTTP 401"));

        assert!(catalog.reset("crm"));
        assert!(catalog.get("crm").is_ok());
        assert!(!catalog.reset("crm"));
    }

    #[test]
    fn unknown_sources_are_query_errors() {
        let catalog = SourceCatalog::new();
        assert!(matches!(catalog.get("x").err(), Some(EngineError::QueryError { .. })));
    }
}
