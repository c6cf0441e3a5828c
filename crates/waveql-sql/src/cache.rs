// SPDX-License-Identifier: Apache-2.0

//! LRU cache of compiled statements and `?` templates keyed by SQL text.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use waveql_core::error::EngineResult;

use crate::ast::CompiledQuery;
use crate::compiler::compile;
use crate::params::ParameterizedQuery;

pub struct StatementCache {
    entries: Mutex<LruCache<String, Arc<CompiledQuery>>>,
    templates: Mutex<LruCache<String, Arc<ParameterizedQuery>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatementCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            templates: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached compilation of `sql`, compiling it on a miss.
    /// Failed compilations are not cached.
    pub fn get_or_compile(&self, sql: &str) -> EngineResult<Arc<CompiledQuery>> {
        let key = sql.trim();
        if let Some(hit) = self.entries.lock().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(compile(key)?);
        self.entries.lock().put(key.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Returns the cached `?` template of `sql`, tokenizing it on a miss.
    /// Parameters are bound per call; the template itself never holds values.
    pub fn get_or_parameterize(&self, sql: &str) -> EngineResult<Arc<ParameterizedQuery>> {
        let key = sql.trim();
        if let Some(hit) = self.templates.lock().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let template = Arc::new(ParameterizedQuery::parse(key)?);
        self.templates.lock().put(key.to_string(), template.clone());
        Ok(template)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len() + self.templates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.templates.lock().clear();
    }

    /// `(hits, misses)`
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
