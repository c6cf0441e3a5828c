// SPDX-License-Identifier: Apache-2.0

//! Connection-level configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use waveql_core::EvolutionStrategy;

/// Tunables of a [`crate::Connection`]. Every field has a default, so a
/// partial JSON/TOML document deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Page fetches allowed in flight across the whole process.
    pub max_in_flight_fetches: usize,
    /// Deadline of a whole query, planning excluded.
    pub query_timeout_ms: u64,
    /// Deadline of a single page fetch.
    pub fetch_timeout_ms: u64,
    /// Records sampled when inferring a schema.
    pub schema_sample_size: usize,
    /// Records requested by the fetch that seeds an unknown schema.
    pub schema_seed_rows: usize,
    /// Cached schemas older than this are sampled again. Never, when `None`.
    pub schema_ttl_secs: Option<u64>,
    pub evolution: EvolutionStrategy,
    /// Safety cap on rows fetched per step; hitting it adds a warning.
    pub row_limit_per_source: Option<u64>,
    /// Capacity of the channels between fetch tasks, the local stage and
    /// the result set.
    pub stream_buffer: usize,
    pub statement_cache_size: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_in_flight_fetches: 8,
            query_timeout_ms: 60_000,
            fetch_timeout_ms: 30_000,
            schema_sample_size: 100,
            schema_seed_rows: 500,
            schema_ttl_secs: None,
            evolution: EvolutionStrategy::ForwardCompatible,
            row_limit_per_source: None,
            stream_buffer: 1024,
            statement_cache_size: 128,
        }
    }
}

impl FederationConfig {
    /// Defaults overridden by `WAVEQL_*` environment variables, e.g.
    /// `WAVEQL_QUERY_TIMEOUT_MS=120000` or `WAVEQL_EVOLUTION=strict`.
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        override_with(&read, "WAVEQL_MAX_IN_FLIGHT_FETCHES", &mut config.max_in_flight_fetches);
        override_with(&read, "WAVEQL_QUERY_TIMEOUT_MS", &mut config.query_timeout_ms);
        override_with(&read, "WAVEQL_FETCH_TIMEOUT_MS", &mut config.fetch_timeout_ms);
        override_with(&read, "WAVEQL_SCHEMA_SAMPLE_SIZE", &mut config.schema_sample_size);
        override_with(&read, "WAVEQL_SCHEMA_SEED_ROWS", &mut config.schema_seed_rows);
        override_with(&read, "WAVEQL_STREAM_BUFFER", &mut config.stream_buffer);
        override_with(&read, "WAVEQL_STATEMENT_CACHE_SIZE", &mut config.statement_cache_size);

        let mut ttl = 0u64;
        if override_with(&read, "WAVEQL_SCHEMA_TTL_SECS", &mut ttl) {
            config.schema_ttl_secs = Some(ttl);
        }
        let mut row_limit = 0u64;
        if override_with(&read, "WAVEQL_ROW_LIMIT_PER_SOURCE", &mut row_limit) {
            config.row_limit_per_source = Some(row_limit);
        }

        if let Some(raw) = read("WAVEQL_EVOLUTION") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "forward" | "forward_compatible" => {
                    config.evolution = EvolutionStrategy::ForwardCompatible
                }
                "strict" => config.evolution = EvolutionStrategy::Strict,
                "replace" => config.evolution = EvolutionStrategy::Replace,
                _ => warn!(value = %raw, "ignoring unknown WAVEQL_EVOLUTION"),
            }
        }
        config
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn schema_ttl(&self) -> Option<Duration> {
        self.schema_ttl_secs.map(Duration::from_secs)
    }
}

/// Replaces `target` when `key` holds a parsable value; reports whether it did.
fn override_with<T: FromStr>(read: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> bool {
    let Some(raw) = read(key) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            *target = value;
            true
        }
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> FederationConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FederationConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = config_from(&[
            ("WAVEQL_QUERY_TIMEOUT_MS", "1500"),
            ("WAVEQL_ROW_LIMIT_PER_SOURCE", "10"),
            ("WAVEQL_EVOLUTION", "strict"),
        ]);
        assert_eq!(config.query_timeout_ms, 1500);
        assert_eq!(config.row_limit_per_source, Some(10));
        assert_eq!(config.evolution, EvolutionStrategy::Strict);
        assert_eq!(config.fetch_timeout_ms, 30_000);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = config_from(&[
            ("WAVEQL_MAX_IN_FLIGHT_FETCHES", "many"),
            ("WAVEQL_SCHEMA_TTL_SECS", ""),
            ("WAVEQL_EVOLUTION", "sideways"),
        ]);
        assert_eq!(config, FederationConfig::default());
    }

    #[test]
    fn partial_documents_deserialize() {
        let config: FederationConfig =
            serde_json::from_str(r#"{"stream_buffer": 16, "evolution": "replace"}"#).unwrap();
        assert_eq!(config.stream_buffer, 16);
        assert_eq!(config.evolution, EvolutionStrategy::Replace);
        assert_eq!(config.statement_cache_size, 128);
    }
}
