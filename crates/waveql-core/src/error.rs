// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for WaveQL
//!
//! Every failure surfaced to a caller is one of these kinds. Source-specific
//! failures are wrapped into `Transport` by the transport collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::SchemaChange;

/// Unified error type for compilation, planning and execution
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Query syntax error: {message}{}", clause_suffix(.clause))]
    SyntaxError {
        message: String,
        clause: Option<String>,
    },

    #[error("Query error: {message}")]
    QueryError { message: String },

    #[error("Schema of {source_id}.{table} changed ({} change(s)); invalidate and retry", .changes.len())]
    SchemaEvolution {
        source_id: String,
        table: String,
        changes: Vec<SchemaChange>,
    },

    #[error("Transport error from '{source_id}': {message}")]
    Transport {
        source_id: String,
        message: String,
        retryable: bool,
    },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn clause_suffix(clause: &Option<String>) -> String {
    match clause {
        Some(c) => format!(" (near `{c}`)"),
        None => String::new(),
    }
}

impl EngineError {
    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: msg.into(),
            clause: None,
        }
    }

    /// Syntax error pointing at the clause that could not be compiled.
    pub fn syntax_at(msg: impl Into<String>, clause: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: msg.into(),
            clause: Some(clause.into()),
        }
    }

    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QueryError { message: msg.into() }
    }

    /// Transport failure that only aborts the current query.
    pub fn transport(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            source_id: source_id.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Transport failure the source will not recover from without intervention
    /// (bad credentials, unknown endpoint).
    pub fn transport_fatal(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            source_id: source_id.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn schema_evolution(
        source_id: impl Into<String>,
        table: impl Into<String>,
        changes: Vec<SchemaChange>,
    ) -> Self {
        Self::SchemaEvolution {
            source_id: source_id.into(),
            table: table.into(),
            changes,
        }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// True for transport failures that abort only the running query.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_mentions_clause() {
        let err = EngineError::syntax_at("subqueries are not supported", "(SELECT 1)");
        assert_eq!(
            err.to_string(),
            "Query syntax error: subqueries are not supported (near `(SELECT 1)`)"
        );
        assert_eq!(
            EngineError::syntax_error("empty query").to_string(),
            "Query syntax error: empty query"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::transport("sn", "503").is_retryable());
        assert!(!EngineError::transport_fatal("sn", "401").is_retryable());
        assert!(EngineError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!EngineError::query_error("unknown column").is_retryable());
    }

    #[test]
    fn error_serializes_with_variant_tag() {
        let err = EngineError::transport("jira", "rate limited");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["Transport"]["source_id"], "jira");
        assert_eq!(json["Transport"]["retryable"], true);
    }
}
