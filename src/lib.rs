// SPDX-License-Identifier: Apache-2.0

//! WaveQL: federated SQL over REST APIs, flat files and an embedded
//! analytics engine.
//!
//! ```no_run
//! # async fn demo() -> waveql::EngineResult<()> {
//! use std::sync::Arc;
//! use waveql::{Capability, Connection, DialectKind, FragmentEncoding, MemoryTransport};
//!
//! let crm = MemoryTransport::new(Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere));
//! let conn = Connection::default().with_source("crm", Arc::new(crm));
//! let _rows = conn.query("SELECT name FROM crm.contacts").await?.fetch_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod federation;
pub mod metrics;
pub mod observability;

pub use catalog::{SourceCatalog, SourceInfo};
pub use config::FederationConfig;
pub use connection::Connection;
pub use cursor::ResultSet;
pub use federation::coordinator::{fetch_limit, init_fetch_limit};
pub use federation::{ExecutionSummary, Plan};

pub use waveql_core::{
    Capability, Column, DataType, DialectKind, EngineError, EngineResult, EvolutionStrategy, FragmentEncoding, Literal,
    Row, Schema, SchemaRegistry, Sensitive, SourceTransport, Table, TableKey, Value,
};
pub use waveql_drivers::{FileTransport, MemoryTransport, RestConfig, RestTransport};
