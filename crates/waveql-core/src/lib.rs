// SPDX-License-Identifier: Apache-2.0

//! Core types shared by every WaveQL crate: typed values and schemas,
//! predicates, source capabilities, the schema registry, the error taxonomy
//! and the collaborator traits.

pub mod capability;
pub mod error;
pub mod predicate;
pub mod schema;
pub mod sensitive;
pub mod traits;
pub mod types;

pub use capability::{AggregateFunc, Capability, DialectKind, FragmentEncoding, PredicateShape};
pub use error::{EngineError, EngineResult};
pub use predicate::{ColumnRef, CompareOp, Literal, Predicate};
pub use schema::{EvolutionStrategy, SchemaChange, SchemaRegistry};
pub use sensitive::Sensitive;
pub use traits::{
    AggregateCall, FetchRequest, LocalEngine, NativeQueryFragment, OrderSpec, Page, PushedAggregate,
    PushedJoin, SourceTransport, WriteOperation, WriteRequest,
};
pub use types::{Column, DataType, QueryId, Row, Schema, Table, TableKey, Value};
