// SPDX-License-Identifier: Apache-2.0

//! Federated execution
//!
//! The planner splits a statement into per-source fetch steps and an
//! optional local stage; the coordinator runs the steps concurrently and
//! finishes the query in an in-memory DuckDB instance.

pub mod coordinator;
pub mod duckdb_engine;
pub mod planner;
pub mod types;

pub use types::{ExecutionSummary, Finish, LocalStage, Plan, SelectPlan, SourceFetchStep, StepSummary, WritePlan};
