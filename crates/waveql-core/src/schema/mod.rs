// SPDX-License-Identifier: Apache-2.0

//! Schema inference, evolution and the per-connection schema cache.

pub mod evolution;
pub mod infer;
pub mod registry;

pub use evolution::{apply_changes, diff, merge_schemas, EvolutionStrategy, SchemaChange};
pub use infer::{infer, infer_json_type, merge_types, widen_to_fit};
pub use registry::{SchemaEntry, SchemaRegistry};
