// SPDX-License-Identifier: Apache-2.0

//! Local stage of a federated query: the DuckDB SQL run over fetched inputs,
//! and the in-process projection used when no local stage is needed.

pub mod local;
pub mod projection;

pub use local::{local_table_name, LocalBinding, LocalQuery, LocalQueryBuilder};
pub use projection::{DirectProjection, OutputColumn};
