// SPDX-License-Identifier: Apache-2.0

//! SQL front end for WaveQL.
//!
//! `compile` turns SQL text into the narrow statement model of [`ast`];
//! [`ParameterizedQuery`] binds `?` parameters before compiling;
//! [`StatementCache`] memoizes both per connection; [`translate`] splits
//! predicates into native fragments and local residuals.

pub mod ast;
pub mod cache;
pub mod compiler;
pub mod params;
pub mod pushdown;

pub use cache::StatementCache;
pub use compiler::compile;
pub use params::ParameterizedQuery;
pub use pushdown::{dialect_for, translate, NativeDialect, PushedFilter, TranslatedFilter};
