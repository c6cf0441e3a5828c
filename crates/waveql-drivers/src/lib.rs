// SPDX-License-Identifier: Apache-2.0

//! Source transports for WaveQL.
//!
//! Transports receive already-translated fetch requests and return raw JSON
//! pages; they never see SQL.

pub mod duck;
pub mod file;
pub mod memory;
pub mod rest;

pub use file::FileTransport;
pub use memory::MemoryTransport;
pub use rest::{RestConfig, RestTransport};
