// =============================================================================
// Conflux Matrix Sync Engine - Library Crate
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The sync read path of a Matrix homeserver: eight monotonic stream
//   clocks composed through a read-consistent snapshot session, a state
//   delta engine implementing the Matrix membership rules, and a
//   topological pagination engine. Writers and the HTTP surface live
//   elsewhere; this crate is the part in between.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod service;
pub mod test_utils;
pub mod utils;

pub use config::Config;
pub use database::KeyValueDatabase;
pub use service::pdu::PduEvent;
pub use utils::error::{Error, Result};
