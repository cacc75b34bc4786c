//! Domain layer - Volume and snapshot models and the cloud facade port
//!
//! Adapters in [`crate::cloud`] implement the port.

pub mod models;
pub mod ports;

pub use models::*;
pub use ports::*;
