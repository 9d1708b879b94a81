//! SensorThings bridge server: configuration, logging and process wiring.
//! The bridging, orchestration and storage live in the `bridge`, `manager`
//! and `storage` crates.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod server;
