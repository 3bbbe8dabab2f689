//! Core server framework
//!
//! - config.rs: layered configuration (defaults, config file, environment, CLI)
//! - module.rs: the module manager contract and per-call tool context
//! - registry.rs / dispatch.rs: tool registration and JSON-RPC routing
//! - stdio.rs / sse.rs: the two transports
//! - server.rs: bootstrap state machine tying it together

pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod module;
pub mod protocol;
pub mod registry;
pub mod scaffold;
pub mod server;
pub mod sse;
pub mod stdio;
pub mod transport;
