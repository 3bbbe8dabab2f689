//! Bundled module managers
//!
//! `ExampleModule` backs the `aio-mcp` binary and doubles as a reference
//! implementation of `ModuleManager`.

pub mod echo;

pub use echo::ExampleModule;
