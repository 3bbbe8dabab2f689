//! AIO MCP server framework
//!
//! Build a Model Context Protocol server by implementing [`ModuleManager`] and
//! handing it to [`McpServerFramework`]. The framework resolves configuration,
//! initializes the module once, registers its tools and serves them over stdio
//! or SSE until shutdown.
//!
//! ```no_run
//! use aio_mcp::{ExampleModule, McpServerFramework, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::builder("my-server", "0.1.0").build()?;
//! McpServerFramework::new(config)?.run(ExampleModule::new).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod tools;

pub use crate::core::config::{
    ConfigOverrides, ModuleParameter, ModuleParams, ParamType, ServerConfig, ServerConfigBuilder,
    TransportKind,
};
pub use crate::core::dispatch::{Dispatcher, InitializedModule, ServerInfo};
pub use crate::core::error::{BoxError, Result, ServerError, ToolError};
pub use crate::core::logging::{LoggingConfig, LoggingGuard, init_logging};
pub use crate::core::module::{ChangeNotifier, ListChanged, LogLevel, ModuleManager, ToolContext};
pub use crate::core::protocol::{
    CallToolResult, Content, GetPromptResult, McpNotification, McpRequest, McpResponse, Prompt,
    PromptArgument, PromptMessage, Role, Tool,
};
pub use crate::core::registry::ToolRegistry;
pub use crate::core::scaffold::{FrameworkSource, ProjectOptions, create_project};
pub use crate::core::server::{McpServerFramework, ServerState, ShutdownHandle};
pub use crate::core::transport::{Peer, PeerSet, Transport};
pub use crate::tools::ExampleModule;

/// Framework version, as written into generated projects
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
