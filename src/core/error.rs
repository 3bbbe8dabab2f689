//! Error types for the MCP server framework
//!
//! Two families live here. `ServerError` covers everything the framework itself
//! can fail at (configuration, module initialization, transports, scaffolding).
//! `ToolError` is what a module manager returns from `call_tool`; the dispatcher
//! turns it into a client-visible failure instead of stopping the server.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for framework operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Boxed error accepted from module initialization
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// JSON-RPC 2.0 error codes used by the dispatcher
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Framework-level error
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("Module initialization failed: {0}")]
    ModuleInit(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Project directory already exists: {}", .0.display())]
    ProjectExists(PathBuf),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Errors that must stop the process before any transport starts
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            ServerError::Config(_) | ServerError::DuplicateTool(_) | ServerError::ModuleInit(_)
        )
    }
}

/// Error returned by a module manager while serving a tool or prompt call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl ToolError {
    /// Shorthand for a missing or mistyped argument
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments(message.into())
    }

    /// Wrap any displayable failure as an execution error
    pub fn execution(err: impl std::fmt::Display) -> Self {
        ToolError::Execution(err.to_string())
    }

    /// JSON-RPC error code for this error
    pub fn code(&self) -> i64 {
        match self {
            ToolError::UnknownTool(_) | ToolError::UnknownPrompt(_) => codes::METHOD_NOT_FOUND,
            ToolError::InvalidArguments(_) => codes::INVALID_PARAMS,
            ToolError::Execution(_) | ToolError::Cancelled => codes::INTERNAL_ERROR,
        }
    }
}
