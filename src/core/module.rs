//! Module manager contract
//!
//! A module manager is the pluggable unit of server behavior: it declares the
//! tools (and optionally prompts) it serves and executes calls to them. The
//! framework calls `initialize` exactly once, with exclusive access, before the
//! manager is shared with any transport. Argument validation is entirely the
//! manager's job; the framework forwards arguments untouched.
//!
//! A manager whose tools or prompts change at runtime keeps the
//! `ChangeNotifier` it is handed before `initialize` and calls it after the
//! change. The framework then re-reads `get_tools` and tells every connected
//! client through `notifications/tools/list_changed` (or the prompts variant).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::config::ModuleParams;
use crate::core::error::{BoxError, ToolError};
use crate::core::protocol::{GetPromptResult, McpNotification, Prompt, Tool, methods};
use crate::core::transport::Peer;

/// Pluggable tool provider.
///
/// # Example
/// ```
/// use aio_mcp::{BoxError, ModuleManager, ModuleParams, Tool, ToolContext, ToolError};
/// use async_trait::async_trait;
/// use serde_json::{json, Map, Value};
///
/// struct Clock;
///
/// #[async_trait]
/// impl ModuleManager for Clock {
///     async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), BoxError> {
///         Ok(())
///     }
///
///     fn get_tools(&self) -> Vec<Tool> {
///         vec![Tool::new("now", "Seconds since the epoch", json!({"type": "object"}))]
///     }
///
///     async fn call_tool(
///         &self,
///         name: &str,
///         _arguments: Map<String, Value>,
///         _ctx: Option<&ToolContext>,
///     ) -> Result<Value, ToolError> {
///         match name {
///             "now" => Ok(json!({ "now": 0 })),
///             other => Err(ToolError::UnknownTool(other.to_string())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ModuleManager: Send + Sync {
    /// Module-specific setup (open connections, validate credentials).
    ///
    /// Failure is fatal to startup.
    async fn initialize(&mut self, params: &ModuleParams) -> Result<(), BoxError>;

    /// Tools served by this module. Must be side-effect free and return the
    /// same list on every call until the module announces a change through
    /// its `ChangeNotifier`.
    fn get_tools(&self) -> Vec<Tool>;

    /// Execute a tool. Names outside `get_tools` must fail with
    /// `ToolError::UnknownTool`.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        ctx: Option<&ToolContext>,
    ) -> Result<Value, ToolError>;

    fn get_prompt_templates(&self) -> Vec<Prompt> {
        Vec::new()
    }

    fn get_prompt_content(
        &self,
        name: &str,
        _arguments: &BTreeMap<String, String>,
    ) -> Result<GetPromptResult, ToolError> {
        Err(ToolError::UnknownPrompt(name.to_string()))
    }

    /// Receive the handle for announcing tool or prompt list changes.
    ///
    /// Called once, before `initialize`. Modules with a fixed tool set can
    /// ignore it.
    fn set_change_notifier(&mut self, _notifier: ChangeNotifier) {}
}

#[async_trait]
impl ModuleManager for Box<dyn ModuleManager> {
    async fn initialize(&mut self, params: &ModuleParams) -> Result<(), BoxError> {
        (**self).initialize(params).await
    }

    fn get_tools(&self) -> Vec<Tool> {
        (**self).get_tools()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        ctx: Option<&ToolContext>,
    ) -> Result<Value, ToolError> {
        (**self).call_tool(name, arguments, ctx).await
    }

    fn get_prompt_templates(&self) -> Vec<Prompt> {
        (**self).get_prompt_templates()
    }

    fn get_prompt_content(
        &self,
        name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<GetPromptResult, ToolError> {
        (**self).get_prompt_content(name, arguments)
    }

    fn set_change_notifier(&mut self, notifier: ChangeNotifier) {
        (**self).set_change_notifier(notifier)
    }
}

/// Which advertised list a module changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    Tools,
    Prompts,
}

/// Handle a module manager uses to announce that its tools or prompts changed.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    changes: mpsc::UnboundedSender<ListChanged>,
}

impl ChangeNotifier {
    /// Notifier plus the receiving end the framework listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ListChanged>) {
        let (changes, rx) = mpsc::unbounded_channel();
        (Self { changes }, rx)
    }

    /// The list returned by `get_tools` changed.
    pub fn tools_changed(&self) {
        self.send(ListChanged::Tools);
    }

    /// The list returned by `get_prompt_templates` changed.
    pub fn prompts_changed(&self) {
        self.send(ListChanged::Prompts);
    }

    fn send(&self, change: ListChanged) {
        if self.changes.send(change).is_err() {
            tracing::debug!(?change, "No server listening for list changes");
        }
    }
}

/// MCP logging levels forwarded to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Per-call handle given to `call_tool`.
///
/// Log messages are written to the local log and forwarded to the caller as
/// `notifications/message`; progress goes out as `notifications/progress`.
/// These are out-of-band from the call's return value. A failure to deliver a
/// notification is logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct ToolContext {
    request_id: Value,
    progress_token: Option<Value>,
    peer: Peer,
}

impl ToolContext {
    pub fn new(request_id: Value, progress_token: Option<Value>, peer: Peer) -> Self {
        Self {
            request_id,
            progress_token,
            peer,
        }
    }

    pub fn request_id(&self) -> &Value {
        &self.request_id
    }

    pub fn progress_token(&self) -> Option<&Value> {
        self.progress_token.as_ref()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, "default", message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, "default", message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, "default", message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, "default", message);
    }

    pub fn log(&self, level: LogLevel, logger: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(logger, "{message}"),
            LogLevel::Info => tracing::info!(logger, "{message}"),
            LogLevel::Warning => tracing::warn!(logger, "{message}"),
            LogLevel::Error => tracing::error!(logger, "{message}"),
        }

        let notification = McpNotification::new(
            methods::LOG_MESSAGE,
            json!({ "level": level.as_str(), "logger": logger, "data": message }),
        );
        if let Err(e) = self.peer.notify(&notification) {
            tracing::debug!(error = %e, "Failed to forward log message to client");
        }
    }

    /// Report progress for this call.
    ///
    /// Only sent when the client asked for progress by supplying
    /// `_meta.progressToken` on the request.
    pub fn report_progress(&self, progress: f64, total: Option<f64>) {
        let Some(token) = &self.progress_token else {
            return;
        };

        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        if let Err(e) = self.peer.notify(&McpNotification::new(methods::PROGRESS, params)) {
            tracing::debug!(error = %e, "Failed to send progress notification");
        }
    }

    /// True once the client that issued this call has disconnected.
    pub fn is_cancelled(&self) -> bool {
        self.peer.cancellation().is_cancelled()
    }

    /// Resolves when the client that issued this call disconnects.
    pub async fn cancelled(&self) {
        self.peer.cancellation().cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.peer.cancellation().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl ModuleManager for Bare {
        async fn initialize(&mut self, _params: &ModuleParams) -> Result<(), BoxError> {
            Ok(())
        }

        fn get_tools(&self) -> Vec<Tool> {
            Vec::new()
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Map<String, Value>,
            _ctx: Option<&ToolContext>,
        ) -> Result<Value, ToolError> {
            Err(ToolError::UnknownTool(name.to_string()))
        }
    }

    #[tokio::test]
    async fn prompt_defaults() {
        let mut manager: Box<dyn ModuleManager> = Box::new(Bare);
        manager.initialize(&ModuleParams::new()).await.unwrap();
        assert!(manager.get_prompt_templates().is_empty());
        assert_eq!(
            manager.get_prompt_content("greet", &BTreeMap::new()),
            Err(ToolError::UnknownPrompt("greet".into()))
        );
        assert_eq!(
            manager.call_tool("anything", Map::new(), None).await,
            Err(ToolError::UnknownTool("anything".into()))
        );
    }

    #[test]
    fn log_is_forwarded_as_notification() {
        let (peer, mut rx) = Peer::channel();
        let ctx = ToolContext::new(json!(1), None, peer);
        ctx.warning("disk almost full");

        let msg: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["method"], methods::LOG_MESSAGE);
        assert_eq!(msg["params"]["level"], "warning");
        assert_eq!(msg["params"]["data"], "disk almost full");
    }

    #[test]
    fn progress_requires_a_token() {
        let (peer, mut rx) = Peer::channel();
        ToolContext::new(json!(1), None, peer.clone()).report_progress(1.0, Some(2.0));
        assert!(rx.try_recv().is_err());

        ToolContext::new(json!(1), Some(json!("tok")), peer).report_progress(1.0, Some(2.0));
        let msg: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["params"]["progressToken"], "tok");
        assert_eq!(msg["params"]["total"], 2.0);
    }

    #[test]
    fn notifier_reports_each_change() {
        let (notifier, mut changes) = ChangeNotifier::channel();
        let mut manager: Box<dyn ModuleManager> = Box::new(Bare);
        manager.set_change_notifier(notifier.clone());

        notifier.tools_changed();
        notifier.prompts_changed();
        assert_eq!(changes.try_recv().unwrap(), ListChanged::Tools);
        assert_eq!(changes.try_recv().unwrap(), ListChanged::Prompts);

        drop(changes);
        // Announcing into a closed channel is not an error for the module
        notifier.tools_changed();
    }

    #[test]
    fn cancellation_follows_peer() {
        let (peer, _rx) = Peer::channel();
        let ctx = ToolContext::new(json!(1), None, peer.clone());
        assert!(!ctx.is_cancelled());
        peer.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
