//! MCP request dispatch
//!
//! `Dispatcher` is the protocol runtime both transports share: it routes
//! JSON-RPC requests to the MCP method handlers and, for `tools/call`, into the
//! module manager. Tool failures never escape this boundary; they become
//! client-visible failure responses and the server keeps serving.
//!
//! A dispatcher can only be built from an `InitializedModule`, which in turn
//! can only be obtained by running `ModuleManager::initialize` to completion.
//! No tool call can therefore reach a module that has not been initialized.
//!
//! The dispatcher also owns the live tool registry and the set of connected
//! peers. When the module announces a list change, the registry is rebuilt
//! from `get_tools` and every attached peer receives a `list_changed`
//! notification.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::ModuleParams;
use crate::core::error::{Result, ServerError, ToolError, codes};
use crate::core::module::{ChangeNotifier, ListChanged, ModuleManager, ToolContext};
use crate::core::protocol::{
    CallToolResult, JSONRPC_VERSION, McpNotification, McpRequest, McpResponse, PROTOCOL_VERSION,
    methods,
};
use crate::core::registry::ToolRegistry;
use crate::core::transport::{Peer, PeerSet};

/// Server metadata reported in the `initialize` response.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    /// Free-form usage instructions for the client (the server description)
    pub instructions: String,
}

/// A module manager whose `initialize` has completed successfully.
pub struct InitializedModule {
    module: Box<dyn ModuleManager>,
    changes: mpsc::UnboundedReceiver<ListChanged>,
}

impl InitializedModule {
    /// Hand the module its change notifier, then run `initialize`.
    /// Failure is a startup error.
    pub async fn initialize<M>(mut module: M, params: &ModuleParams) -> Result<Self>
    where
        M: ModuleManager + 'static,
    {
        let (notifier, changes) = ChangeNotifier::channel();
        module.set_change_notifier(notifier);
        module
            .initialize(params)
            .await
            .map_err(|e| ServerError::ModuleInit(e.to_string()))?;
        Ok(Self {
            module: Box::new(module),
            changes,
        })
    }

    pub fn module(&self) -> &dyn ModuleManager {
        self.module.as_ref()
    }
}

/// Routes MCP requests for one server instance.
pub struct Dispatcher {
    info: ServerInfo,
    registry: RwLock<Arc<ToolRegistry>>,
    module: Box<dyn ModuleManager>,
    peers: PeerSet,
    /// Taken by `watch_changes`
    changes: Mutex<Option<mpsc::UnboundedReceiver<ListChanged>>>,
}

impl Dispatcher {
    /// Register the module's tools and build the dispatcher.
    ///
    /// Duplicate tool names are a configuration error.
    pub fn new(info: ServerInfo, module: InitializedModule) -> Result<Self> {
        let registry = ToolRegistry::from_module(module.module())?;
        Ok(Self {
            info,
            registry: RwLock::new(Arc::new(registry)),
            module: module.module,
            peers: PeerSet::default(),
            changes: Mutex::new(Some(module.changes)),
        })
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Snapshot of the currently registered tools
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Subscribe a connected client to list change notifications.
    pub fn attach(&self, peer: Peer) -> u64 {
        self.peers.insert(peer)
    }

    pub fn detach(&self, id: u64) {
        self.peers.remove(id);
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    /// Apply a list change announced by the module and notify every peer.
    ///
    /// For tools the registry is rebuilt from `get_tools` first. A rebuilt list
    /// with duplicate names is rejected: the previous registry stays in place
    /// and nothing is sent. Returns the number of peers notified.
    pub fn apply_change(&self, change: ListChanged) -> Result<usize> {
        let method = match change {
            ListChanged::Tools => {
                let registry = ToolRegistry::from_module(&*self.module)
                    .inspect_err(|e| error!(error = %e, "Rejected updated tool list"))?;
                info!(tools = registry.len(), "Tool list changed");
                *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
                methods::TOOLS_LIST_CHANGED
            }
            ListChanged::Prompts => methods::PROMPTS_LIST_CHANGED,
        };
        let reached = self.peers.broadcast(&McpNotification::new(method, json!({})));
        debug!(method, reached, "Sent list change notification");
        Ok(reached)
    }

    /// Start applying the module's change announcements in the background.
    ///
    /// Returns `None` if already started. The task ends once the dispatcher
    /// is dropped.
    pub fn watch_changes(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut changes = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let dispatcher = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                if let Err(e) = dispatcher.apply_change(change) {
                    warn!(error = %e, ?change, "List change not applied");
                }
            }
        }))
    }

    /// Parse one framed message and dispatch it.
    ///
    /// Unparseable input yields a parse-error response carrying the request id
    /// when it can be recovered. Responses sent by the client are ignored.
    pub async fn handle_line(&self, line: &str, peer: &Peer) -> Option<McpResponse> {
        match serde_json::from_str::<McpRequest>(line) {
            Ok(request) => self.handle(request, peer).await,
            Err(e) => {
                let partial = serde_json::from_str::<Value>(line).ok();
                let id = partial.as_ref().and_then(|v| v.get("id")).cloned();
                match partial {
                    Some(v) if v.get("method").is_none() && (v.get("result").is_some() || v.get("error").is_some()) => {
                        debug!("Ignoring JSON-RPC response from client");
                        None
                    }
                    Some(_) => Some(McpResponse::error(
                        id,
                        codes::INVALID_REQUEST,
                        format!("Invalid request: {e}"),
                    )),
                    None => {
                        warn!(error = %e, "Parse error");
                        Some(McpResponse::error(id, codes::PARSE_ERROR, format!("Parse error: {e}")))
                    }
                }
            }
        }
    }

    /// Dispatch a parsed request. Notifications produce no response.
    pub async fn handle(&self, request: McpRequest, peer: &Peer) -> Option<McpResponse> {
        let Some(id) = request.id.clone() else {
            debug!(method = %request.method, "Received notification");
            return None;
        };
        if id.is_null() {
            return Some(McpResponse::error(
                Some(Value::Null),
                codes::INVALID_REQUEST,
                "Invalid request: id must not be null",
            ));
        }
        let id = Some(id);

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(McpResponse::error(
                id,
                codes::INVALID_REQUEST,
                format!("Unsupported jsonrpc version: {}", request.jsonrpc),
            ));
        }

        debug!(method = %request.method, "Handling request");
        let response = match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(id),
            methods::PING => McpResponse::success(id, json!({})),
            methods::LIST_TOOLS => self.handle_tools_list(id),
            methods::CALL_TOOL => self.handle_tools_call(id, request.params, peer).await,
            methods::LIST_PROMPTS => self.handle_prompts_list(id),
            methods::GET_PROMPT => self.handle_prompts_get(id, request.params),
            other => McpResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }

    fn handle_initialize(&self, id: Option<Value>) -> McpResponse {
        let mut result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "prompts": { "listChanged": true },
                "logging": {}
            },
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version
            }
        });
        if !self.info.instructions.is_empty() {
            result["instructions"] = json!(self.info.instructions);
        }
        McpResponse::success(id, result)
    }

    fn handle_tools_list(&self, id: Option<Value>) -> McpResponse {
        McpResponse::success(id, json!({ "tools": self.registry().list() }))
    }

    /// Execute a tool through the module manager.
    ///
    /// Arguments are passed through untouched (absent arguments become an
    /// empty object). An unknown tool is reported as a JSON-RPC error; any
    /// other tool failure is a normal response flagged `isError`.
    async fn handle_tools_call(
        &self,
        id: Option<Value>,
        params: Option<Value>,
        peer: &Peer,
    ) -> McpResponse {
        let Some(Value::Object(mut params)) = params else {
            return McpResponse::error(id, codes::INVALID_PARAMS, "Invalid params");
        };

        let Some(name) = params.get("name").and_then(Value::as_str).map(str::to_string) else {
            return McpResponse::error(id, codes::INVALID_PARAMS, "Missing tool name");
        };

        let arguments = match params.remove("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments,
            Some(_) => {
                return McpResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    "Tool arguments must be an object",
                );
            }
        };

        let progress_token = params
            .get("_meta")
            .and_then(|meta| meta.get("progressToken"))
            .cloned();
        let ctx = ToolContext::new(id.clone().unwrap_or(Value::Null), progress_token, peer.clone());

        match self.module.call_tool(&name, arguments, Some(&ctx)).await {
            Ok(payload) => {
                debug!(tool = %name, "Tool call succeeded");
                McpResponse::success(id, json!(CallToolResult::json(&payload)))
            }
            Err(err @ ToolError::UnknownTool(_)) => {
                warn!(tool = %name, "Call to unknown tool");
                McpResponse::from_tool_error(id, &err)
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "Tool call failed");
                McpResponse::success(id, json!(CallToolResult::error(&err)))
            }
        }
    }

    fn handle_prompts_list(&self, id: Option<Value>) -> McpResponse {
        McpResponse::success(id, json!({ "prompts": self.module.get_prompt_templates() }))
    }

    fn handle_prompts_get(&self, id: Option<Value>, params: Option<Value>) -> McpResponse {
        let Some(name) = params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        else {
            return McpResponse::error(id, codes::INVALID_PARAMS, "Missing prompt name");
        };

        let arguments: BTreeMap<String, String> = params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .and_then(Value::as_object)
            .map(|args| {
                args.iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), v)
                    })
                    .collect()
            })
            .unwrap_or_default();

        match self.module.get_prompt_content(name, &arguments) {
            Ok(result) => McpResponse::success(id, json!(result)),
            Err(err) => {
                warn!(prompt = %name, error = %err, "Prompt lookup failed");
                McpResponse::from_tool_error(id, &err)
            }
        }
    }
}
