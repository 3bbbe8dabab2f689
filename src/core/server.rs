//! MCP server framework: bootstrap sequence and serving loop
//!
//! Startup is a linear state machine:
//!
//! `Unconfigured -> ConfigLoaded -> ModuleInitialized -> ToolsRegistered -> Serving -> Stopped | Crashed`
//!
//! - The configuration is validated when the framework is created.
//! - `prepare` invokes the module manager factory exactly once, runs
//!   `initialize`, and registers the advertised tools. From then on, list
//!   changes the module announces are applied and broadcast to clients.
//! - `serve` starts the transport selected in the configuration and stays in
//!   `Serving` until the transport ends or a shutdown is requested (SIGINT,
//!   SIGTERM, or the shutdown handle). In-flight tool calls are not cancelled
//!   on shutdown; the transport waits for them up to the configured timeout.
//! - A failure of the transport itself moves the server to `Crashed`.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::ServerConfig;
use crate::core::dispatch::{Dispatcher, InitializedModule, ServerInfo};
use crate::core::error::{Result, ServerError};
use crate::core::module::ModuleManager;
use crate::core::transport::Transport;
use crate::core::{sse, stdio};

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Unconfigured,
    ConfigLoaded,
    ModuleInitialized,
    ToolsRegistered,
    Serving,
    Stopped,
    Crashed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Unconfigured => "unconfigured",
            ServerState::ConfigLoaded => "config-loaded",
            ServerState::ModuleInitialized => "module-initialized",
            ServerState::ToolsRegistered => "tools-registered",
            ServerState::Serving => "serving",
            ServerState::Stopped => "stopped",
            ServerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Handle for triggering graceful shutdown from outside the server loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Orchestrates configuration, module manager setup, tool registration and
/// the transport loop for one server process.
pub struct McpServerFramework {
    config: ServerConfig,
    state: watch::Sender<ServerState>,
    shutdown: CancellationToken,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl McpServerFramework {
    /// Create the framework from a resolved configuration.
    ///
    /// # Errors
    /// `ServerError::Config` if the configuration is invalid. Nothing has been
    /// started at that point.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let (state, _) = watch::channel(ServerState::Unconfigured);
        config.validate()?;

        let framework = Self {
            config,
            state,
            shutdown: CancellationToken::new(),
            dispatcher: None,
        };
        framework.transition(ServerState::ConfigLoaded);
        Ok(framework)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// The dispatcher, once tools are registered
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    fn transition(&self, next: ServerState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "Server state changed");
    }

    /// Build and initialize the module manager, then register its tools.
    ///
    /// # Arguments
    /// * `factory` - Constructor for the module manager, called exactly once
    ///
    /// # Errors
    /// - `ServerError::ModuleInit` if `initialize` fails
    /// - `ServerError::DuplicateTool` if two advertised tools share a name
    /// - `ServerError::Config` if the framework was already prepared
    pub async fn prepare<F, M>(&mut self, factory: F) -> Result<Arc<Dispatcher>>
    where
        F: FnOnce() -> M,
        M: ModuleManager + 'static,
    {
        if self.state() != ServerState::ConfigLoaded {
            return Err(ServerError::Config(format!(
                "cannot prepare a server in state '{}'",
                self.state()
            )));
        }

        let module = InitializedModule::initialize(factory(), &self.config.module_params)
            .await
            .inspect_err(|e| error!(error = %e, "Module manager initialization failed"))?;
        self.transition(ServerState::ModuleInitialized);

        let info = ServerInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            instructions: self.config.description.clone(),
        };
        let dispatcher = Arc::new(
            Dispatcher::new(info, module)
                .inspect_err(|e| error!(error = %e, "Tool registration failed"))?,
        );
        info!(tools = dispatcher.registry().len(), "Registered tools");
        dispatcher.watch_changes();
        self.transition(ServerState::ToolsRegistered);

        self.dispatcher = Some(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    /// Run the configured transport until shutdown.
    pub async fn serve(self) -> Result<()> {
        let transport = Transport::from_config(&self.config);
        let dispatcher = self.ready_dispatcher()?;
        install_signal_handlers(self.shutdown.clone());

        self.transition(ServerState::Serving);
        let drain_timeout = self.config.shutdown_timeout;
        let result = match transport {
            Transport::Stdio => stdio::serve_stdio(dispatcher, self.shutdown.clone(), drain_timeout).await,
            Transport::Sse {
                host,
                port,
                workers,
            } => {
                sse::serve_sse(dispatcher, &host, port, workers, self.shutdown.clone(), drain_timeout)
                    .await
            }
        };
        self.finish(result)
    }

    /// Serve the stream transport over an arbitrary reader/writer pair.
    ///
    /// Useful for embedding the server in-process (pipes, sockets, tests).
    /// The configured transport kind is ignored.
    pub async fn serve_stream<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = self.ready_dispatcher()?;
        self.transition(ServerState::Serving);
        let result = stdio::serve_stream(
            reader,
            writer,
            dispatcher,
            self.shutdown.clone(),
            self.config.shutdown_timeout,
        )
        .await;
        self.finish(result)
    }

    /// `prepare` followed by `serve`.
    pub async fn run<F, M>(mut self, factory: F) -> Result<()>
    where
        F: FnOnce() -> M,
        M: ModuleManager + 'static,
    {
        self.prepare(factory).await?;
        self.serve().await
    }

    fn ready_dispatcher(&self) -> Result<Arc<Dispatcher>> {
        match (&self.dispatcher, self.state()) {
            (Some(dispatcher), ServerState::ToolsRegistered) => Ok(Arc::clone(dispatcher)),
            (_, state) => Err(ServerError::Config(format!(
                "cannot serve a server in state '{state}'"
            ))),
        }
    }

    fn finish(&self, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => {
                info!("Server stopped");
                self.transition(ServerState::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Transport failed");
                self.transition(ServerState::Crashed);
            }
        }
        result
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
fn install_signal_handlers(shutdown: CancellationToken) {
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    warn!("Received SIGINT, shutting down gracefully");
                    on_interrupt.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
            },
            _ = on_interrupt.cancelled() => {}
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        warn!("Received SIGTERM, shutting down gracefully");
                        shutdown.cancel();
                    }
                    _ = shutdown.cancelled() => {}
                }
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    });
}
