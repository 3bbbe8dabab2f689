//! Event-stream transport: MCP over HTTP with server-sent events.
//!
//! Routes:
//! - `GET /sse` opens a session. The first event (`endpoint`) tells the client
//!   where to POST its messages; every response and notification for the
//!   session then arrives as a `message` event on this stream.
//! - `POST /messages/?session_id=<id>` accepts one JSON-RPC message for a
//!   session and answers `202 Accepted`.
//! - `POST /mcp` answers a single JSON-RPC request directly in the HTTP body.
//! - `GET /health` reports liveness and the number of open sessions.
//!
//! Every route answers CORS preflight requests and carries CORS headers, so
//! browser clients on other origins can connect.
//!
//! Each session has its own `Peer`. Closing the stream (client disconnect)
//! removes the session and cancels its token, which in-flight calls observe
//! through `ToolContext`. Tool calls run on the framework's event loop rather
//! than on the HTTP workers and are tracked so shutdown can wait for them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{
    App, HttpResponse, HttpServer, Result,
    http::header::{self, ContentEncoding},
    middleware::{Compress, DefaultHeaders, Logger},
    web,
};
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::dispatch::Dispatcher;
use crate::core::error::{Result as ServerResult, ServerError};
use crate::core::transport::Peer;

/// Path clients POST session messages to
pub const MESSAGES_PATH: &str = "/messages/";

/// Interval between keep-alive comment frames on idle streams
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state for all HTTP workers.
pub struct SseState {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionTable>,
    /// Framework event loop that runs tool calls
    runtime: Handle,
    tracker: TaskTracker,
    /// Cancelled at shutdown to end every open stream
    closing: CancellationToken,
}

impl SseState {
    /// Must be called from within the runtime that should execute tool calls.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(SessionTable::default()),
            runtime: Handle::current(),
            tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run a request on the framework loop, delivering the response to `peer`.
    fn spawn_dispatch(&self, body: String, peer: Peer) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.tracker.spawn_on(
            async move {
                if let Some(response) = dispatcher.handle_line(&body, &peer).await {
                    if let Err(e) = peer.send_response(&response) {
                        debug!(error = %e, "Session closed before response was delivered");
                    }
                }
            },
            &self.runtime,
        );
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<Uuid, Peer>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Peer>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: Uuid, peer: Peer) {
        self.lock().insert(id, peer);
    }

    fn get(&self, id: &Uuid) -> Option<Peer> {
        self.lock().get(id).cloned()
    }

    fn remove(&self, id: &Uuid) -> Option<Peer> {
        self.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes the session and cancels its in-flight calls when the stream is dropped.
struct SessionGuard {
    id: Uuid,
    sessions: Arc<SessionTable>,
    dispatcher: Arc<Dispatcher>,
    /// Registration for list change broadcasts
    peer_id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.dispatcher.detach(self.peer_id);
        if let Some(peer) = self.sessions.remove(&self.id) {
            peer.cancellation().cancel();
        }
        info!(session = %self.id, "SSE session closed");
    }
}

/// Body stream of one SSE session.
struct SessionStream {
    endpoint: Option<Bytes>,
    outbound: mpsc::UnboundedReceiver<String>,
    keep_alive: Interval,
    closing: Pin<Box<WaitForCancellationFutureOwned>>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(endpoint) = this.endpoint.take() {
            return Poll::Ready(Some(Ok(endpoint)));
        }

        match this.outbound.poll_recv(cx) {
            Poll::Ready(Some(message)) => return Poll::Ready(Some(Ok(sse_event("message", &message)))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if this.closing.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        if this.keep_alive.poll_tick(cx).is_ready() {
            return Poll::Ready(Some(Ok(Bytes::from_static(b": ping\n\n"))));
        }

        Poll::Pending
    }
}

/// Format one SSE event: `event: <name>\ndata: <data>\n\n`
fn sse_event(event: &str, data: &str) -> Bytes {
    let mut frame = String::with_capacity(event.len() + data.len() + 16);
    frame.push_str("event: ");
    frame.push_str(event);
    frame.push('\n');
    for line in data.lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

#[derive(Deserialize)]
struct SessionQuery {
    session_id: String,
}

/// Open a new SSE session.
async fn sse_connect(state: web::Data<SseState>) -> HttpResponse {
    let id = Uuid::new_v4();
    let (peer, outbound) = Peer::channel();
    let peer_id = state.dispatcher.attach(peer.clone());
    state.sessions.insert(id, peer);
    info!(session = %id, "SSE session opened");

    let endpoint = format!("{MESSAGES_PATH}?session_id={}", id.simple());
    let stream = SessionStream {
        endpoint: Some(sse_event("endpoint", &endpoint)),
        outbound,
        keep_alive: tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL),
        closing: Box::pin(state.closing.clone().cancelled_owned()),
        _guard: SessionGuard {
            id,
            sessions: Arc::clone(&state.sessions),
            dispatcher: Arc::clone(&state.dispatcher),
            peer_id,
        },
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(header::CacheControl(vec![
            header::CacheDirective::NoCache,
            header::CacheDirective::NoStore,
            header::CacheDirective::MustRevalidate,
        ]))
        // Compression would buffer the stream
        .insert_header(ContentEncoding::Identity)
        // Disable nginx buffering for real-time streaming
        .insert_header(("x-accel-buffering", "no"))
        .streaming(stream)
}

/// Accept one JSON-RPC message for an open session.
async fn post_message(
    state: web::Data<SseState>,
    query: web::Query<SessionQuery>,
    body: web::Bytes,
) -> HttpResponse {
    let Ok(id) = Uuid::parse_str(&query.session_id) else {
        return HttpResponse::BadRequest().body("Invalid session ID");
    };
    let Some(peer) = state.sessions.get(&id) else {
        return HttpResponse::NotFound().body("Could not find session");
    };

    let body = match String::from_utf8(body.to_vec()) {
        Ok(body) if serde_json::from_str::<serde_json::Value>(&body).is_ok() => body,
        _ => {
            warn!(session = %id, "Rejected malformed message");
            return HttpResponse::BadRequest().body("Could not parse message");
        }
    };

    state.spawn_dispatch(body, peer);
    HttpResponse::Accepted().body("Accepted")
}

/// Answer one JSON-RPC request synchronously.
///
/// Notifications emitted by the tool have no stream to go to and are dropped.
async fn mcp_direct(state: web::Data<SseState>, body: web::Bytes) -> Result<HttpResponse> {
    let Ok(body) = String::from_utf8(body.to_vec()) else {
        return Ok(HttpResponse::BadRequest().body("Body must be UTF-8"));
    };

    let dispatcher = Arc::clone(&state.dispatcher);
    let call = state.tracker.spawn_on(
        async move { dispatcher.handle_line(&body, &Peer::detached()).await },
        &state.runtime,
    );

    match call.await {
        Ok(Some(response)) => Ok(HttpResponse::Ok().json(response)),
        Ok(None) => Ok(HttpResponse::Accepted().finish()),
        Err(e) => {
            warn!(error = %e, "Request task failed");
            Ok(HttpResponse::InternalServerError().finish())
        }
    }
}

/// Liveness check with the current session count.
async fn health(state: web::Data<SseState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": state.dispatcher.info().name,
        "sessions": state.session_count()
    })))
}

/// Register the transport's routes behind a permissive CORS policy.
///
/// Compression, security headers and access logging are added by `serve_sse`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .wrap(Cors::permissive())
            .route("/health", web::get().to(health))
            .route("/sse", web::get().to(sse_connect))
            .route(MESSAGES_PATH, web::post().to(post_message))
            .route("/mcp", web::post().to(mcp_direct))
            .route("/", web::get().to(health)),
    );
}

/// Run the SSE transport until `shutdown` fires or the HTTP server fails.
///
/// # Arguments
/// * `dispatcher` - Protocol runtime holding the initialized module manager
/// * `host` / `port` - Bind address
/// * `workers` - HTTP worker threads
/// * `shutdown` - Graceful shutdown trigger
/// * `drain_timeout` - Upper bound on waiting for in-flight tool calls
///
/// # Shutdown
/// New connections stop being accepted, in-flight tool calls are awaited (up
/// to `drain_timeout`) so their responses still reach the open streams, then
/// every stream is closed.
pub async fn serve_sse(
    dispatcher: Arc<Dispatcher>,
    host: &str,
    port: u16,
    workers: usize,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> ServerResult<()> {
    let state = web::Data::new(SseState::new(dispatcher));
    let tracker = state.tracker.clone();
    let closing = state.closing.clone();

    info!(
        name = %state.dispatcher.info().name,
        version = %state.dispatcher.info().version,
        bind = %format!("{host}:{port}"),
        workers,
        "MCP server starting (sse transport)"
    );

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(Compress::default())
            .wrap(DefaultHeaders::new().add(("X-Content-Type-Options", "nosniff")))
            .wrap(Logger::new("%r %s %Dms"))
            .configure(configure)
    })
    .workers(workers)
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    .shutdown_timeout(drain_timeout.as_secs() + 1)
    // Signals are handled by the framework through `shutdown`
    .disable_signals()
    .bind((host, port))
    .map_err(|e| ServerError::Transport(format!("cannot bind {host}:{port}: {e}")))?
    .run();

    let handle = server.handle();
    let stopper = tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutdown requested, stopping HTTP server");
        let stopped = handle.stop(true);

        tracker.close();
        if tokio::time::timeout(drain_timeout, tracker.wait()).await.is_err() {
            warn!(in_flight = tracker.len(), "Timed out waiting for in-flight tool calls");
        }
        closing.cancel();
        stopped.await;
    });

    let result = server.await;
    stopper.abort();
    result.map_err(|e| ServerError::Transport(format!("HTTP server failed: {e}")))
}
