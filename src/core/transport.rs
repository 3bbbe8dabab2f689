//! Transport selection and the per-connection peer handle
//!
//! The transport is a tagged variant resolved once from `ServerConfig`; the
//! server loop matches on it a single time at startup. `Peer` is what both
//! transports hand to the dispatcher for one logical connection: an outbound
//! channel for messages the server pushes (responses and notifications) and
//! the cancellation token that fires when the client goes away.
//! `PeerSet` tracks the connected peers that server-initiated broadcasts
//! (list change notifications) go to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::config::{ServerConfig, TransportKind};
use crate::core::error::{Result, ServerError};
use crate::core::protocol::{McpNotification, McpResponse};

/// Transport resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout
    Stdio,
    /// HTTP server with per-client server-sent-events sessions
    Sse {
        host: String,
        port: u16,
        workers: usize,
    },
}

impl Transport {
    pub fn from_config(config: &ServerConfig) -> Self {
        match config.transport {
            TransportKind::Stdio => Transport::Stdio,
            TransportKind::Sse => Transport::Sse {
                host: config.host.clone(),
                port: config.port,
                workers: config.workers,
            },
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stdio => TransportKind::Stdio,
            Transport::Sse { .. } => TransportKind::Sse,
        }
    }
}

/// Server-side handle on one client connection or SSE session.
///
/// Cloning is cheap; every in-flight call holds a clone. Messages are
/// serialized JSON, framed by the owning transport.
#[derive(Debug, Clone)]
pub struct Peer {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(outbound: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }

    /// Peer plus the receiving end of its outbound channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Peer whose pushed messages go nowhere (request/response HTTP calls).
    pub fn detached() -> Self {
        let (peer, _rx) = Self::channel();
        peer
    }

    pub fn notify(&self, notification: &McpNotification) -> Result<()> {
        self.send(notification)
    }

    pub fn send_response(&self, response: &McpResponse) -> Result<()> {
        self.send(response)
    }

    fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.outbound
            .send(json)
            .map_err(|_| ServerError::Transport("peer connection closed".into()))
    }

    /// Fires when the client disconnects.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Connected peers, keyed by an id handed out on insert.
#[derive(Debug, Default)]
pub struct PeerSet {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, Peer>>,
}

impl PeerSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, peer: Peer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.lock();
        peers.retain(|_, peer| !peer.is_closed());
        peers.insert(id, peer);
        id
    }

    pub fn remove(&self, id: u64) -> Option<Peer> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `notification` to every open peer, dropping closed ones.
    ///
    /// Returns the number of peers reached.
    pub fn broadcast(&self, notification: &McpNotification) -> usize {
        let mut peers = self.lock();
        peers.retain(|_, peer| peer.notify(notification).is_ok());
        peers.len()
    }
}
