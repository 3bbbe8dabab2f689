//! Stream transport: newline-delimited JSON-RPC over a reader/writer pair.
//!
//! In production the pair is stdin/stdout, which makes the server usable as a
//! subprocess of an MCP client (and of MCP Inspector). All logging goes to
//! stderr so nothing but protocol frames ever reaches stdout.
//!
//! Every request is dispatched on its own task, so slow tool calls do not block
//! reading; responses are written in completion order by a single writer task.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::dispatch::Dispatcher;
use crate::core::error::{Result, ServerError};
use crate::core::transport::Peer;

/// How long the writer gets to flush queued frames once input has ended
const WRITER_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Serve MCP over the process's stdin/stdout.
pub async fn serve_stdio(
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    info!(
        name = %dispatcher.info().name,
        version = %dispatcher.info().version,
        "MCP server starting (stdio transport)"
    );
    serve_stream(
        tokio::io::stdin(),
        tokio::io::stdout(),
        dispatcher,
        shutdown,
        drain_timeout,
    )
    .await
}

/// Serve MCP over any reader/writer pair until input ends or `shutdown` fires.
///
/// # Arguments
/// * `reader` - Source of newline-delimited JSON-RPC messages
/// * `writer` - Sink for responses and notifications, one JSON object per line
/// * `dispatcher` - Protocol runtime holding the initialized module manager
/// * `shutdown` - Stops reading new requests when cancelled
/// * `drain_timeout` - Upper bound on waiting for in-flight calls before returning
///
/// # Errors
/// A read failure or a broken writer is a fatal transport error: the single
/// connection is gone and the server should exit.
pub async fn serve_stream<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::with_capacity(8192, reader).lines();
    let (peer, outbound) = Peer::channel();
    let peer_id = dispatcher.attach(peer.clone());
    let connection_lost = peer.cancellation().clone();
    let mut writer_task = tokio::spawn(write_frames(
        BufWriter::with_capacity(8192, writer),
        outbound,
        connection_lost.clone(),
    ));
    let tracker = TaskTracker::new();

    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer reading requests");
                break Ok(());
            }
            _ = connection_lost.cancelled() => {
                break Err(ServerError::Transport("output stream closed".into()));
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let line = line.to_string();
                    let dispatcher = Arc::clone(&dispatcher);
                    let peer = peer.clone();
                    tracker.spawn(async move {
                        if let Some(response) = dispatcher.handle_line(&line, &peer).await {
                            if let Err(e) = peer.send_response(&response) {
                                warn!(error = %e, "Dropping response");
                            }
                        }
                    });
                }
                Ok(None) => {
                    debug!("Input stream closed");
                    break Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to read request");
                    break Err(ServerError::Transport(format!("failed to read input: {e}")));
                }
            }
        }
    };

    tracker.close();
    if tokio::time::timeout(drain_timeout, tracker.wait()).await.is_err() {
        warn!(
            in_flight = tracker.len(),
            "Timed out waiting for in-flight tool calls"
        );
    }

    // The writer stops once every peer clone is gone; calls that outlived the
    // drain timeout still hold one, so cap the wait.
    dispatcher.detach(peer_id);
    drop(peer);
    if tokio::time::timeout(WRITER_FLUSH_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }

    outcome
}

/// Write queued frames, one per line, flushing after each for low latency.
async fn write_frames<W>(
    mut writer: BufWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    connection_lost: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            error!(error = %e, "Failed to write to output stream");
            connection_lost.cancel();
            return;
        }
    }
}
