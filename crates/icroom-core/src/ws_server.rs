// WebSocket server for debate clients.
//
// Each accepted connection gets an id, a bounded outbound queue drained by a
// writer task, and a reader loop that forwards text frames to the
// application's event loop as `WsEvent`s.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::ServerEvent;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Why an event could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full: the client is not keeping up.
    Lagging,
    /// The writer side is gone.
    Closed,
}

impl Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Lagging => f.write_str("outbound queue full"),
            DeliveryError::Closed => f.write_str("connection closed"),
        }
    }
}

/// Cloneable sending side of one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `event` without waiting. Never blocks on a slow client.
    pub fn try_deliver(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the writer task to send a close frame and end the connection.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}

// ---------------------------------------------------------------------------
// Events to the application layer
// ---------------------------------------------------------------------------

/// Events emitted by the WebSocket server to the application layer.
#[derive(Debug)]
pub enum WsEvent {
    /// A client completed the WebSocket handshake.
    Connected {
        handle: ConnectionHandle,
        addr: String,
    },
    /// A text frame (raw JSON string) from a client.
    Message {
        connection_id: ConnectionId,
        text: String,
    },
    /// The client went away (close frame, error, or eviction).
    Disconnected { connection_id: ConnectionId },
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Bind the TCP listener the server accepts on.
pub async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("WebSocket server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections forever, serving each on its own task. Returns when
/// the event channel is closed or accepting fails.
pub async fn run(
    listener: TcpListener,
    tx: mpsc::Sender<WsEvent>,
    outbound_buffer: usize,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        if tx.is_closed() {
            break;
        }
        let addr_str = addr.to_string();
        debug!("Accepted TCP connection from {addr_str}");

        let tx = tx.clone();
        tokio::spawn(async move {
            serve_connection(stream, addr_str, tx, outbound_buffer).await;
        });
    }

    Ok(())
}

/// Handshake, then pump frames in both directions until either side ends.
pub async fn serve_connection<S>(
    stream: S,
    addr: String,
    tx: mpsc::Sender<WsEvent>,
    outbound_buffer: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let connection_id = next_connection_id();
    let (out_tx, out_rx) = mpsc::channel(outbound_buffer);
    let handle = ConnectionHandle::new(connection_id, out_tx);
    let shutdown = handle.shutdown_signal();

    if tx
        .send(WsEvent::Connected {
            handle,
            addr: addr.clone(),
        })
        .await
        .is_err()
    {
        return;
    }
    debug!(connection_id, "WebSocket handshake complete with {addr}");

    let (write, read) = ws_stream.split();
    let mut writer = tokio::spawn(write_outbound(write, out_rx, shutdown));

    tokio::select! {
        _ = process_message_stream(read, connection_id, &tx, &addr) => {}
        _ = &mut writer => {
            debug!(connection_id, "writer finished before reader");
        }
    }
    writer.abort();

    let _ = tx.send(WsEvent::Disconnected { connection_id }).await;
    debug!(connection_id, "Connection to {addr} closed");
}

/// Serialize queued events onto `sink` until the queue closes, the sink
/// fails, or a disconnect is requested (which sends a close frame).
pub async fn write_outbound<Si>(
    mut sink: Si,
    mut rx: mpsc::Receiver<ServerEvent>,
    shutdown: Arc<Notify>,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize outbound event: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("WebSocket send failed: {e}");
                    break;
                }
            }
            _ = shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Forward text payloads from any [`Stream`] of WebSocket frames through
/// `tx`. Returns `Err(())` if the channel is closed (receiver dropped),
/// signalling the caller to stop.
///
/// Generic over the stream type so it can be tested with in-memory streams
/// without opening TCP ports.
pub async fn process_message_stream<St>(
    mut stream: St,
    connection_id: ConnectionId,
    tx: &mpsc::Sender<WsEvent>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = WsEvent::Message {
                    connection_id,
                    text: text.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry nothing for us;
                // tungstenite answers pings itself.
            }
        }
    }
    Ok(())
}
