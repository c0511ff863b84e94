//! Axum WebSocket handler for Wisp protocol

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use tracing::{debug, error, info, trace, warn};
use wisp_mux::extension::Extension;
use wisp_mux::packet::CloseReason;
use wisp_mux::{ServerMux, WispError};

use super::config::WispConfig;
use super::policy::{is_stream_allowed, StreamTracker};
use super::resolver::{get_resolver, init_resolver};
use super::stream::{
    connect_error_reason, connect_stream, forward_tcp, forward_udp, ClientStream,
};

/// Application state for the Wisp handler
#[derive(Clone)]
pub struct WispState {
    pub config: Arc<WispConfig>,
}

impl WispState {
    pub fn new(config: WispConfig) -> Self {
        init_resolver(&config);
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for WispState {
    fn default() -> Self {
        Self::new(WispConfig::default())
    }
}

/// Axum handler for Wisp WebSocket connections
pub async fn wisp_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WispState>,
) -> impl IntoResponse {
    info!("New Wisp WebSocket connection");
    ws.on_upgrade(move |socket| handle_wisp_connection(socket, state))
}

/// Handle a single Wisp WebSocket connection
async fn handle_wisp_connection(socket: WebSocket, state: WispState) {
    let id = uuid::Uuid::new_v4().to_string();
    debug!("[{}] Wisp client connected", id);

    if let Err(e) = handle_wisp_inner(socket, state, &id).await {
        error!("[{}] Wisp connection error: {:?}", id, e);
    }

    debug!("[{}] Wisp client disconnected", id);
}

/// Extensions this server offers in its INFO packet, per the configuration.
fn advertised_extensions(config: &WispConfig) -> Vec<Extension> {
    let mut extensions = Vec::new();
    if config.allow_udp {
        extensions.push(Extension::Udp);
    }
    if let Some(motd) = &config.wisp_motd {
        extensions.push(Extension::Motd {
            message: Some(motd.clone()),
        });
    }
    extensions
}

/// Inner handler that returns Result for easier error handling
async fn handle_wisp_inner(socket: WebSocket, state: WispState, id: &str) -> anyhow::Result<()> {
    // Split the WebSocket and wrap with our adapter
    let (ws_write, ws_read) = socket.split();
    let transport = AxumWsTransport::new(ws_read, ws_write);

    let buffer_size = state.config.stream_buffer_size;
    let extensions = (state.config.wisp_version >= 2).then(|| advertised_extensions(&state.config));

    // Split for ServerMux
    let (read, write) = transport.split();

    let (mux, mux_task) = ServerMux::new(read, write, buffer_size, extensions)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create ServerMux: {:?}", e))?
        .with_no_required_extensions();

    let mux = Arc::new(mux);

    // Spawn the multiplexor task
    let mux_id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = mux_task.await {
            trace!("[{}] Mux task ended: {:?}", mux_id, e);
        }
    });

    debug!(
        "[{}] Wisp mux created, extensions: {:?}",
        id,
        mux.get_extension_ids()
    );

    let tracker = Arc::new(StreamTracker::default());

    // Handle incoming streams
    while let Some((connect, stream)) = mux.wait_for_stream().await {
        let config = state.config.clone();
        let tracker = tracker.clone();
        let conn_id = id.to_string();

        tokio::spawn(async move {
            let stream_id = stream.stream_id();
            debug!(
                "[{}] Stream {} requested: {:?}:{}",
                conn_id, stream_id, connect.host, connect.port
            );

            if let Err(reason) = is_stream_allowed(
                &config,
                Some(&tracker),
                connect.stream_type,
                &connect.host,
                connect.port,
            )
            .await
            {
                warn!(
                    "[{}] Stream {} to {}:{} denied by policy: {:?}",
                    conn_id, stream_id, connect.host, connect.port, reason
                );
                let _ = stream.close(reason).await;
                return;
            }

            let ip = match get_resolver().lookup_ip(&connect.host).await {
                Ok(ip) => ip,
                Err(e) => {
                    warn!("[{}] Failed to resolve {}: {:?}", conn_id, connect.host, e);
                    let _ = stream.close(CloseReason::ServerStreamUnreachable).await;
                    return;
                }
            };
            debug!("[{}] Stream {} resolved to: {}", conn_id, stream_id, ip);

            tracker.register(stream_id, &connect.host);
            match connect_stream(ip, &connect).await {
                Ok(ClientStream::Tcp(tcp)) => {
                    if let Err(e) = forward_tcp(stream, tcp, config.copy_buffer_size).await {
                        warn!("[{}] TCP forward error: {:?}", conn_id, e);
                    }
                }
                Ok(ClientStream::Udp(udp)) => {
                    if let Err(e) = forward_udp(stream, udp).await {
                        warn!("[{}] UDP forward error: {:?}", conn_id, e);
                    }
                }
                Err(e) => {
                    warn!("[{}] Connect error: {:?}", conn_id, e);
                    let _ = stream.close(connect_error_reason(&e)).await;
                }
            }
            tracker.unregister(stream_id);
        });
    }

    // Close the mux
    mux.close().await;

    Ok(())
}

// ============================================================================
// WebSocket Transport Adapter
// ============================================================================

pin_project! {
    /// Combined transport bridging an Axum WebSocket to the mux carrier seam
    pub struct AxumWsTransport {
        #[pin]
        read: futures_util::stream::SplitStream<WebSocket>,
        write: futures_util::stream::SplitSink<WebSocket, Message>,
    }
}

impl AxumWsTransport {
    pub fn new(
        read: futures_util::stream::SplitStream<WebSocket>,
        write: futures_util::stream::SplitSink<WebSocket, Message>,
    ) -> Self {
        Self { read, write }
    }

    /// Split into separate read and write parts for ServerMux
    pub fn split(self) -> (AxumWsRead, AxumWsWrite) {
        (
            AxumWsRead { inner: self.read },
            AxumWsWrite::new(self.write),
        )
    }
}

// Read adapter
pin_project! {
    pub struct AxumWsRead {
        #[pin]
        inner: futures_util::stream::SplitStream<WebSocket>,
    }
}

impl Stream for AxumWsRead {
    type Item = Result<Bytes, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match futures::ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(msg)) => match msg {
                    Message::Binary(data) => return Poll::Ready(Some(Ok(data.into()))),
                    Message::Text(text) => {
                        return Poll::Ready(Some(Ok(Bytes::from(text.into_bytes()))))
                    }
                    Message::Close(_) => return Poll::Ready(None),
                    // The websocket layer answers pings; keep polling.
                    Message::Ping(_) | Message::Pong(_) => continue,
                },
                Some(Err(e)) => {
                    return Poll::Ready(Some(Err(WispError::WsImplError(Box::new(
                        std::io::Error::other(e.to_string()),
                    )))))
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

// Write adapter using a channel for proper ordering. The counter tracks bytes
// accepted but not yet written out, which is what the mux's watermark
// backpressure observes.
pub struct AxumWsWrite {
    tx: tokio::sync::mpsc::UnboundedSender<WriteCommand>,
    buffered: Arc<AtomicUsize>,
}

enum WriteCommand {
    Send(Bytes),
    Close,
}

impl AxumWsWrite {
    fn new(write: futures_util::stream::SplitSink<WebSocket, Message>) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WriteCommand>();
        let buffered = Arc::new(AtomicUsize::new(0));
        let counter = buffered.clone();

        // Spawn a task to handle writes in order
        tokio::spawn(async move {
            let mut write = write;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriteCommand::Send(data) => {
                        let len = data.len();
                        let result = write.send(Message::Binary(data.to_vec())).await;
                        counter.fetch_sub(len, Ordering::AcqRel);
                        if let Err(e) = result {
                            trace!("WebSocket send error: {:?}", e);
                            break;
                        }
                    }
                    WriteCommand::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        });

        Self { tx, buffered }
    }
}

impl Sink<Bytes> for AxumWsWrite {
    type Error = WispError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Channel-based approach is always ready (unbounded)
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        // Send through the channel - this maintains ordering
        let len = item.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(WriteCommand::Send(item)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            WispError::WsImplError(Box::new(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "WebSocket write channel closed",
            )))
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Channel handles the actual flushing asynchronously
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let _ = self.tx.send(WriteCommand::Close);
        Poll::Ready(Ok(()))
    }
}

impl wisp_mux::ws::WebSocketWrite for AxumWsWrite {
    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}
