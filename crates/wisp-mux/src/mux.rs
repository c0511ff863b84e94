//! The per-connection state machine: handshake, packet router, stream table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::extension::Extension;
use crate::packet::{CloseReason, ConnectPacket, Packet, PacketType, WispVersion};
use crate::stream::{MuxStream, StreamFlow};
use crate::unfair_select::unfair_select;
use crate::ws::{LockedWebSocketWrite, WebSocketRead, WebSocketWrite};
use crate::{Role, WispError};

/// Internal events routed to the packet loop alongside carrier frames.
pub(crate) enum ControlEvent {
    /// A close handle tore a stream down; drop it from the table.
    RemoveStream(u32),
    /// [`ServerMux::close`] was called; unwind the connection.
    Shutdown,
}

/// Stream-table entry: the producer side of the client→target buffer plus
/// the state shared with the stream's handles.
struct MuxMapValue {
    tx: mpsc::Sender<Bytes>,
    flow: Arc<StreamFlow>,
    is_closed: Arc<AtomicBool>,
}

type StreamTable = Arc<Mutex<HashMap<u32, MuxMapValue>>>;

/// The driver future for a session's packet loop.
pub type MuxTask = Pin<Box<dyn Future<Output = Result<(), WispError>> + Send>>;

/// Server half of a Wisp session over one carrier.
///
/// Constructed with [`ServerMux::new`], which performs the handshake and
/// yields a [`ServerMuxResult`]. The caller then decides whether any
/// extensions are mandatory and receives the mux handle together with the
/// packet-loop future, which must be driven (usually via `tokio::spawn`) for
/// the session to make progress.
pub struct ServerMux<W: WebSocketWrite> {
    buffer_size: u32,
    advertised: Vec<Extension>,
    negotiated: Vec<Extension>,
    write: LockedWebSocketWrite<W>,
    control: mpsc::UnboundedSender<ControlEvent>,
    stream_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ConnectPacket, MuxStream<W>)>>,
}

impl<W: WebSocketWrite> ServerMux<W> {
    /// Accept a carrier and run the protocol handshake.
    ///
    /// `extensions: Some(list)` enables the version-2 handshake and
    /// advertises `list`; `None` runs a version-1 session with no INFO
    /// exchange. Either way the client is granted `buffer_size` credit on
    /// the control stream before this returns.
    pub async fn new<R>(
        mut read: R,
        write: W,
        buffer_size: u32,
        extensions: Option<Vec<Extension>>,
    ) -> Result<ServerMuxResult<W>, WispError>
    where
        R: WebSocketRead + 'static,
    {
        let write = LockedWebSocketWrite::new(write);

        let mut advertised = Vec::new();
        let mut negotiated = Vec::new();
        if let Some(offered) = extensions {
            advertised = offered;
            negotiated = handshake_v2(&mut read, &write, &advertised).await?;
        }
        let allowed: Vec<u8> = advertised.iter().map(Extension::id).collect();

        write.write_frame(Packet::new_continue(0, buffer_size)).await?;

        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        let mux = ServerMux {
            buffer_size,
            advertised,
            negotiated,
            write: write.clone(),
            control: control_tx.clone(),
            stream_rx: tokio::sync::Mutex::new(stream_rx),
        };

        let task = Box::pin(run_packet_loop(
            read,
            write,
            streams,
            control_tx,
            control_rx,
            stream_tx,
            buffer_size,
            allowed,
        ));

        Ok(ServerMuxResult(mux, task))
    }

    /// The next stream the client opened, or `None` once the session ends.
    pub async fn wait_for_stream(&self) -> Option<(ConnectPacket, MuxStream<W>)> {
        self.stream_rx.lock().await.recv().await
    }

    /// Ids of the extensions active for this session (the intersection of
    /// both sides' advertisements; empty on version-1 sessions).
    pub fn get_extension_ids(&self) -> Vec<u8> {
        self.negotiated.iter().map(Extension::id).collect()
    }

    /// The extensions negotiated with the client, payloads included.
    pub fn negotiated_extensions(&self) -> &[Extension] {
        &self.negotiated
    }

    /// The extensions this server advertised.
    pub fn advertised_extensions(&self) -> &[Extension] {
        &self.advertised
    }

    /// Credit granted to each stream's client→target buffer.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Ask the packet loop to unwind: all streams are torn down and the
    /// carrier is closed.
    pub async fn close(&self) {
        let _ = self.control.send(ControlEvent::Shutdown);
    }
}

/// Send our INFO, require the client's INFO, and return the negotiated set.
async fn handshake_v2<R, W>(
    read: &mut R,
    write: &LockedWebSocketWrite<W>,
    advertised: &[Extension],
) -> Result<Vec<Extension>, WispError>
where
    R: WebSocketRead,
    W: WebSocketWrite,
{
    let allowed: Vec<u8> = advertised.iter().map(Extension::id).collect();
    write
        .write_frame(Packet::new_info(WispVersion::CURRENT, advertised.to_vec()))
        .await?;

    let frame = match read.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(e),
        None => {
            warn!("carrier closed before the client info arrived");
            return Err(WispError::Handshake(
                "carrier closed before the client info arrived",
            ));
        }
    };

    match Packet::decode(frame, Role::Client, &allowed) {
        Ok(Packet {
            stream_id: 0,
            packet_type: PacketType::Info(info),
        }) => Ok(info.extensions),
        other => {
            warn!("handshake expected a client info packet, got {:?}", other);
            let _ = write
                .write_frame(Packet::new_close(0, CloseReason::ServerStreamInvalidInfo))
                .await;
            let _ = write.close().await;
            Err(WispError::Handshake("expected an info packet from the client"))
        }
    }
}

enum MuxEvent {
    Frame(Result<Bytes, WispError>),
    Control(ControlEvent),
}

#[allow(clippy::too_many_arguments)]
async fn run_packet_loop<R, W>(
    read: R,
    write: LockedWebSocketWrite<W>,
    streams: StreamTable,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    stream_tx: mpsc::UnboundedSender<(ConnectPacket, MuxStream<W>)>,
    buffer_size: u32,
    allowed_extensions: Vec<u8>,
) -> Result<(), WispError>
where
    R: WebSocketRead,
    W: WebSocketWrite,
{
    let frames = read.map(MuxEvent::Frame);
    let control = UnboundedReceiverStream::new(control_rx).map(MuxEvent::Control);
    let mut events = unfair_select(frames, control);

    let mut result = Ok(());
    while let Some(event) = events.next().await {
        match event {
            MuxEvent::Frame(Ok(frame)) => {
                let packet = match Packet::decode(frame, Role::Client, &allowed_extensions) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("dropping malformed packet: {}", e);
                        continue;
                    }
                };
                route_packet(
                    packet,
                    &streams,
                    &write,
                    &control_tx,
                    &stream_tx,
                    buffer_size,
                )
                .await;
            }
            // Carrier failure is fatal to the connection.
            MuxEvent::Frame(Err(e)) => {
                result = Err(e);
                break;
            }
            MuxEvent::Control(ControlEvent::RemoveStream(stream_id)) => {
                streams.lock().remove(&stream_id);
            }
            MuxEvent::Control(ControlEvent::Shutdown) => break,
        }
    }

    // Teardown: dropping the table entries drops every buffer sender, which
    // ends the pumps; their mirrored closes become no-ops.
    let drained: Vec<MuxMapValue> = {
        let mut table = streams.lock();
        table.drain().map(|(_, value)| value).collect()
    };
    for value in &drained {
        value.is_closed.store(true, Ordering::Release);
    }
    drop(drained);
    let _ = write.close().await;

    result
}

async fn route_packet<W: WebSocketWrite>(
    packet: Packet,
    streams: &StreamTable,
    write: &LockedWebSocketWrite<W>,
    control_tx: &mpsc::UnboundedSender<ControlEvent>,
    stream_tx: &mpsc::UnboundedSender<(ConnectPacket, MuxStream<W>)>,
    buffer_size: u32,
) {
    let stream_id = packet.stream_id;
    match packet.packet_type {
        PacketType::Connect(connect) => {
            if stream_id == 0 {
                warn!("connect on the reserved control stream, dropping");
                return;
            }
            let (tx, rx) = mpsc::channel(buffer_size.max(1) as usize);
            let flow = Arc::new(StreamFlow::new(buffer_size));
            let is_closed = Arc::new(AtomicBool::new(false));
            {
                let mut table = streams.lock();
                if table.contains_key(&stream_id) {
                    warn!("connect for already open stream {}, dropping", stream_id);
                    return;
                }
                table.insert(
                    stream_id,
                    MuxMapValue {
                        tx,
                        flow: flow.clone(),
                        is_closed: is_closed.clone(),
                    },
                );
            }
            debug!(
                "stream {} requested: {:?} {}:{}",
                stream_id, connect.stream_type, connect.host, connect.port
            );
            let stream = MuxStream::new(
                stream_id,
                connect.stream_type,
                rx,
                flow,
                is_closed,
                write.clone(),
                control_tx.clone(),
            );
            if stream_tx.send((connect, stream)).is_err() {
                // Nobody is accepting streams anymore; forget the entry.
                streams.lock().remove(&stream_id);
            }
        }
        PacketType::Data(data) => {
            let entry = {
                let table = streams.lock();
                table
                    .get(&stream_id)
                    .map(|value| (value.tx.clone(), value.flow.clone()))
            };
            match entry {
                Some((tx, flow)) => {
                    // Bounded: a full buffer holds the packet loop here until
                    // the pump drains, so depth never exceeds the granted
                    // credit even against a client that ignores CONTINUE.
                    // Counted before the send so the consumer never observes
                    // a chunk it hasn't been charged for.
                    flow.queued.fetch_add(1, Ordering::AcqRel);
                    if tx.send(data).await.is_err() {
                        flow.queued.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                None => debug!("data for unknown stream {}, dropping", stream_id),
            }
        }
        PacketType::Continue(_) => {
            warn!(
                "client sent a continue packet for stream {}, dropping",
                stream_id
            );
        }
        PacketType::Close(reason) => {
            if stream_id == 0 {
                warn!("close for the reserved control stream, dropping");
                return;
            }
            let removed = streams.lock().remove(&stream_id);
            match removed {
                Some(value) => {
                    value.is_closed.store(true, Ordering::Release);
                    debug!("stream {} closed by client: {:?}", stream_id, reason);
                }
                None => debug!("close for unknown stream {}, dropping", stream_id),
            }
        }
        PacketType::Info(_) => {
            warn!("unexpected info packet after session setup, dropping");
        }
    }
}

/// A freshly handshaken session, pending the extension requirement decision.
pub struct ServerMuxResult<W: WebSocketWrite>(ServerMux<W>, MuxTask);

impl<W: WebSocketWrite> ServerMuxResult<W> {
    /// Accept the session whatever was negotiated.
    pub fn with_no_required_extensions(self) -> (ServerMux<W>, MuxTask) {
        (self.0, self.1)
    }

    /// Require `required` extension ids; when any is missing the session is
    /// closed with `ExtensionsIncompatible` and an error is returned.
    pub async fn with_required_extensions(
        self,
        required: &[u8],
    ) -> Result<(ServerMux<W>, MuxTask), WispError> {
        let negotiated = self.0.get_extension_ids();
        if required.iter().all(|id| negotiated.contains(id)) {
            return Ok((self.0, self.1));
        }
        let _ = self
            .0
            .write
            .write_frame(Packet::new_close(0, CloseReason::ExtensionsIncompatible))
            .await;
        let _ = self.0.write.close().await;
        Err(WispError::ExtensionsIncompatible)
    }
}
