//! Per-stream handles returned by [`ServerMux::wait_for_stream`].
//!
//! A [`MuxStream`] is one multiplexed flow. Its read half drains the bounded
//! client→target buffer and issues CONTINUE credit back to the client; its
//! write half frames chunks into DATA packets on the carrier. The close
//! handle tears the stream down exactly once from either pump.
//!
//! [`ServerMux::wait_for_stream`]: crate::ServerMux::wait_for_stream

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::mux::ControlEvent;
use crate::packet::{CloseReason, Packet, StreamType};
use crate::ws::{LockedWebSocketWrite, WebSocketWrite};
use crate::WispError;

/// Flow-control accounting shared between the packet loop (producer) and the
/// stream's read half (consumer).
pub(crate) struct StreamFlow {
    /// Chunks currently sitting in the client→target buffer.
    pub(crate) queued: AtomicU32,
    /// Total credit granted to the client for this stream.
    pub(crate) capacity: u32,
}

impl StreamFlow {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            queued: AtomicU32::new(0),
            capacity,
        }
    }

    fn remaining(&self) -> u32 {
        self.capacity
            .saturating_sub(self.queued.load(Ordering::Acquire))
    }
}

/// Read half: the in-order sequence of client→target chunks.
pub struct MuxStreamRead<W: WebSocketWrite> {
    stream_id: u32,
    rx: mpsc::Receiver<Bytes>,
    flow: Arc<StreamFlow>,
    reads_since_continue: u32,
    continue_due: bool,
    write: LockedWebSocketWrite<W>,
    is_closed: Arc<AtomicBool>,
}

impl<W: WebSocketWrite> MuxStreamRead<W> {
    /// Next chunk from the client, or `None` once the stream is closed and
    /// the buffer is drained.
    ///
    /// Every half-capacity chunks drained, a CONTINUE is sent reporting the
    /// credit the client has left (`capacity − current depth`). The send is
    /// deferred to the front of the following call so this future can be
    /// dropped at any await point (e.g. from a `select!` pump) without losing
    /// a chunk.
    pub async fn read(&mut self) -> Option<Bytes> {
        if self.continue_due {
            let packet = Packet::new_continue(self.stream_id, self.flow.remaining());
            // A carrier failure here also fails the pumps; nothing to do.
            let _ = self.write.write_frame(packet).await;
            self.continue_due = false;
        }

        let data = self.rx.recv().await?;
        self.flow.queued.fetch_sub(1, Ordering::AcqRel);

        self.reads_since_continue += 1;
        let threshold = (self.flow.capacity / 2).max(1);
        if self.reads_since_continue >= threshold {
            self.reads_since_continue = 0;
            if !self.is_closed.load(Ordering::Acquire) {
                self.continue_due = true;
            }
        }

        Some(data)
    }
}

/// Write half: frames target→client chunks into DATA packets.
pub struct MuxStreamWrite<W: WebSocketWrite> {
    stream_id: u32,
    write: LockedWebSocketWrite<W>,
    is_closed: Arc<AtomicBool>,
}

impl<W: WebSocketWrite> MuxStreamWrite<W> {
    pub async fn write(&self, data: Bytes) -> Result<(), WispError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(WispError::StreamClosed);
        }
        self.write
            .write_frame(Packet::new_data(self.stream_id, data))
            .await
    }
}

/// Idempotent teardown handle for one stream.
pub struct MuxStreamCloser<W: WebSocketWrite> {
    stream_id: u32,
    write: LockedWebSocketWrite<W>,
    is_closed: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl<W: WebSocketWrite> Clone for MuxStreamCloser<W> {
    fn clone(&self) -> Self {
        Self {
            stream_id: self.stream_id,
            write: self.write.clone(),
            is_closed: self.is_closed.clone(),
            control: self.control.clone(),
        }
    }
}

impl<W: WebSocketWrite> MuxStreamCloser<W> {
    /// Close the stream with `reason`.
    ///
    /// The first close wins: it removes the stream from the connection's
    /// table (ending the client→target buffer, which releases the pump) and
    /// emits a CLOSE packet. Later calls are no-ops, so a close mirrored from
    /// the client never sends a CLOSE back.
    pub async fn close(&self, reason: CloseReason) -> Result<(), WispError> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self
            .control
            .send(ControlEvent::RemoveStream(self.stream_id));
        self.write
            .write_frame(Packet::new_close(self.stream_id, reason))
            .await
    }
}

/// One multiplexed end-to-end flow between the client and a destination.
pub struct MuxStream<W: WebSocketWrite> {
    stream_id: u32,
    stream_type: StreamType,
    read: MuxStreamRead<W>,
    write: MuxStreamWrite<W>,
    closer: MuxStreamCloser<W>,
}

impl<W: WebSocketWrite> MuxStream<W> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_id: u32,
        stream_type: StreamType,
        rx: mpsc::Receiver<Bytes>,
        flow: Arc<StreamFlow>,
        is_closed: Arc<AtomicBool>,
        write: LockedWebSocketWrite<W>,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            stream_id,
            stream_type,
            read: MuxStreamRead {
                stream_id,
                rx,
                flow,
                reads_since_continue: 0,
                continue_due: false,
                write: write.clone(),
                is_closed: is_closed.clone(),
            },
            write: MuxStreamWrite {
                stream_id,
                write: write.clone(),
                is_closed: is_closed.clone(),
            },
            closer: MuxStreamCloser {
                stream_id,
                write,
                is_closed,
                control,
            },
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// See [`MuxStreamRead::read`].
    pub async fn read(&mut self) -> Option<Bytes> {
        self.read.read().await
    }

    /// See [`MuxStreamWrite::write`].
    pub async fn write(&self, data: Bytes) -> Result<(), WispError> {
        self.write.write(data).await
    }

    /// A close handle usable after the stream is split or moved into a pump.
    pub fn get_close_handle(&self) -> MuxStreamCloser<W> {
        self.closer.clone()
    }

    /// Close this stream with `reason`. See [`MuxStreamCloser::close`].
    pub async fn close(&self, reason: CloseReason) -> Result<(), WispError> {
        self.closer.close(reason).await
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (MuxStreamRead<W>, MuxStreamWrite<W>) {
        (self.read, self.write)
    }
}
