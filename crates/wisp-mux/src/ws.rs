//! The carrier seam: traits a transport must implement to back a mux, plus
//! the serialized frame writer shared by everything that sends.
//!
//! The carrier is any ordered, message-oriented channel. Reads are a
//! [`Stream`] of binary messages ending with `None` when the channel closes.
//! Writes go through [`LockedWebSocketWrite`], which guarantees at most one
//! message is in flight at a time and applies watermark backpressure against
//! the transport's buffered-byte count.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream};
use tokio::sync::Mutex;

use crate::packet::Packet;
use crate::WispError;

/// Read half of the carrier.
pub trait WebSocketRead: Stream<Item = Result<Bytes, WispError>> + Send + Unpin {}

impl<T> WebSocketRead for T where T: Stream<Item = Result<Bytes, WispError>> + Send + Unpin {}

/// Write half of the carrier.
///
/// `buffered_amount` reports bytes the transport has accepted but not yet
/// put on the wire; transports with no visibility into their queue may leave
/// the default, which disables watermark throttling.
pub trait WebSocketWrite: Sink<Bytes, Error = WispError> + Send + Unpin + 'static {
    fn buffered_amount(&self) -> usize {
        0
    }
}

/// High/low buffered-byte thresholds for carrier backpressure.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub fn new(high: usize) -> Self {
        Self { high, low: high / 2 }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

/// Interval between buffered-amount checks while above the high watermark.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Single pause taken when buffered bytes sit between the watermarks.
const SEND_TICK: Duration = Duration::from_millis(10);

/// A carrier write half shared between the packet loop and every stream.
///
/// The mutex serializes senders so message boundaries are preserved no matter
/// how many pumps write concurrently.
pub struct LockedWebSocketWrite<W: WebSocketWrite> {
    inner: Arc<Mutex<W>>,
    watermarks: Watermarks,
}

impl<W: WebSocketWrite> Clone for LockedWebSocketWrite<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            watermarks: self.watermarks,
        }
    }
}

impl<W: WebSocketWrite> LockedWebSocketWrite<W> {
    pub fn new(write: W) -> Self {
        Self::with_watermarks(write, Watermarks::default())
    }

    pub fn with_watermarks(write: W, watermarks: Watermarks) -> Self {
        Self {
            inner: Arc::new(Mutex::new(write)),
            watermarks,
        }
    }

    /// Encode and send one packet, then throttle against the watermarks.
    pub async fn write_frame(&self, packet: Packet) -> Result<(), WispError> {
        let payload = packet.encode();
        {
            let mut write = self.inner.lock().await;
            write.send(payload).await?;
        }
        self.wait_for_drain().await;
        Ok(())
    }

    async fn wait_for_drain(&self) {
        let buffered = self.inner.lock().await.buffered_amount();
        if buffered > self.watermarks.high {
            loop {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                if self.inner.lock().await.buffered_amount() <= self.watermarks.low {
                    break;
                }
            }
        } else if buffered > self.watermarks.low {
            tokio::time::sleep(SEND_TICK).await;
        }
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<(), WispError> {
        self.inner.lock().await.close().await
    }
}
