//! Server-side multiplexer for the Wisp protocol.
//!
//! Wisp carries many independent TCP and UDP flows over a single ordered,
//! message-oriented carrier (typically a WebSocket). This crate implements the
//! server half of the protocol: packet framing, the version-2 capability
//! handshake, per-stream flow control, and the fan-in/fan-out between the
//! carrier and the per-stream handles.
//!
//! The carrier itself is pluggable: anything that yields inbound binary
//! messages as a [`futures::Stream`] and accepts outbound ones as a
//! [`futures::Sink`] can back a [`ServerMux`]. See the [`ws`] module for the
//! exact seam.

pub mod extension;
mod mux;
pub mod packet;
pub mod stream;
mod unfair_select;
pub mod ws;

pub use mux::{MuxTask, ServerMux, ServerMuxResult};

use thiserror::Error;

/// Which side of the connection produced a payload.
///
/// Extension payloads are shaped differently depending on who sent them, so
/// parsing is always relative to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Errors surfaced by the multiplexer and its codec.
#[derive(Error, Debug)]
pub enum WispError {
    #[error("packet too small ({0} bytes)")]
    PacketTooSmall(usize),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    #[error("malformed extension list: {0}")]
    MalformedExtensions(&'static str),

    #[error("unknown close reason {0:#04x}")]
    InvalidCloseReason(u8),

    #[error("hostname is not valid utf-8")]
    InvalidHostname,

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("required extensions were not negotiated")]
    ExtensionsIncompatible,

    #[error("stream is closed")]
    StreamClosed,

    #[error("multiplexer is closed")]
    MuxClosed,

    #[error("websocket error: {0}")]
    WsImplError(#[source] Box<dyn std::error::Error + Send + Sync>),
}
