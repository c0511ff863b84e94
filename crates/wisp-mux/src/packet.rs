//! Packet framing and serialization.
//!
//! Every packet is a one-byte type, a u32-LE stream id, and a type-specific
//! payload. All multi-byte integers on the wire are little-endian. Stream id 0
//! is reserved for connection-level control (the initial CONTINUE and the
//! INFO exchange).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::extension::{encode_extension_list, parse_extension_list, Extension};
use crate::{Role, WispError};

/// Minimum encoded size of any packet: type byte plus stream id.
pub const PACKET_HEADER_SIZE: usize = 5;

const TYPE_CONNECT: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;
const TYPE_CONTINUE: u8 = 0x03;
const TYPE_CLOSE: u8 = 0x04;
const TYPE_INFO: u8 = 0x05;

/// The kind of destination flow a CONNECT requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Tcp,
    Udp,
    /// A kind byte this crate does not know. Preserved so callers can reject
    /// it with the close reason of their choice.
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => StreamType::Tcp,
            0x02 => StreamType::Udp,
            other => StreamType::Other(other),
        }
    }
}

impl From<StreamType> for u8 {
    fn from(value: StreamType) -> Self {
        match value {
            StreamType::Tcp => 0x01,
            StreamType::Udp => 0x02,
            StreamType::Other(other) => other,
        }
    }
}

/// One-byte reason carried by a CLOSE packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unknown = 0x01,
    /// Graceful end of the flow.
    Voluntary = 0x02,
    /// Network error or unexpected failure on the flow.
    Unexpected = 0x03,
    /// Required extensions were not negotiated.
    ExtensionsIncompatible = 0x04,
    ServerStreamInvalidInfo = 0x41,
    ServerStreamUnreachable = 0x42,
    ServerStreamConnectionTimedOut = 0x43,
    ServerStreamConnectionRefused = 0x44,
    ServerStreamTransferTimedOut = 0x47,
    ServerStreamBlockedAddress = 0x48,
    ServerStreamThrottled = 0x49,
    ClientUnexpected = 0x81,
    AuthWrongPassword = 0xC0,
    AuthBadSignature = 0xC1,
    AuthMissingCredentials = 0xC2,
}

impl TryFrom<u8> for CloseReason {
    type Error = WispError;

    fn try_from(value: u8) -> Result<Self, WispError> {
        match value {
            0x01 => Ok(CloseReason::Unknown),
            0x02 => Ok(CloseReason::Voluntary),
            0x03 => Ok(CloseReason::Unexpected),
            0x04 => Ok(CloseReason::ExtensionsIncompatible),
            0x41 => Ok(CloseReason::ServerStreamInvalidInfo),
            0x42 => Ok(CloseReason::ServerStreamUnreachable),
            0x43 => Ok(CloseReason::ServerStreamConnectionTimedOut),
            0x44 => Ok(CloseReason::ServerStreamConnectionRefused),
            0x47 => Ok(CloseReason::ServerStreamTransferTimedOut),
            0x48 => Ok(CloseReason::ServerStreamBlockedAddress),
            0x49 => Ok(CloseReason::ServerStreamThrottled),
            0x81 => Ok(CloseReason::ClientUnexpected),
            0xC0 => Ok(CloseReason::AuthWrongPassword),
            0xC1 => Ok(CloseReason::AuthBadSignature),
            0xC2 => Ok(CloseReason::AuthMissingCredentials),
            other => Err(WispError::InvalidCloseReason(other)),
        }
    }
}

/// Protocol version advertised in an INFO packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WispVersion {
    pub major: u8,
    pub minor: u8,
}

impl WispVersion {
    /// The version this crate speaks when the v2 handshake is enabled.
    pub const CURRENT: WispVersion = WispVersion { major: 2, minor: 0 };
}

/// Payload of a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub stream_type: StreamType,
    pub host: String,
    pub port: u16,
}

/// Payload of an INFO packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPacket {
    pub version: WispVersion,
    pub extensions: Vec<Extension>,
}

/// A packet's type tag together with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketType {
    Connect(ConnectPacket),
    Data(Bytes),
    Continue(u32),
    Close(CloseReason),
    Info(InfoPacket),
}

impl PacketType {
    fn type_byte(&self) -> u8 {
        match self {
            PacketType::Connect(_) => TYPE_CONNECT,
            PacketType::Data(_) => TYPE_DATA,
            PacketType::Continue(_) => TYPE_CONTINUE,
            PacketType::Close(_) => TYPE_CLOSE,
            PacketType::Info(_) => TYPE_INFO,
        }
    }
}

/// A complete Wisp packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: u32,
    pub packet_type: PacketType,
}

impl Packet {
    pub fn new_connect(stream_id: u32, connect: ConnectPacket) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Connect(connect),
        }
    }

    pub fn new_data(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Data(data),
        }
    }

    pub fn new_continue(stream_id: u32, buffer_remaining: u32) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Continue(buffer_remaining),
        }
    }

    pub fn new_close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Close(reason),
        }
    }

    pub fn new_info(version: WispVersion, extensions: Vec<Extension>) -> Self {
        Self {
            stream_id: 0,
            packet_type: PacketType::Info(InfoPacket {
                version,
                extensions,
            }),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        buf.put_u8(self.packet_type.type_byte());
        buf.put_u32_le(self.stream_id);

        match &self.packet_type {
            PacketType::Connect(connect) => {
                buf.put_u8(connect.stream_type.into());
                buf.put_u16_le(connect.port);
                buf.put_slice(connect.host.as_bytes());
            }
            PacketType::Data(data) => buf.put_slice(data),
            PacketType::Continue(remaining) => buf.put_u32_le(*remaining),
            PacketType::Close(reason) => buf.put_u8(*reason as u8),
            PacketType::Info(info) => {
                buf.put_u8(info.version.major);
                buf.put_u8(info.version.minor);
                buf.put_slice(&encode_extension_list(&info.extensions));
            }
        }

        buf.freeze()
    }

    /// Parse a packet from a carrier message.
    ///
    /// `role` is the side that sent the message; `allowed_extensions` is the
    /// id allow-list applied when the packet carries an extension list.
    pub fn decode(
        mut data: Bytes,
        role: Role,
        allowed_extensions: &[u8],
    ) -> Result<Self, WispError> {
        if data.remaining() < PACKET_HEADER_SIZE {
            return Err(WispError::PacketTooSmall(data.remaining()));
        }
        let type_byte = data.get_u8();
        let stream_id = data.get_u32_le();

        let packet_type = match type_byte {
            TYPE_CONNECT => {
                if data.remaining() < 3 {
                    return Err(WispError::MalformedPacket("truncated connect payload"));
                }
                let stream_type = StreamType::from(data.get_u8());
                let port = data.get_u16_le();
                let host = String::from_utf8(data.to_vec())
                    .map_err(|_| WispError::InvalidHostname)?;
                PacketType::Connect(ConnectPacket {
                    stream_type,
                    host,
                    port,
                })
            }
            TYPE_DATA => PacketType::Data(data),
            TYPE_CONTINUE => {
                if data.remaining() < 4 {
                    return Err(WispError::MalformedPacket("truncated continue payload"));
                }
                PacketType::Continue(data.get_u32_le())
            }
            TYPE_CLOSE => {
                if data.remaining() < 1 {
                    return Err(WispError::MalformedPacket("truncated close payload"));
                }
                PacketType::Close(CloseReason::try_from(data.get_u8())?)
            }
            TYPE_INFO => {
                if data.remaining() < 2 {
                    return Err(WispError::MalformedPacket("truncated info payload"));
                }
                let version = WispVersion {
                    major: data.get_u8(),
                    minor: data.get_u8(),
                };
                let extensions = parse_extension_list(data, allowed_extensions, role)?;
                PacketType::Info(InfoPacket {
                    version,
                    extensions,
                })
            }
            other => return Err(WispError::UnknownPacketType(other)),
        };

        Ok(Packet {
            stream_id,
            packet_type,
        })
    }
}
