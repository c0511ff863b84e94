//! Capability records negotiated during the version-2 handshake.
//!
//! Each record on the wire is a one-byte id, a u32-LE payload length, and the
//! payload itself. Both sides advertise a list inside their INFO packet and
//! only the intersection is active for the session. Payload shapes depend on
//! the sender's [`Role`]: the MOTD payload, for example, is a UTF-8 message
//! when the server sends it and empty when the client does.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Role, WispError};

/// Extension id advertising UDP stream support.
pub const UDP_EXTENSION_ID: u8 = 0x01;
/// Extension id carrying the server's message of the day.
pub const MOTD_EXTENSION_ID: u8 = 0x04;

/// A parsed extension record.
///
/// Known extensions get their own variant; anything the caller allowed but
/// this crate has no parser for is preserved as [`Extension::Opaque`] so the
/// bytes survive re-serialization. Ids outside the caller's allow-list are
/// skipped entirely during parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// UDP streams may be opened on this session. Empty payload from both
    /// roles.
    Udp,
    /// Message of the day. The server's payload is the message itself; the
    /// client advertises the id with an empty payload.
    Motd { message: Option<String> },
    /// An allowed extension with no registered parser.
    Opaque { id: u8, payload: Bytes },
}

type ExtensionParser = fn(Bytes, Role) -> Result<Extension, WispError>;

/// Registry of payload parsers, indexed by extension id.
const REGISTRY: &[(u8, ExtensionParser)] = &[
    (UDP_EXTENSION_ID, parse_udp),
    (MOTD_EXTENSION_ID, parse_motd),
];

fn parse_udp(_payload: Bytes, _role: Role) -> Result<Extension, WispError> {
    Ok(Extension::Udp)
}

fn parse_motd(payload: Bytes, role: Role) -> Result<Extension, WispError> {
    match role {
        Role::Server => {
            let message = String::from_utf8(payload.to_vec())
                .map_err(|_| WispError::MalformedExtensions("motd is not valid utf-8"))?;
            Ok(Extension::Motd {
                message: Some(message),
            })
        }
        Role::Client => Ok(Extension::Motd { message: None }),
    }
}

impl Extension {
    /// The wire id of this extension.
    pub fn id(&self) -> u8 {
        match self {
            Extension::Udp => UDP_EXTENSION_ID,
            Extension::Motd { .. } => MOTD_EXTENSION_ID,
            Extension::Opaque { id, .. } => *id,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            Extension::Udp => Bytes::new(),
            Extension::Motd { message } => message
                .as_ref()
                .map(|m| Bytes::copy_from_slice(m.as_bytes()))
                .unwrap_or_default(),
            Extension::Opaque { payload, .. } => payload.clone(),
        }
    }

    /// Append this record (id, length, payload) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let payload = self.payload();
        buf.put_u8(self.id());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }
}

/// Serialize a whole extension list.
pub fn encode_extension_list(extensions: &[Extension]) -> Bytes {
    let mut buf = BytesMut::new();
    for extension in extensions {
        extension.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Parse an extension list, keeping only ids present in `allowed`.
///
/// Unknown-to-the-caller ids are skipped but their declared length is still
/// consumed. A record whose length overruns the remaining buffer fails the
/// whole list.
pub fn parse_extension_list(
    mut data: Bytes,
    allowed: &[u8],
    role: Role,
) -> Result<Vec<Extension>, WispError> {
    let mut extensions = Vec::new();

    while data.has_remaining() {
        if data.remaining() < 5 {
            return Err(WispError::MalformedExtensions("truncated record header"));
        }
        let id = data.get_u8();
        let length = data.get_u32_le() as usize;
        if length > data.remaining() {
            return Err(WispError::MalformedExtensions(
                "length exceeds remaining buffer",
            ));
        }
        let payload = data.split_to(length);

        if !allowed.contains(&id) {
            continue;
        }
        match REGISTRY.iter().find(|(known, _)| *known == id) {
            Some((_, parse)) => extensions.push(parse(payload, role)?),
            None => extensions.push(Extension::Opaque { id, payload }),
        }
    }

    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_extensions() {
        let extensions = vec![
            Extension::Udp,
            Extension::Motd {
                message: Some("hi".to_string()),
            },
        ];

        let encoded = encode_extension_list(&extensions);
        let decoded = parse_extension_list(
            encoded,
            &[UDP_EXTENSION_ID, MOTD_EXTENSION_ID],
            Role::Server,
        )
        .unwrap();

        assert_eq!(decoded, extensions);
    }

    #[test]
    fn test_client_motd_payload_is_empty() {
        let encoded = encode_extension_list(&[Extension::Motd { message: None }]);
        let decoded = parse_extension_list(encoded, &[MOTD_EXTENSION_ID], Role::Client).unwrap();

        assert_eq!(decoded, vec![Extension::Motd { message: None }]);
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_u32_le(3);
        buf.put_slice(b"xyz");
        Extension::Udp.encode_into(&mut buf);

        let decoded =
            parse_extension_list(buf.freeze(), &[UDP_EXTENSION_ID], Role::Client).unwrap();
        assert_eq!(decoded, vec![Extension::Udp]);
    }

    #[test]
    fn test_allowed_but_unregistered_id_is_preserved() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_u32_le(2);
        buf.put_slice(b"ab");

        let decoded = parse_extension_list(buf.freeze(), &[0x7f], Role::Client).unwrap();
        assert_eq!(
            decoded,
            vec![Extension::Opaque {
                id: 0x7f,
                payload: Bytes::from_static(b"ab"),
            }]
        );
    }

    #[test]
    fn test_overlong_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(UDP_EXTENSION_ID);
        buf.put_u32_le(10);
        buf.put_slice(b"ab");

        let result = parse_extension_list(buf.freeze(), &[UDP_EXTENSION_ID], Role::Client);
        assert!(matches!(result, Err(WispError::MalformedExtensions(_))));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let buf = Bytes::from_static(&[UDP_EXTENSION_ID, 0x00]);
        let result = parse_extension_list(buf, &[UDP_EXTENSION_ID], Role::Client);
        assert!(matches!(result, Err(WispError::MalformedExtensions(_))));
    }
}
