//! Wire codec for the relay protocol
//!
//! One KCP message carries exactly one application message; there is no
//! length prefix inside a frame. The first byte is the kind tag, the rest is
//! kind-specific. All multi-byte integers are little-endian in both
//! directions, on the KCP wire and in the HTTP bodies alike.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Transport-assigned connection identifier, private to the server
pub type ConnectionId = u32;

/// Session-scoped participant identifier; the host is always 1
pub type LocalId = u32;

/// Server-allocated session identifier
pub type SessionId = u64;

/// 128-bit single-use capability issued over HTTP, consumed over KCP
pub type Token = Uuid;

/// The host's local id within every session
pub const HOST_LOCAL_ID: LocalId = 1;

/// Tokens travel on the wire as exactly this many raw bytes
pub const TOKEN_LEN: usize = 16;

/// Fixed header of a `Payload` body: recipient (4) + channel (4) + mode (1)
pub const PAYLOAD_HEADER_LEN: usize = 9;

/// Smallest accepted `Payload` body: header plus one opaque byte
pub const MIN_PAYLOAD_LEN: usize = PAYLOAD_HEADER_LEN + 1;

/// Client → server message kind tags
pub mod client_kind {
    pub const AUTH_SESSION: u8 = 0;
    pub const JOIN_SESSION: u8 = 1;
    pub const MODIFY_SESSION: u8 = 2;
    pub const PAYLOAD: u8 = 3;
    pub const DISCONNECT_CLIENT: u8 = 4;
}

/// Server → client message kind tags
pub mod server_kind {
    pub const SERVER_SIDE_DISCONNECTION: u8 = 0;
    pub const CLIENT_DISCONNECTED: u8 = 1;
    pub const CLIENT_CONNECTED: u8 = 2;
    pub const PAYLOAD_RELAY: u8 = 3;
    pub const SUCCESS: u8 = 4;
}

/// Reason byte carried on `ServerSideDisconnection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    UnreliableCommunicationNotAllowed = 0,
    InvalidPayloadLength = 1,
    UnrecognizableMessageHeader = 2,
    InvalidTokenPayloadLength = 3,
    InvalidGodotPayloadLength = 4,
    InvalidDisconnectClientPayloadLength = 5,
    InvalidAuthToken = 6,
    UnAuthorizedAction = 7,
    TimeOut = 8,
    InvalidSessionId = 9,
    SessionFull = 10,
    HostShutdown = 11,
    HostTriggeredDisconnection = 12,
    ServerShutdown = 13,
    ServerSideError = 14,
}

impl DisconnectReason {
    /// Decode a reason byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        use DisconnectReason::*;
        Some(match byte {
            0 => UnreliableCommunicationNotAllowed,
            1 => InvalidPayloadLength,
            2 => UnrecognizableMessageHeader,
            3 => InvalidTokenPayloadLength,
            4 => InvalidGodotPayloadLength,
            5 => InvalidDisconnectClientPayloadLength,
            6 => InvalidAuthToken,
            7 => UnAuthorizedAction,
            8 => TimeOut,
            9 => InvalidSessionId,
            10 => SessionFull,
            11 => HostShutdown,
            12 => HostTriggeredDisconnection,
            13 => ServerShutdown,
            14 => ServerSideError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ---------------------------------------------------------------------------
// Client → server messages
// ---------------------------------------------------------------------------

/// Decoded client → server message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AuthSession(Token),
    JoinSession(Token),
    ModifySession(Token),
    /// Raw `Payload` body (everything after the kind tag)
    Payload(Bytes),
    DisconnectClient(ConnectionId),
}

impl ClientMessage {
    /// Decode one KCP frame. On failure the returned reason is the one the
    /// connection must be closed with.
    pub fn decode(frame: &Bytes) -> std::result::Result<Self, DisconnectReason> {
        if frame.is_empty() {
            return Err(DisconnectReason::InvalidPayloadLength);
        }
        let body = frame.slice(1..);
        match frame[0] {
            client_kind::AUTH_SESSION => Ok(ClientMessage::AuthSession(decode_token(&body)?)),
            client_kind::JOIN_SESSION => Ok(ClientMessage::JoinSession(decode_token(&body)?)),
            client_kind::MODIFY_SESSION => Ok(ClientMessage::ModifySession(decode_token(&body)?)),
            client_kind::PAYLOAD => {
                if body.len() <= 4 {
                    return Err(DisconnectReason::InvalidPayloadLength);
                }
                if body.len() < MIN_PAYLOAD_LEN {
                    return Err(DisconnectReason::InvalidGodotPayloadLength);
                }
                Ok(ClientMessage::Payload(body))
            }
            client_kind::DISCONNECT_CLIENT => {
                if body.len() != 4 {
                    return Err(DisconnectReason::InvalidDisconnectClientPayloadLength);
                }
                let mut buf = body;
                Ok(ClientMessage::DisconnectClient(buf.get_u32_le()))
            }
            _ => Err(DisconnectReason::UnrecognizableMessageHeader),
        }
    }

    /// Encode for sending; the client side of the protocol uses this, the
    /// server only in tests.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ClientMessage::AuthSession(token) => {
                buf.put_u8(client_kind::AUTH_SESSION);
                buf.put_slice(token.as_bytes());
            }
            ClientMessage::JoinSession(token) => {
                buf.put_u8(client_kind::JOIN_SESSION);
                buf.put_slice(token.as_bytes());
            }
            ClientMessage::ModifySession(token) => {
                buf.put_u8(client_kind::MODIFY_SESSION);
                buf.put_slice(token.as_bytes());
            }
            ClientMessage::Payload(body) => {
                buf.put_u8(client_kind::PAYLOAD);
                buf.put_slice(body);
            }
            ClientMessage::DisconnectClient(conn) => {
                buf.put_u8(client_kind::DISCONNECT_CLIENT);
                buf.put_u32_le(*conn);
            }
        }
        buf.freeze()
    }
}

fn decode_token(body: &Bytes) -> std::result::Result<Token, DisconnectReason> {
    if body.len() != TOKEN_LEN {
        return Err(DisconnectReason::InvalidTokenPayloadLength);
    }
    let mut raw = [0u8; TOKEN_LEN];
    raw.copy_from_slice(body);
    Ok(Uuid::from_bytes(raw))
}

/// Build a `Payload` body from its parts; client-side helper and test vector
/// builder.
pub fn encode_payload_body(
    recipient: LocalId,
    transfer_channel: u32,
    transfer_mode: u8,
    data: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_LEN + data.len());
    buf.put_u32_le(recipient);
    buf.put_u32_le(transfer_channel);
    buf.put_u8(transfer_mode);
    buf.put_slice(data);
    buf.freeze()
}

/// Recipient local id of a `Payload` body (bytes 0..4)
pub fn payload_recipient(body: &Bytes) -> LocalId {
    let mut buf = body.slice(0..4);
    buf.get_u32_le()
}

/// Copy a `Payload` body with bytes 0..4 replaced by `sender`, so the
/// receiver learns who the message came from instead of where it was going.
pub fn rewrite_payload_sender(body: &Bytes, sender: LocalId) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len());
    buf.put_u32_le(sender);
    buf.put_slice(&body[4..]);
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Server → client messages
// ---------------------------------------------------------------------------

/// Server → client message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Disconnection(DisconnectReason),
    ClientDisconnected(ConnectionId),
    ClientConnected(ConnectionId, LocalId),
    /// Already-rewritten `Payload` body
    PayloadRelay(Bytes),
    /// `None` acknowledges a modify, `Some(local_id)` an auth or a join
    Success(Option<LocalId>),
}

impl ServerMessage {
    /// Encode into one KCP frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::Disconnection(reason) => {
                buf.put_u8(server_kind::SERVER_SIDE_DISCONNECTION);
                buf.put_u8(*reason as u8);
            }
            ServerMessage::ClientDisconnected(conn) => {
                buf.put_u8(server_kind::CLIENT_DISCONNECTED);
                buf.put_u32_le(*conn);
            }
            ServerMessage::ClientConnected(conn, local) => {
                buf.put_u8(server_kind::CLIENT_CONNECTED);
                buf.put_u32_le(*conn);
                buf.put_u32_le(*local);
            }
            ServerMessage::PayloadRelay(body) => {
                buf.put_u8(server_kind::PAYLOAD_RELAY);
                buf.put_slice(body);
            }
            ServerMessage::Success(local) => {
                buf.put_u8(server_kind::SUCCESS);
                if let Some(local) = local {
                    buf.put_u32_le(*local);
                }
            }
        }
        buf.freeze()
    }

    /// Decode one server frame; used by the peer adapter and by tests
    pub fn decode(frame: &Bytes) -> Option<Self> {
        if frame.is_empty() {
            return None;
        }
        let mut body = frame.slice(1..);
        match frame[0] {
            server_kind::SERVER_SIDE_DISCONNECTION => {
                if body.len() != 1 {
                    return None;
                }
                DisconnectReason::from_byte(body.get_u8()).map(ServerMessage::Disconnection)
            }
            server_kind::CLIENT_DISCONNECTED => {
                if body.len() != 4 {
                    return None;
                }
                Some(ServerMessage::ClientDisconnected(body.get_u32_le()))
            }
            server_kind::CLIENT_CONNECTED => {
                if body.len() != 8 {
                    return None;
                }
                Some(ServerMessage::ClientConnected(
                    body.get_u32_le(),
                    body.get_u32_le(),
                ))
            }
            server_kind::PAYLOAD_RELAY => {
                if body.len() < MIN_PAYLOAD_LEN {
                    return None;
                }
                Some(ServerMessage::PayloadRelay(body))
            }
            // Success body length is 0 or 4, nothing else.
            server_kind::SUCCESS => match body.len() {
                0 => Some(ServerMessage::Success(None)),
                4 => Some(ServerMessage::Success(Some(body.get_u32_le()))),
                _ => None,
            },
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP body shapes
// ---------------------------------------------------------------------------

/// Session name and capacity, as carried by allocate/modify requests
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub name: String,
    pub max_members: u32,
}

impl SessionInfo {
    pub fn new(name: impl Into<String>, max_members: u32) -> Self {
        Self {
            name: name.into(),
            max_members,
        }
    }

    /// Non-empty trimmed name and positive capacity
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.max_members > 0
    }

    /// Layout: `[u16 name_len][name utf-8][u32 max_members]`
    pub fn encode(&self) -> Bytes {
        let name = self.name.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + name.len() + 4);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        buf.put_u32_le(self.max_members);
        buf.freeze()
    }

    /// Decode; `None` on truncation or invalid UTF-8
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return None;
        }
        let name_len = buf.get_u16_le() as usize;
        if buf.remaining() < name_len + 4 {
            return None;
        }
        let name = String::from_utf8(buf[..name_len].to_vec()).ok()?;
        buf.advance(name_len);
        let max_members = buf.get_u32_le();
        if buf.has_remaining() {
            return None;
        }
        Some(Self { name, max_members })
    }
}

/// Listing snapshot of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPreview {
    pub session_id: SessionId,
    pub name: String,
    pub max_members: u32,
    pub current_members: u32,
}

impl SessionPreview {
    fn encode_into(&self, buf: &mut BytesMut) {
        let name = self.name.as_bytes();
        buf.put_u64_le(self.session_id);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        buf.put_u32_le(self.max_members);
        buf.put_u32_le(self.current_members);
    }

    fn decode_from(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < 10 {
            return None;
        }
        let session_id = buf.get_u64_le();
        let name_len = buf.get_u16_le() as usize;
        if buf.remaining() < name_len + 8 {
            return None;
        }
        let name = String::from_utf8(buf[..name_len].to_vec()).ok()?;
        buf.advance(name_len);
        Some(Self {
            session_id,
            name,
            max_members: buf.get_u32_le(),
            current_members: buf.get_u32_le(),
        })
    }
}

/// Layout: `[u32 count]` followed by that many previews
pub fn encode_preview_list(previews: &[SessionPreview]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(previews.len() as u32);
    for preview in previews {
        preview.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Decode a preview listing; `None` on any truncation
pub fn decode_preview_list(data: &[u8]) -> Option<Vec<SessionPreview>> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return None;
    }
    let count = buf.get_u32_le() as usize;
    let mut previews = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        previews.push(SessionPreview::decode_from(&mut buf)?);
    }
    if buf.has_remaining() {
        return None;
    }
    Some(previews)
}

/// HTTP token reply: a capability on success, an error message otherwise.
/// Both travel with HTTP 200; transport-level failures use plain 400.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenReply {
    Token(Token),
    Error(String),
}

impl TokenReply {
    pub fn from_error(message: impl Into<String>) -> Self {
        TokenReply::Error(message.into())
    }

    /// Layout: `[u8 has_value]` then 16 token bytes, or `[u16 err_len][err]`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            TokenReply::Token(token) => {
                buf.put_u8(1);
                buf.put_slice(token.as_bytes());
            }
            TokenReply::Error(message) => {
                let message = message.as_bytes();
                buf.put_u8(0);
                buf.put_u16_le(message.len() as u16);
                buf.put_slice(message);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if buf.remaining() < 1 {
            return None;
        }
        match buf.get_u8() {
            1 => {
                if buf.remaining() != TOKEN_LEN {
                    return None;
                }
                let mut raw = [0u8; TOKEN_LEN];
                raw.copy_from_slice(buf);
                Some(TokenReply::Token(Uuid::from_bytes(raw)))
            }
            0 => {
                if buf.remaining() < 2 {
                    return None;
                }
                let len = buf.get_u16_le() as usize;
                if buf.remaining() != len {
                    return None;
                }
                String::from_utf8(buf.to_vec()).ok().map(TokenReply::Error)
            }
            _ => None,
        }
    }
}

/// Join request body: `[u64 session_id]`
pub fn encode_join_request(session_id: SessionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(session_id);
    buf.freeze()
}

/// Decode a join request; `None` unless exactly eight bytes
pub fn decode_join_request(data: &[u8]) -> Option<SessionId> {
    let mut buf = data;
    if buf.remaining() != 8 {
        return None;
    }
    Some(buf.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn empty_frame_is_invalid_payload_length() {
        assert_eq!(
            ClientMessage::decode(&frame(&[])),
            Err(DisconnectReason::InvalidPayloadLength)
        );
    }

    #[test]
    fn unknown_kind_is_unrecognizable() {
        assert_eq!(
            ClientMessage::decode(&frame(&[9, 1, 2, 3])),
            Err(DisconnectReason::UnrecognizableMessageHeader)
        );
    }

    #[test]
    fn auth_roundtrip() {
        let token = Uuid::new_v4();
        let encoded = ClientMessage::AuthSession(token).encode();
        assert_eq!(encoded.len(), 17);
        assert_eq!(encoded[0], client_kind::AUTH_SESSION);
        assert_eq!(
            ClientMessage::decode(&encoded),
            Ok(ClientMessage::AuthSession(token))
        );
    }

    #[test]
    fn short_token_body_rejected() {
        let mut bytes = vec![client_kind::AUTH_SESSION];
        bytes.extend_from_slice(&[0u8; 15]);
        assert_eq!(
            ClientMessage::decode(&frame(&bytes)),
            Err(DisconnectReason::InvalidTokenPayloadLength)
        );
    }

    #[test]
    fn long_token_body_rejected() {
        let mut bytes = vec![client_kind::JOIN_SESSION];
        bytes.extend_from_slice(&[0u8; 17]);
        assert_eq!(
            ClientMessage::decode(&frame(&bytes)),
            Err(DisconnectReason::InvalidTokenPayloadLength)
        );
    }

    #[test]
    fn tiny_payload_body_rejected() {
        // kind + 4 bytes: cannot even address a recipient plus anything
        assert_eq!(
            ClientMessage::decode(&frame(&[client_kind::PAYLOAD, 1, 0, 0, 0])),
            Err(DisconnectReason::InvalidPayloadLength)
        );
    }

    #[test]
    fn headerless_payload_body_rejected() {
        // 9-byte body carries a header but no opaque data
        let body = encode_payload_body(1, 0, 0, &[]);
        let mut bytes = vec![client_kind::PAYLOAD];
        bytes.extend_from_slice(&body);
        assert_eq!(
            ClientMessage::decode(&frame(&bytes)),
            Err(DisconnectReason::InvalidGodotPayloadLength)
        );
    }

    #[test]
    fn minimal_payload_accepted() {
        let body = encode_payload_body(1, 0, 0, b"x");
        let mut bytes = vec![client_kind::PAYLOAD];
        bytes.extend_from_slice(&body);
        let decoded = ClientMessage::decode(&frame(&bytes)).unwrap();
        assert_eq!(decoded, ClientMessage::Payload(body));
    }

    #[test]
    fn disconnect_client_length_enforced() {
        assert_eq!(
            ClientMessage::decode(&frame(&[client_kind::DISCONNECT_CLIENT, 1, 2, 3])),
            Err(DisconnectReason::InvalidDisconnectClientPayloadLength)
        );
        assert_eq!(
            ClientMessage::decode(&frame(&[client_kind::DISCONNECT_CLIENT, 5, 0, 0, 0])),
            Ok(ClientMessage::DisconnectClient(5))
        );
    }

    #[test]
    fn payload_rewrite_replaces_first_word_only() {
        let body = encode_payload_body(1, 7, 0, b"hi");
        let rewritten = rewrite_payload_sender(&body, 2);
        assert_eq!(payload_recipient(&rewritten), 2);
        assert_eq!(&rewritten[4..], &body[4..]);
        assert_eq!(rewritten.len(), body.len());
    }

    #[test]
    fn server_messages_roundtrip() {
        let samples = [
            ServerMessage::Disconnection(DisconnectReason::HostShutdown),
            ServerMessage::ClientDisconnected(42),
            ServerMessage::ClientConnected(42, 3),
            ServerMessage::PayloadRelay(encode_payload_body(2, 0, 0, b"ok")),
            ServerMessage::Success(None),
            ServerMessage::Success(Some(1)),
        ];
        for message in samples {
            let encoded = message.encode();
            assert_eq!(ServerMessage::decode(&encoded), Some(message));
        }
    }

    #[test]
    fn success_body_length_is_zero_or_four() {
        assert_eq!(
            ServerMessage::Success(None).encode().len(),
            1,
            "empty success is tag only"
        );
        assert_eq!(ServerMessage::Success(Some(1)).encode().len(), 5);
        // A 2-byte body is neither shape.
        assert_eq!(
            ServerMessage::decode(&frame(&[server_kind::SUCCESS, 1, 0])),
            None
        );
    }

    #[test]
    fn every_reason_byte_roundtrips() {
        for byte in 0..=14u8 {
            let reason = DisconnectReason::from_byte(byte).unwrap();
            assert_eq!(reason as u8, byte);
        }
        assert_eq!(DisconnectReason::from_byte(15), None);
    }

    #[test]
    fn session_info_roundtrip() {
        let info = SessionInfo::new("lobby", 4);
        assert_eq!(SessionInfo::decode(&info.encode()), Some(info));
    }

    #[test]
    fn session_info_validation() {
        assert!(SessionInfo::new("lobby", 4).is_valid());
        assert!(!SessionInfo::new("   ", 4).is_valid());
        assert!(!SessionInfo::new("lobby", 0).is_valid());
    }

    #[test]
    fn session_info_rejects_trailing_garbage() {
        let mut bytes = SessionInfo::new("lobby", 4).encode().to_vec();
        bytes.push(0);
        assert_eq!(SessionInfo::decode(&bytes), None);
    }

    #[test]
    fn preview_list_roundtrip() {
        let previews = vec![
            SessionPreview {
                session_id: 1,
                name: "alpha".into(),
                max_members: 4,
                current_members: 2,
            },
            SessionPreview {
                session_id: 9,
                name: "beta".into(),
                max_members: 8,
                current_members: 1,
            },
        ];
        let encoded = encode_preview_list(&previews);
        assert_eq!(decode_preview_list(&encoded), Some(previews));
    }

    #[test]
    fn token_reply_roundtrip() {
        let token = Uuid::new_v4();
        let ok = TokenReply::Token(token);
        assert_eq!(TokenReply::decode(&ok.encode()), Some(ok));

        let err = TokenReply::from_error("session is full");
        assert_eq!(TokenReply::decode(&err.encode()), Some(err));
    }

    #[test]
    fn join_request_is_exactly_eight_bytes() {
        let encoded = encode_join_request(7);
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_join_request(&encoded), Some(7));
        assert_eq!(decode_join_request(&encoded[..7]), None);
    }
}
