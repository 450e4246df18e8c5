//! Message numbers and the generic transport messages.
//!
//! The first payload byte selects the message. Numbers are grouped by the
//! layer that owns them (RFC 4251 Section 7):
//!
//! | Range   | Owner                                  |
//! |---------|----------------------------------------|
//! | 1-19    | transport (disconnect, ignore, debug)  |
//! | 20-29   | algorithm negotiation                  |
//! | 30-49   | key exchange method                    |
//! | 50-79   | user authentication                    |
//! | 80-127  | connection protocol                    |
//! | 128-255 | reserved for clients and local extensions |
//!
//! Disconnect, ignore, debug, unimplemented and the service request/accept
//! pair are decoded and encoded here.
//!
//! ```rust
//! use kestrel_proto::ssh::message::{MessageRange, MessageType};
//!
//! assert_eq!(MessageType::ChannelData as u8, 94);
//! assert_eq!(MessageRange::of(94), MessageRange::Connection);
//! ```

use super::wire::{SshReader, SshWrite};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};

/// Message numbers understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// KEXDH_INIT / KEX_ECDH_INIT; the DH groups and Curve25519 share it.
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use same message number).
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK (server accepts public key for authentication).
    ///
    /// Shares id 60 with `SSH_MSG_USERAUTH_PASSWD_CHANGEREQ`; the method in
    /// flight decides which one is meant.
    UserauthPkOk = 60,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Looks up a message number. Numbers this server never handles give
    /// `None` and are answered with `SSH_MSG_UNIMPLEMENTED`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// RFC constant name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

/// Protocol layer that owns a range of message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRange {
    /// 1-49: transport layer, handled by the session itself
    Transport,
    /// 50-79: user authentication protocol
    UserAuth,
    /// 80-127: connection protocol
    Connection,
    /// 128-255: local extensions, never registered by this server
    Extension,
    /// 0
    Reserved,
}

impl MessageRange {
    /// Classifies a raw message id.
    pub fn of(id: u8) -> Self {
        match id {
            0 => MessageRange::Reserved,
            1..=49 => MessageRange::Transport,
            50..=79 => MessageRange::UserAuth,
            80..=127 => MessageRange::Connection,
            _ => MessageRange::Extension,
        }
    }
}

/// Name used for message id 60 while a password change is pending.
pub const USERAUTH_PASSWD_CHANGEREQ_NAME: &str = "SSH_MSG_USERAUTH_PASSWD_CHANGEREQ";

/// SSH_MSG_DISCONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: DisconnectReason,
    /// Human readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason.code());
        buf.put_str(&self.description);
        buf.put_str("");
        buf.to_vec()
    }

    /// Parses from payload bytes.
    ///
    /// Unknown reason codes are reported as `ProtocolError`.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::Disconnect)?;
        let code = reader.read_u32()?;
        let description = String::from_utf8_lossy(reader.read_string()?).into_owned();
        Ok(Self {
            reason: DisconnectReason::from_u32(code).unwrap_or(DisconnectReason::ProtocolError),
            description,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet
    pub sequence: u32,
}

impl Unimplemented {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(MessageType::Unimplemented as u8);
        buf.put_u32(self.sequence);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::Unimplemented)?;
        Ok(Self {
            sequence: reader.read_u32()?,
        })
    }
}

/// SSH_MSG_DEBUG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::Debug)?;
        let always_display = reader.read_bool()?;
        let message = String::from_utf8_lossy(reader.read_string()?).into_owned();
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// SSH_MSG_SERVICE_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service, e.g. `ssh-userauth`
    pub service_name: String,
}

impl ServiceRequest {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        service_message(MessageType::ServiceRequest, &self.service_name)
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::ServiceRequest)?;
        Ok(Self {
            service_name: reader.read_utf8()?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service
    pub service_name: String,
}

impl ServiceAccept {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        service_message(MessageType::ServiceAccept, &self.service_name)
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::ServiceAccept)?;
        Ok(Self {
            service_name: reader.read_utf8()?,
        })
    }
}

fn service_message(msg_type: MessageType, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(msg_type as u8);
    buf.put_str(name);
    buf.to_vec()
}

/// Consumes the message id byte and checks it.
pub(crate) fn expect_type(reader: &mut SshReader<'_>, expected: MessageType) -> KestrelResult<()> {
    let id = reader.read_u8()?;
    if id != expected as u8 {
        return Err(KestrelError::Protocol(format!(
            "Expected {}, got message type {}",
            expected, id
        )));
    }
    Ok(())
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_numbers_round_trip() {
        for n in 0..=255u8 {
            if let Some(t) = MessageType::from_u8(n) {
                assert_eq!(t as u8, n);
            }
        }
        assert_eq!(MessageType::from_u8(200), None);
        assert_eq!(MessageType::from_u8(0), None);
    }

    #[test]
    fn test_log_names() {
        assert_eq!(MessageType::UserauthRequest.name(), "SSH_MSG_USERAUTH_REQUEST");
        assert_eq!(MessageType::ChannelWindowAdjust.to_string(), "SSH_MSG_CHANNEL_WINDOW_ADJUST(93)");
    }

    #[test]
    fn test_message_range() {
        assert_eq!(MessageRange::of(0), MessageRange::Reserved);
        assert_eq!(MessageRange::of(20), MessageRange::Transport);
        assert_eq!(MessageRange::of(49), MessageRange::Transport);
        assert_eq!(MessageRange::of(50), MessageRange::UserAuth);
        assert_eq!(MessageRange::of(60), MessageRange::UserAuth);
        assert_eq!(MessageRange::of(94), MessageRange::Connection);
        assert_eq!(MessageRange::of(200), MessageRange::Extension);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = Disconnect::new(DisconnectReason::MacError, "bad mac");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unimplemented_carries_sequence() {
        let bytes = Unimplemented { sequence: 7 }.to_bytes();
        assert_eq!(bytes, vec![3, 0, 0, 0, 7]);
    }

    #[test]
    fn test_service_request_wrong_type() {
        let bytes = ServiceAccept {
            service_name: "ssh-userauth".into(),
        }
        .to_bytes();
        assert!(ServiceRequest::from_bytes(&bytes).is_err());
        assert_eq!(
            ServiceAccept::from_bytes(&bytes).unwrap().service_name,
            "ssh-userauth"
        );
    }
}
