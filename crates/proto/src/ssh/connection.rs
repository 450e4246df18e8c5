//! SSH connection protocol messages (RFC 4254).
//!
//! This module defines the wire messages of the connection layer:
//! - Global requests and their replies
//! - Channel open, confirmation and failure
//! - Channel data, extended data, window adjust, EOF and close
//! - Channel requests: pty-req, env, shell, exec, subsystem,
//!   window-change, signal, exit-status, exit-signal
//!
//! The state that ties these together lives in [`crate::ssh::channel`] and
//! [`crate::ssh::connection_mgr`].
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 1048576, 32768);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.channel_type().name(), "session");
//! ```

use super::message::{expect_type, MessageType};
use super::wire::{SshReader, SshWrite};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// `data_type_code` for stderr in SSH_MSG_CHANNEL_EXTENDED_DATA.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Target and originator of a `direct-tcpip` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u32,
    /// Originator IP address
    pub originator_address: String,
    /// Originator port
    pub originator_port: u32,
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (client side port forwarding).
    DirectTcpip(ForwardTarget),
    /// Any other type; `data` holds the type specific fields.
    Other {
        /// Channel type name
        name: String,
        /// Type specific data
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip(_) => "direct-tcpip",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes the message to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data follows
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_str(self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip(target) => {
                buf.put_str(&target.host);
                buf.put_u32(target.port);
                buf.put_str(&target.originator_address);
                buf.put_u32(target.originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Self::parse(&mut SshReader::new(data))
    }

    /// Parses the message with a custom field ceiling.
    pub fn parse(reader: &mut SshReader<'_>) -> KestrelResult<Self> {
        expect_type(reader, MessageType::ChannelOpen)?;
        let type_name = reader.read_utf8()?;
        let sender_channel = reader.read_u32()?;
        let initial_window_size = reader.read_u32()?;
        let maximum_packet_size = reader.read_u32()?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip(ForwardTarget {
                host: reader.read_utf8()?,
                port: reader.read_u32()?,
                originator_address: reader.read_utf8()?,
                originator_port: reader.read_u32()?,
            }),
            _ => ChannelType::Other {
                name: type_name,
                data: reader.rest().to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            sender_channel: reader.read_u32()?,
            initial_window_size: reader.read_u32()?,
            maximum_packet_size: reader.read_u32()?,
        })
    }
}

/// Reason codes for SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts a wire value to a reason code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Default description for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: ChannelOpenFailureReason,
    description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason_code: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: reason_code.as_str().to_string(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the reason code.
    pub fn reason_code(&self) -> ChannelOpenFailureReason {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code as u32);
        buf.put_str(&self.description);
        buf.put_str("");
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::ChannelOpenFailure)?;
        let recipient_channel = reader.read_u32()?;
        let code = reader.read_u32()?;
        let reason_code = ChannelOpenFailureReason::from_u32(code).ok_or_else(|| {
            KestrelError::Protocol(format!("Unknown channel open failure reason {}", code))
        })?;
        let description = reader.read_utf8()?;
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the number of bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            bytes_to_add: reader.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_string(&self.data);
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Self::parse(&mut SshReader::new(data))
    }

    /// Parses the message from a configured reader.
    pub fn parse(reader: &mut SshReader<'_>) -> KestrelResult<Self> {
        expect_type(reader, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            data: reader.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code ([`EXTENDED_DATA_STDERR`] for stderr).
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        buf.put_string(&self.data);
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Self::parse(&mut SshReader::new(data))
    }

    /// Parses the message from a configured reader.
    pub fn parse(reader: &mut SshReader<'_>) -> KestrelResult<Self> {
        expect_type(reader, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: reader.read_u32()?,
            data_type_code: reader.read_u32()?,
            data: reader.read_string()?.to_vec(),
        })
    }
}

fn recipient_only(msg_type: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(msg_type as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

fn parse_recipient_only(data: &[u8], msg_type: MessageType) -> KestrelResult<u32> {
    let mut reader = SshReader::new(data);
    expect_type(&mut reader, msg_type)?;
    reader.read_u32()
}

/// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    recipient_channel: u32,
}

impl ChannelEof {
    /// Creates a new EOF message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        recipient_only(MessageType::ChannelEof, self.recipient_channel)
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Ok(Self::new(parse_recipient_only(data, MessageType::ChannelEof)?))
    }
}

/// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    recipient_channel: u32,
}

impl ChannelClose {
    /// Creates a new close message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        recipient_only(MessageType::ChannelClose, self.recipient_channel)
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Ok(Self::new(parse_recipient_only(data, MessageType::ChannelClose)?))
    }
}

/// Pseudo-terminal parameters of a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type (e.g., "xterm")
    pub term: String,
    /// Terminal width in characters
    pub width_chars: u32,
    /// Terminal height in rows
    pub height_rows: u32,
    /// Terminal width in pixels
    pub width_pixels: u32,
    /// Terminal height in pixels
    pub height_pixels: u32,
    /// Encoded terminal modes
    pub modes: Vec<u8>,
}

/// Terminal dimensions carried by `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Width in characters
    pub width_chars: u32,
    /// Height in rows
    pub height_rows: u32,
    /// Width in pixels
    pub width_pixels: u32,
    /// Height in pixels
    pub height_pixels: u32,
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq(PtyRequest),
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size changed
    WindowChange(TerminalSize),
    /// Deliver a signal
    Signal {
        /// Signal name without the "SIG" prefix
        name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Any request this server does not interpret
    Other {
        /// Request name
        name: String,
        /// Request specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq(_) => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange(_) => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_str(self.request_type.name());
        buf.put_bool(self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq(pty) => {
                buf.put_str(&pty.term);
                buf.put_u32(pty.width_chars);
                buf.put_u32(pty.height_rows);
                buf.put_u32(pty.width_pixels);
                buf.put_u32(pty.height_pixels);
                buf.put_string(&pty.modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_str(name);
                buf.put_str(value);
            }
            ChannelRequestType::Exec { command } => buf.put_str(command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => buf.put_str(name),
            ChannelRequestType::WindowChange(size) => {
                buf.put_u32(size.width_chars);
                buf.put_u32(size.height_rows);
                buf.put_u32(size.width_pixels);
                buf.put_u32(size.height_pixels);
            }
            ChannelRequestType::Signal { name } => buf.put_str(name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                buf.put_str(signal_name);
                buf.put_bool(*core_dumped);
                buf.put_str(error_message);
                buf.put_str("");
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Self::parse(&mut SshReader::new(data))
    }

    /// Parses the message from a configured reader.
    pub fn parse(reader: &mut SshReader<'_>) -> KestrelResult<Self> {
        expect_type(reader, MessageType::ChannelRequest)?;
        let recipient_channel = reader.read_u32()?;
        let name = reader.read_utf8()?;
        let want_reply = reader.read_bool()?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq(PtyRequest {
                term: reader.read_utf8()?,
                width_chars: reader.read_u32()?,
                height_rows: reader.read_u32()?,
                width_pixels: reader.read_u32()?,
                height_pixels: reader.read_u32()?,
                modes: reader.read_string()?.to_vec(),
            }),
            "env" => ChannelRequestType::Env {
                name: reader.read_utf8()?,
                value: reader.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: String::from_utf8_lossy(reader.read_string()?).into_owned(),
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: reader.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange(TerminalSize {
                width_chars: reader.read_u32()?,
                height_rows: reader.read_u32()?,
                width_pixels: reader.read_u32()?,
                height_pixels: reader.read_u32()?,
            }),
            "signal" => ChannelRequestType::Signal {
                name: reader.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: reader.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: reader.read_utf8()?,
                core_dumped: reader.read_bool()?,
                error_message: reader.read_utf8()?,
            },
            _ => ChannelRequestType::Other {
                name,
                data: reader.rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    recipient_channel: u32,
}

impl ChannelSuccess {
    /// Creates a new channel success message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        recipient_only(MessageType::ChannelSuccess, self.recipient_channel)
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Ok(Self::new(parse_recipient_only(data, MessageType::ChannelSuccess)?))
    }
}

/// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    recipient_channel: u32,
}

impl ChannelFailure {
    /// Creates a new channel failure message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        recipient_only(MessageType::ChannelFailure, self.recipient_channel)
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Ok(Self::new(parse_recipient_only(data, MessageType::ChannelFailure)?))
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name, e.g. `keepalive@openssh.com`
    pub name: String,
    /// Whether the sender expects a reply
    pub want_reply: bool,
    /// Request specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        buf.put_str(&self.name);
        buf.put_bool(self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses the message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::GlobalRequest)?;
        Ok(Self {
            name: reader.read_utf8()?,
            want_reply: reader.read_bool()?,
            data: reader.rest().to_vec(),
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS message (RFC 4254 Section 4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSuccess {
    /// Request specific response data
    pub data: Vec<u8>,
}

impl RequestSuccess {
    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(MessageType::RequestSuccess as u8);
        buf.put_slice(&self.data);
        buf.to_vec()
    }
}

/// SSH_MSG_REQUEST_FAILURE message (RFC 4254 Section 4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFailure;

impl RequestFailure {
    /// Serializes the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::RequestFailure as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 0, 1048576, 32768);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_channel_open_direct_tcpip() {
        let target = ForwardTarget {
            host: "db.internal".to_string(),
            port: 5432,
            originator_address: "10.0.0.7".to_string(),
            originator_port: 50123,
        };
        let open = ChannelOpen::new(ChannelType::DirectTcpip(target.clone()), 3, 65536, 16384);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed.channel_type(), &ChannelType::DirectTcpip(target));
        assert_eq!(parsed.sender_channel(), 3);
    }

    #[test]
    fn test_channel_open_unknown_type_keeps_data() {
        let open = ChannelOpen::new(
            ChannelType::Other {
                name: "x11".to_string(),
                data: vec![0, 0, 0, 1, b'a', 0, 0, 0, 6],
            },
            1,
            1024,
            512,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed.channel_type().name(), "x11");
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_channel_open_failure() {
        let failure = ChannelOpenFailure::new(5, ChannelOpenFailureReason::UnknownChannelType);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 5);
        assert_eq!(
            parsed.reason_code(),
            ChannelOpenFailureReason::UnknownChannelType
        );
        assert_eq!(parsed.description(), "unknown channel type");
    }

    #[test]
    fn test_channel_data_layout() {
        let bytes = ChannelData::new(7, b"hello".to_vec()).to_bytes();
        assert_eq!(bytes[0], 94);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 7]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 5]);
        assert_eq!(&bytes[9..], b"hello");
    }

    #[test]
    fn test_channel_data_respects_field_limit() {
        let bytes = ChannelData::new(0, vec![0u8; 64]).to_bytes();
        let mut reader = SshReader::with_limit(&bytes, 32);
        assert!(ChannelData::parse(&mut reader).is_err());
    }

    #[test]
    fn test_extended_data() {
        let msg = ChannelExtendedData::new(1, EXTENDED_DATA_STDERR, b"oops".to_vec());
        let parsed = ChannelExtendedData::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.data_type_code(), EXTENDED_DATA_STDERR);
        assert_eq!(parsed.data(), b"oops");
    }

    #[test]
    fn test_recipient_only_messages() {
        assert_eq!(ChannelEof::new(9).to_bytes(), vec![96, 0, 0, 0, 9]);
        assert_eq!(ChannelClose::new(9).to_bytes(), vec![97, 0, 0, 0, 9]);
        assert_eq!(
            ChannelSuccess::from_bytes(&[99, 0, 0, 1, 0])
                .unwrap()
                .recipient_channel(),
            256
        );
        assert!(ChannelFailure::from_bytes(&[99, 0, 0, 0, 1]).is_err());
        assert!(ChannelEof::from_bytes(&[96, 0, 0]).is_err());
    }

    #[test]
    fn test_channel_request_pty() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::PtyReq(PtyRequest {
                term: "xterm-256color".to_string(),
                width_chars: 120,
                height_rows: 40,
                width_pixels: 0,
                height_pixels: 0,
                modes: vec![0],
            }),
            true,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert!(parsed.want_reply());
    }

    #[test]
    fn test_channel_request_exec_and_window_change() {
        let exec = ChannelRequest::new(
            2,
            ChannelRequestType::Exec {
                command: "uname -a".to_string(),
            },
            true,
        );
        assert_eq!(ChannelRequest::from_bytes(&exec.to_bytes()).unwrap(), exec);

        let resize = ChannelRequest::new(
            2,
            ChannelRequestType::WindowChange(TerminalSize {
                width_chars: 100,
                height_rows: 30,
                width_pixels: 800,
                height_pixels: 600,
            }),
            false,
        );
        assert_eq!(
            ChannelRequest::from_bytes(&resize.to_bytes()).unwrap(),
            resize
        );
    }

    #[test]
    fn test_channel_request_unknown_type() {
        let request = ChannelRequest::new(
            1,
            ChannelRequestType::Other {
                name: "auth-agent-req@openssh.com".to_string(),
                data: Vec::new(),
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.request_type().name(), "auth-agent-req@openssh.com");
    }

    #[test]
    fn test_exit_status() {
        let request =
            ChannelRequest::new(4, ChannelRequestType::ExitStatus { exit_status: 127 }, false);
        let bytes = request.to_bytes();
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 127]);
        assert_eq!(ChannelRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_global_request() {
        let request = GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Vec::new(),
        };
        let parsed = GlobalRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(RequestFailure.to_bytes(), vec![82]);
        assert_eq!(RequestSuccess::default().to_bytes(), vec![81]);
    }
}
