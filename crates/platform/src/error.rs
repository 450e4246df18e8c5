//! Error types for Kestrel

use std::fmt;

/// SSH disconnect reason codes (RFC 4253 Section 11.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Parse a reason code received from the wire.
    ///
    /// Unknown codes map to `None`; callers usually log the raw value.
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => DisconnectReason::HostNotAllowedToConnect,
            2 => DisconnectReason::ProtocolError,
            3 => DisconnectReason::KeyExchangeFailed,
            4 => DisconnectReason::Reserved,
            5 => DisconnectReason::MacError,
            6 => DisconnectReason::CompressionError,
            7 => DisconnectReason::ServiceNotAvailable,
            8 => DisconnectReason::ProtocolVersionNotSupported,
            9 => DisconnectReason::HostKeyNotVerifiable,
            10 => DisconnectReason::ConnectionLost,
            11 => DisconnectReason::ByApplication,
            12 => DisconnectReason::TooManyConnections,
            13 => DisconnectReason::AuthCancelledByUser,
            14 => DisconnectReason::NoMoreAuthMethodsAvailable,
            15 => DisconnectReason::IllegalUserName,
            _ => return None,
        })
    }

    /// Wire value of this reason.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Unified error type for all Kestrel operations
#[derive(Debug)]
pub enum KestrelError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed packet or field, oversize length, unexpected message
    Protocol(String),

    /// Input ended before a declared field was complete
    TruncatedInput {
        /// Bytes required by the field being decoded
        needed: usize,
        /// Bytes actually left in the input
        available: usize,
    },

    /// Peer speaks an unsupported protocol version
    VersionNotSupported(String),

    /// Negotiation found no shared algorithm in a mandatory category
    NoCommonAlgorithm {
        /// Category name, e.g. `"kex"` or `"encryption client->server"`
        category: String,
    },

    /// Key exchange failed (bad public value, signature failure, ...)
    KeyExchange(String),

    /// MAC verification failed
    Mac,

    /// Other cryptographic failure
    Crypto(String),

    /// Compression or decompression failed
    Compression(String),

    /// Authentication failed or ran out of attempts
    Auth(String),

    /// Requested service does not exist
    ServiceNotAvailable(String),

    /// Channel-scoped error (unknown channel, window violation)
    Channel {
        /// Local channel number
        channel: u32,
        /// Description
        message: String,
    },

    /// Authentication or idle timeout
    Timeout(String),

    /// Session was disconnected, by the peer or locally
    Disconnected {
        /// Reason code
        reason: DisconnectReason,
        /// Human-readable description
        description: String,
    },

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl KestrelError {
    /// Disconnect reason to send to the peer when this error ends a session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            KestrelError::Io(_) => DisconnectReason::ConnectionLost,
            KestrelError::Protocol(_)
            | KestrelError::TruncatedInput { .. }
            | KestrelError::Channel { .. }
            | KestrelError::NotImplemented(_) => DisconnectReason::ProtocolError,
            KestrelError::VersionNotSupported(_) => DisconnectReason::ProtocolVersionNotSupported,
            KestrelError::NoCommonAlgorithm { .. }
            | KestrelError::KeyExchange(_)
            | KestrelError::Crypto(_) => DisconnectReason::KeyExchangeFailed,
            KestrelError::Mac => DisconnectReason::MacError,
            KestrelError::Compression(_) => DisconnectReason::CompressionError,
            KestrelError::Auth(_) => DisconnectReason::NoMoreAuthMethodsAvailable,
            KestrelError::ServiceNotAvailable(_) => DisconnectReason::ServiceNotAvailable,
            KestrelError::Disconnected { reason, .. } => *reason,
            KestrelError::Config(_) | KestrelError::Timeout(_) | KestrelError::Other(_) => {
                DisconnectReason::ByApplication
            }
        }
    }

    /// Whether this error must tear down the whole session.
    ///
    /// Channel errors stay scoped to their channel; everything else is fatal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, KestrelError::Channel { .. })
    }

    /// Shorthand for a channel-scoped error.
    pub fn channel(channel: u32, message: impl Into<String>) -> Self {
        KestrelError::Channel {
            channel,
            message: message.into(),
        }
    }
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Io(e) => write!(f, "IO error: {}", e),
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::TruncatedInput { needed, available } => write!(
                f,
                "Truncated input: needed {} bytes, {} available",
                needed, available
            ),
            KestrelError::VersionNotSupported(v) => {
                write!(f, "Protocol version not supported: {}", v)
            }
            KestrelError::NoCommonAlgorithm { category } => {
                write!(f, "No common algorithm for {}", category)
            }
            KestrelError::KeyExchange(msg) => write!(f, "Key exchange failed: {}", msg),
            KestrelError::Mac => write!(f, "MAC verification failed"),
            KestrelError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            KestrelError::Compression(msg) => write!(f, "Compression error: {}", msg),
            KestrelError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            KestrelError::ServiceNotAvailable(name) => {
                write!(f, "Service not available: {}", name)
            }
            KestrelError::Channel { channel, message } => {
                write!(f, "Channel {} error: {}", channel, message)
            }
            KestrelError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            KestrelError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected ({}): {}", reason, description),
            KestrelError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            KestrelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(e) => Some(e),
            KestrelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(err)
    }
}

/// Result type for Kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KestrelError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            KestrelError::Mac.disconnect_reason(),
            DisconnectReason::MacError
        );
        assert_eq!(
            KestrelError::NoCommonAlgorithm {
                category: "kex".into()
            }
            .disconnect_reason(),
            DisconnectReason::KeyExchangeFailed
        );
        assert_eq!(
            KestrelError::VersionNotSupported("1.5".into()).disconnect_reason(),
            DisconnectReason::ProtocolVersionNotSupported
        );
        assert_eq!(
            KestrelError::ServiceNotAvailable("ssh-foo".into()).disconnect_reason(),
            DisconnectReason::ServiceNotAvailable
        );
    }

    #[test]
    fn test_channel_errors_are_recoverable() {
        assert!(!KestrelError::channel(3, "window exceeded").is_terminal());
        assert!(KestrelError::Protocol("bad".into()).is_terminal());
        assert!(KestrelError::Timeout("auth".into()).is_terminal());
    }

    #[test]
    fn test_reason_code_round_trip() {
        for code in 1..=15 {
            let reason = DisconnectReason::from_u32(code).unwrap();
            assert_eq!(reason.code(), code);
        }
        assert!(DisconnectReason::from_u32(0).is_none());
        assert!(DisconnectReason::from_u32(16).is_none());
    }
}
