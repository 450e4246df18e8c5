//! SSH-2 server protocol core (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire codec** ([`wire`], [`packet`]) - SSH data types and the binary
//!    packet protocol with encryption, MAC and compression
//! 2. **Transport** ([`transport`], [`kex`], [`algorithm`]) - version
//!    exchange, algorithm negotiation, key exchange and rekeying
//! 3. **Authentication** ([`auth`]) - `none`, `password`, `publickey` and
//!    `hostbased` methods with attempt limits and a timeout
//! 4. **Connection** ([`connection_mgr`], [`channel`]) - channel
//!    multiplexing, flow control, session requests and global requests
//! 5. **Server** ([`server`]) - accept loop with one task per session
//!
//! [`dispatcher`] routes each decrypted payload to the service that owns
//! its message number.
//!
//! # Security Considerations
//!
//! - **Input Validation**: every length field is checked against the
//!   remaining input and the configured limits before allocating
//! - **Constant-Time Operations**: password comparison and MAC checks use
//!   [`subtle`]
//! - **Memory Safety**: key material and passwords are zeroized on drop
//!   using [`zeroize`]
//! - **No Unsafe Code**
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod algorithm;
pub mod auth;
pub mod channel;
pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod connection_mgr;
pub mod crypto;
pub mod dispatcher;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod packet;
pub mod server;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use algorithm::{negotiate, AlgorithmRegistry, AlgorithmSuite};
pub use auth::{
    constant_time_compare, AuthDecision, AuthMethod, AuthOutcome, AuthRequest, AuthService,
    Authenticator, Credentials,
};
pub use channel::{
    Channel, ChannelEvent, ChannelHandle, ChannelHandler, ChannelKind, ChannelLimits,
    ChannelState, EventForwarder, ForwardedChannel, SessionChannel, SessionConsumer,
};
pub use client::{AuthReply, ExecOutput, SshClient};
pub use compression::CompressionAlgorithm;
pub use config::{SshServerConfig, SshServerConfigBuilder};
pub use connection::{
    ChannelOpenFailureReason, ChannelRequestType, ChannelType, ForwardTarget, PtyRequest,
    TerminalSize,
};
pub use connection_mgr::ConnectionService;
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use dispatcher::{Dispatcher, Route, ServiceKind};
pub use hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeySet, PublicKey, RsaHostKey};
pub use kex::{KexInit, NewKeys};
pub use kex_dh::KexAlgorithm;
pub use message::{MessageRange, MessageType};
pub use packet::Packet;
pub use server::{ServerHandle, SessionHandler, SshServer, SshSession};
pub use transport::{PacketSender, State, Transport, TransportConfig};
pub use version::Version;
