//! SSH-2 server protocol core for the Kestrel server.
//!
//! This crate implements the server side of SSH-2:
//!
//! - **Transport** - version exchange, algorithm negotiation, Diffie-Hellman
//!   and Curve25519 key exchange, encryption, MAC, compression and rekeying
//! - **Authentication** - `none`, `password`, `publickey` and `hostbased`
//! - **Connection** - channels with flow control, session requests,
//!   `direct-tcpip` and application defined channel types
//!
//! # Features
//!
//! - `ssh` (default) - the SSH protocol implementation
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::Packet;
//!
//! // Create and serialize an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! See [`ssh::server`] for running a server.
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, RustCrypto, `dalek`)
//! - Constant-time comparison for passwords and MACs
//! - Secrets are zeroized with `zeroize`
//! - Packet and message parsers are fuzzed
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
