//! SSH key exchange (KEX) implementation (RFC 4253 Section 7 and 8).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT, SSH_MSG_NEWKEYS
//! - SSH_MSG_KEXDH_INIT / SSH_MSG_KEXDH_REPLY (shared by the ECDH methods)
//! - the server side of one exchange ([`server_reply`]) and a client side
//!   ([`ClientKex`]) used by test peers
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server shares wins)
//! 3. Client sends KEXDH_INIT, server answers with KEXDH_REPLY signed with
//!    its host key
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys once its NEWKEYS has passed
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new(
//!     vec!["curve25519-sha256".to_string()],
//!     vec!["ssh-ed25519".to_string()],
//!     vec!["aes128-ctr".to_string()],
//!     vec!["hmac-sha2-256".to_string()],
//!     vec!["none".to_string()],
//! );
//! let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
//! assert_eq!(parsed, kexinit);
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use super::algorithm::AlgorithmSuite;
use super::hostkey::{HostKey, HostKeyAlgorithm, PublicKey};
use super::kex_dh::{
    compute_exchange_hash, EphemeralKey, ExchangeHashInput, KexAlgorithm, SessionKeys,
    SharedSecret,
};
use super::message::{expect_type, MessageType};
use super::wire::{SshReader, SshWrite};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
/// Encryption, MAC and compression lists are built the same for both
/// directions but parsed separately, since a peer may differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie and symmetric lists.
    pub fn new(
        kex: Vec<String>,
        host_keys: Vec<String>,
        ciphers: Vec<String>,
        macs: Vec<String>,
        compression: Vec<String>,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: kex,
            server_host_key_algorithms: host_keys,
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns the languages (client to server).
    pub fn languages_client_to_server(&self) -> &[String] {
        &self.languages_client_to_server
    }

    /// Returns the languages (server to client).
    pub fn languages_server_to_client(&self) -> &[String] {
        &self.languages_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to payload bytes.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_algorithms_client_to_server);
        buf.put_name_list(&self.encryption_algorithms_server_to_client);
        buf.put_name_list(&self.mac_algorithms_client_to_server);
        buf.put_name_list(&self.mac_algorithms_server_to_client);
        buf.put_name_list(&self.compression_algorithms_client_to_server);
        buf.put_name_list(&self.compression_algorithms_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);

        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT payload.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] for a wrong message id or a
    /// malformed name-list, and [`KestrelError::TruncatedInput`] if the
    /// payload ends early.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::KexInit)?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_raw(16)?);

        let kex_algorithms = reader.read_name_list()?;
        let server_host_key_algorithms = reader.read_name_list()?;
        let encryption_algorithms_client_to_server = reader.read_name_list()?;
        let encryption_algorithms_server_to_client = reader.read_name_list()?;
        let mac_algorithms_client_to_server = reader.read_name_list()?;
        let mac_algorithms_server_to_client = reader.read_name_list()?;
        let compression_algorithms_client_to_server = reader.read_name_list()?;
        let compression_algorithms_server_to_client = reader.read_name_list()?;
        let languages_client_to_server = reader.read_name_list()?;
        let languages_server_to_client = reader.read_name_list()?;
        let first_kex_packet_follows = reader.read_bool()?;
        let _reserved = reader.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// Packet sequence numbers are not reset by NEWKEYS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::NewKeys)?;
        reader.finish()?;
        Ok(Self)
    }
}

fn put_public(buf: &mut BytesMut, algorithm: KexAlgorithm, value: &[u8]) {
    if algorithm.is_ecdh() {
        buf.put_string(value);
    } else {
        buf.put_mpint_unsigned(value);
    }
}

fn read_public(reader: &mut SshReader<'_>, algorithm: KexAlgorithm) -> KestrelResult<Vec<u8>> {
    if algorithm.is_ecdh() {
        Ok(reader.read_string()?.to_vec())
    } else {
        Ok(reader.read_mpint_unsigned()?.to_vec())
    }
}

/// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT.
///
/// `e` travels as an mpint for finite field DH and `Q_C` as a string for
/// ECDH; both share message id 30.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhInit {
    /// Client public value, unsigned magnitude for DH
    pub public: Vec<u8>,
}

impl KexdhInit {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self, algorithm: KexAlgorithm) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        put_public(&mut buf, algorithm, &self.public);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8], algorithm: KexAlgorithm) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::KexdhInit)?;
        let public = read_public(&mut reader, algorithm)?;
        reader.finish()?;
        Ok(Self { public })
    }
}

/// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhReply {
    /// K_S
    pub host_key_blob: Vec<u8>,
    /// f or Q_S
    pub public: Vec<u8>,
    /// Signature of H, `string alg, string sig`
    pub signature: Vec<u8>,
}

impl KexdhReply {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self, algorithm: KexAlgorithm) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        buf.put_string(&self.host_key_blob);
        put_public(&mut buf, algorithm, &self.public);
        buf.put_string(&self.signature);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8], algorithm: KexAlgorithm) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::KexdhReply)?;
        let host_key_blob = reader.read_string()?.to_vec();
        let public = read_public(&mut reader, algorithm)?;
        let signature = reader.read_string()?.to_vec();
        Ok(Self {
            host_key_blob,
            public,
            signature,
        })
    }
}

/// Inputs fixed before the method specific exchange starts.
#[derive(Debug, Clone)]
pub struct KexContext {
    /// V_C
    pub client_version: String,
    /// V_S
    pub server_version: String,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: Vec<u8>,
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: Vec<u8>,
    /// Negotiated algorithms
    pub suite: AlgorithmSuite,
}

/// Result of one completed exchange.
#[derive(Debug)]
pub struct KexOutput {
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// Shared secret K
    pub shared_secret: SharedSecret,
    /// Algorithms the new keys are for
    pub suite: AlgorithmSuite,
}

impl KexOutput {
    /// Derives the six session keys.
    ///
    /// `session_id` is the exchange hash of the first exchange on the
    /// connection and stays fixed across rekeys.
    pub fn session_keys(&self, session_id: &[u8]) -> SessionKeys {
        SessionKeys::derive(&self.suite, &self.shared_secret, &self.exchange_hash, session_id)
    }
}

/// Runs the server side of a KEXDH exchange.
///
/// Parses the client's KEXDH_INIT, generates the server's ephemeral key,
/// computes `K` and `H` and signs `H` with the host key for the negotiated
/// host key algorithm. Returns the KEXDH_REPLY payload to send.
pub fn server_reply(
    ctx: KexContext,
    init_payload: &[u8],
    host_key: &dyn HostKey,
) -> KestrelResult<(Vec<u8>, KexOutput)> {
    let algorithm = ctx.suite.kex;
    let init = KexdhInit::from_bytes(init_payload, algorithm)?;

    if !host_key.supports(ctx.suite.host_key) {
        return Err(KestrelError::KeyExchange(format!(
            "No host key for {}",
            ctx.suite.host_key.name()
        )));
    }

    let ephemeral = EphemeralKey::generate(algorithm)?;
    let server_public = ephemeral.public_value();
    let shared_secret = ephemeral.agree(&init.public)?;
    let host_key_blob = host_key.public_key_blob();

    let exchange_hash = compute_exchange_hash(
        algorithm,
        &ExchangeHashInput {
            client_version: &ctx.client_version,
            server_version: &ctx.server_version,
            client_kexinit: &ctx.client_kexinit,
            server_kexinit: &ctx.server_kexinit,
            host_key_blob: &host_key_blob,
            client_public: &init.public,
            server_public: &server_public,
        },
        &shared_secret,
    );
    let signature = host_key.sign(ctx.suite.host_key, &exchange_hash)?;

    let reply = KexdhReply {
        host_key_blob,
        public: server_public,
        signature,
    };

    Ok((
        reply.to_bytes(algorithm),
        KexOutput {
            exchange_hash,
            shared_secret,
            suite: ctx.suite,
        },
    ))
}

/// Client side of a KEXDH exchange.
pub struct ClientKex {
    ctx: KexContext,
    ephemeral: EphemeralKey,
    public: Vec<u8>,
}

impl ClientKex {
    /// Generates the client's ephemeral key and returns the KEXDH_INIT
    /// payload to send.
    pub fn start(ctx: KexContext) -> KestrelResult<(Self, Vec<u8>)> {
        let ephemeral = EphemeralKey::generate(ctx.suite.kex)?;
        let public = ephemeral.public_value();
        let init = KexdhInit {
            public: public.clone(),
        }
        .to_bytes(ctx.suite.kex);
        Ok((
            Self {
                ctx,
                ephemeral,
                public,
            },
            init,
        ))
    }

    /// Processes KEXDH_REPLY and verifies the host key signature over `H`.
    ///
    /// Returns the exchange output and the server's host key. Deciding
    /// whether that key is trusted is up to the caller.
    pub fn finish(self, reply_payload: &[u8]) -> KestrelResult<(KexOutput, PublicKey)> {
        let algorithm = self.ctx.suite.kex;
        let reply = KexdhReply::from_bytes(reply_payload, algorithm)?;
        let host_key = PublicKey::from_blob(&reply.host_key_blob)?;

        let mut sig_reader = SshReader::new(&reply.signature);
        let sig_alg = sig_reader.read_utf8()?;
        if HostKeyAlgorithm::from_name(&sig_alg) != Some(self.ctx.suite.host_key) {
            return Err(KestrelError::KeyExchange(format!(
                "Host key signature uses {}, negotiated {}",
                sig_alg,
                self.ctx.suite.host_key.name()
            )));
        }

        let shared_secret = self.ephemeral.agree(&reply.public)?;
        let exchange_hash = compute_exchange_hash(
            algorithm,
            &ExchangeHashInput {
                client_version: &self.ctx.client_version,
                server_version: &self.ctx.server_version,
                client_kexinit: &self.ctx.client_kexinit,
                server_kexinit: &self.ctx.server_kexinit,
                host_key_blob: &reply.host_key_blob,
                client_public: &self.public,
                server_public: &reply.public,
            },
            &shared_secret,
        );

        if !host_key.verify(&exchange_hash, &reply.signature)? {
            return Err(KestrelError::KeyExchange(
                "Host key signature verification failed".to_string(),
            ));
        }

        Ok((
            KexOutput {
                exchange_hash,
                shared_secret,
                suite: self.ctx.suite,
            },
            host_key,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithm::{negotiate, AlgorithmRegistry};
    use crate::ssh::hostkey::{Ed25519HostKey, RsaHostKey};

    fn context(registry: &AlgorithmRegistry, host_keys: &[HostKeyAlgorithm]) -> KexContext {
        let client = registry.kex_init(host_keys);
        let server = registry.kex_init(host_keys);
        KexContext {
            client_version: "SSH-2.0-TestClient".to_string(),
            server_version: "SSH-2.0-Kestrel_test".to_string(),
            client_kexinit: client.to_bytes(),
            server_kexinit: server.to_bytes(),
            suite: negotiate(&client, &server).unwrap(),
        }
    }

    #[test]
    fn test_kexinit_roundtrip_preserves_every_list() {
        let init = AlgorithmRegistry::default()
            .kex_init(&[HostKeyAlgorithm::SshEd25519])
            .with_first_kex_packet_follows(true);
        let parsed = KexInit::from_bytes(&init.to_bytes()).unwrap();
        assert_eq!(parsed, init);
        assert!(parsed.first_kex_packet_follows());
        assert!(parsed.languages_client_to_server().is_empty());
    }

    #[test]
    fn test_kexinit_rejects_wrong_type_and_truncation() {
        let mut bytes = AlgorithmRegistry::legacy()
            .kex_init(&[HostKeyAlgorithm::SshRsa])
            .to_bytes();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            KexInit::from_bytes(truncated),
            Err(KestrelError::TruncatedInput { .. })
        ));

        bytes[0] = 21;
        assert!(KexInit::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::from_bytes(&[21]).unwrap(), NewKeys);
        assert!(NewKeys::from_bytes(&[21, 0]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }

    #[test]
    fn test_kexdh_init_encoding_by_method() {
        let init = KexdhInit {
            public: vec![0x80, 0x01],
        };
        // mpint gets a sign byte
        assert_eq!(
            init.to_bytes(KexAlgorithm::DhGroup14Sha1),
            vec![30, 0, 0, 0, 3, 0, 0x80, 0x01]
        );
        // ECDH string does not
        assert_eq!(
            init.to_bytes(KexAlgorithm::Curve25519Sha256),
            vec![30, 0, 0, 0, 2, 0x80, 0x01]
        );
        let parsed =
            KexdhInit::from_bytes(&init.to_bytes(KexAlgorithm::DhGroup1Sha1), KexAlgorithm::DhGroup1Sha1)
                .unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_curve25519_exchange_end_to_end() {
        let host_key = Ed25519HostKey::generate().unwrap();
        let ctx = context(&AlgorithmRegistry::default(), &[HostKeyAlgorithm::SshEd25519]);
        assert_eq!(ctx.suite.kex, KexAlgorithm::Curve25519Sha256);

        let (client, init) = ClientKex::start(ctx.clone()).unwrap();
        let (reply, server_out) = server_reply(ctx, &init, &host_key).unwrap();
        let (client_out, server_key) = client.finish(&reply).unwrap();

        assert_eq!(server_out.exchange_hash, client_out.exchange_hash);
        assert_eq!(
            server_out.shared_secret.as_bytes(),
            client_out.shared_secret.as_bytes()
        );
        assert_eq!(server_key.key_type(), "ssh-ed25519");

        let sid = server_out.exchange_hash.clone();
        let server_keys = server_out.session_keys(&sid);
        let client_keys = client_out.session_keys(&sid);
        assert_eq!(server_keys.enc_client_to_server, client_keys.enc_client_to_server);
        assert_eq!(server_keys.enc_client_to_server.len(), 32);
        assert_eq!(server_keys.mac_server_to_client.len(), 32);
    }

    #[test]
    fn test_group1_exchange_with_ssh_rsa() {
        let host_key = RsaHostKey::generate(1024).unwrap();
        let ctx = context(&AlgorithmRegistry::legacy(), &[HostKeyAlgorithm::SshRsa]);

        let (client, init) = ClientKex::start(ctx.clone()).unwrap();
        let (reply, server_out) = server_reply(ctx, &init, &host_key).unwrap();
        let (client_out, _) = client.finish(&reply).unwrap();

        assert_eq!(server_out.exchange_hash.len(), 20);
        assert_eq!(server_out.exchange_hash, client_out.exchange_hash);
    }

    #[test]
    fn test_tampered_reply_fails_verification() {
        let host_key = Ed25519HostKey::generate().unwrap();
        let ctx = context(&AlgorithmRegistry::default(), &[HostKeyAlgorithm::SshEd25519]);

        let (client, init) = ClientKex::start(ctx.clone()).unwrap();
        let mut other_ctx = ctx;
        other_ctx.server_version = "SSH-2.0-Impostor".to_string();
        let (reply, _) = server_reply(other_ctx, &init, &host_key).unwrap();

        assert!(matches!(
            client.finish(&reply),
            Err(KestrelError::KeyExchange(_))
        ));
    }

    #[test]
    fn test_server_without_matching_host_key() {
        let host_key = Ed25519HostKey::generate().unwrap();
        let ctx = context(&AlgorithmRegistry::legacy(), &[HostKeyAlgorithm::SshRsa]);
        let (_client, init) = ClientKex::start(ctx.clone()).unwrap();
        assert!(server_reply(ctx, &init, &host_key).is_err());
    }
}
