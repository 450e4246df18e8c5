//! Key exchange primitives (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 and diffie-hellman-group14-sha1/sha256
//! - curve25519-sha256 (and the `@libssh.org` alias)
//! - the exchange hash `H` and the session key derivation
//!
//! # Security
//!
//! - Peer DH values are checked to lie in `(1, p-1)`
//! - Curve25519 runs through `ring`, which rejects all-zero shared secrets
//! - Private exponents, shared secrets and derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex_dh::{EphemeralKey, KexAlgorithm};
//!
//! let client = EphemeralKey::generate(KexAlgorithm::Curve25519Sha256).unwrap();
//! let server = EphemeralKey::generate(KexAlgorithm::Curve25519Sha256).unwrap();
//! let client_public = client.public_value();
//! let server_public = server.public_value();
//!
//! let k1 = client.agree(&server_public).unwrap();
//! let k2 = server.agree(&client_public).unwrap();
//! assert_eq!(k1.as_bytes(), k2.as_bytes());
//! ```

use super::algorithm::AlgorithmSuite;
use super::wire::SshWrite;
use bytes::BytesMut;
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Key exchange method identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexAlgorithm {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1
    DhGroup14Sha1,
    /// diffie-hellman-group1-sha1
    DhGroup1Sha1,
}

impl KexAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexAlgorithm::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses a key exchange method from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" => Some(KexAlgorithm::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexAlgorithm::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexAlgorithm::DhGroup14Sha256),
            "diffie-hellman-group14-sha1" => Some(KexAlgorithm::DhGroup14Sha1),
            "diffie-hellman-group1-sha1" => Some(KexAlgorithm::DhGroup1Sha1),
            _ => None,
        }
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexAlgorithm::DhGroup14Sha1 | KexAlgorithm::DhGroup1Sha1 => HashAlgorithm::Sha1,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// Whether the public values travel as `string` (ECDH) rather than `mpint`.
    pub fn is_ecdh(&self) -> bool {
        matches!(
            self,
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256Libssh
        )
    }

    fn dh_group(&self) -> Option<&'static DhGroup> {
        match self {
            KexAlgorithm::DhGroup14Sha256 | KexAlgorithm::DhGroup14Sha1 => Some(&GROUP14),
            KexAlgorithm::DhGroup1Sha1 => Some(&GROUP1),
            _ => None,
        }
    }
}

/// Hash function tied to a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

mod primes {
    /// Oakley Group 2 prime (RFC 2409 Section 6.2), 1024-bit.
    pub const GROUP1_PRIME: [u8; 128] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
        0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
        0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
        0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
        0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
        0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
        0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
        0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
        0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
        0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    ];

    /// MODP Group 14 prime (RFC 3526 Section 3), 2048-bit.
    pub const GROUP14_PRIME: [u8; 256] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
        0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
        0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
        0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
        0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
        0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
        0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
        0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
        0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
        0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
        0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
        0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
        0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
        0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
        0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
        0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
        0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
        0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
        0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
        0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
        0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff,
    ];
}

/// A MODP group with generator 2.
struct DhGroup {
    prime: Lazy<BigUint>,
    /// Size of the random private exponent.
    exponent_bits: u64,
}

static GROUP1: DhGroup = DhGroup {
    prime: Lazy::new(|| BigUint::from_bytes_be(&primes::GROUP1_PRIME)),
    exponent_bits: 256,
};

static GROUP14: DhGroup = DhGroup {
    prime: Lazy::new(|| BigUint::from_bytes_be(&primes::GROUP14_PRIME)),
    exponent_bits: 512,
};

const GENERATOR: u32 = 2;

/// Finite field Diffie-Hellman exchange.
pub struct DhExchange {
    group: &'static DhGroup,
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
}

impl DhExchange {
    fn new(group: &'static DhGroup) -> Self {
        let mut rng = rand::thread_rng();
        let p: &BigUint = &group.prime;

        // x in [2, 2^exponent_bits), well below p - 1
        let x = rng.gen_biguint_range(
            &BigUint::from(2u32),
            &(BigUint::from(1u32) << group.exponent_bits),
        );
        let y = BigUint::from(GENERATOR).modpow(&x, p);

        Self {
            group,
            private_key: Zeroizing::new(x.to_bytes_be()),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns `g^x mod p` as an unsigned big-endian magnitude.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes `K = y^x mod p` from the peer's value.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::KeyExchange`] unless `1 < y < p - 1`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KestrelResult<SharedSecret> {
        let p: &BigUint = &self.group.prime;
        let y_peer = BigUint::from_bytes_be(peer_public);

        let one = BigUint::from(1u32);
        if y_peer <= one || y_peer >= p - &one {
            return Err(KestrelError::KeyExchange(
                "Peer DH public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, p);
        Ok(SharedSecret::new(k.to_bytes_be()))
    }
}

/// Curve25519 key exchange.
///
/// Implements curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> KestrelResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KestrelError::Crypto("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            KestrelError::Crypto("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret given the peer's 32-byte public key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KestrelResult<SharedSecret> {
        if peer_public.len() != 32 {
            return Err(KestrelError::KeyExchange(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            SharedSecret::new(key_material.to_vec())
        })
        .map_err(|_| KestrelError::KeyExchange("Curve25519 key agreement failed".to_string()))
    }
}

/// One side's ephemeral key for any supported method.
pub enum EphemeralKey {
    /// Finite field DH
    Dh(DhExchange),
    /// X25519
    Curve25519(Curve25519Exchange),
}

impl EphemeralKey {
    /// Generates a fresh ephemeral key for `algorithm`.
    pub fn generate(algorithm: KexAlgorithm) -> KestrelResult<Self> {
        match algorithm.dh_group() {
            Some(group) => Ok(EphemeralKey::Dh(DhExchange::new(group))),
            None => Ok(EphemeralKey::Curve25519(Curve25519Exchange::new()?)),
        }
    }

    /// The value sent to the peer (`e`/`f` magnitude or `Q_C`/`Q_S`).
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            EphemeralKey::Dh(dh) => dh.public_key().to_vec(),
            EphemeralKey::Curve25519(x) => x.public_key().to_vec(),
        }
    }

    /// Consumes the key and derives the shared secret.
    pub fn agree(self, peer_public: &[u8]) -> KestrelResult<SharedSecret> {
        match self {
            EphemeralKey::Dh(dh) => dh.compute_shared_secret(peer_public),
            EphemeralKey::Curve25519(x) => x.compute_shared_secret(peer_public),
        }
    }
}

/// The shared secret `K`, held as an unsigned big-endian magnitude.
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    /// Wraps raw secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw magnitude bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `K` as an mpint, the form it takes inside every hash.
    fn to_mpint(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.0.len() + 5);
        buf.put_mpint_unsigned(&self.0);
        let out = Zeroizing::new(buf.to_vec());
        zeroize::Zeroize::zeroize(&mut buf[..]);
        out
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Everything the exchange hash covers apart from `K`.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, client identification line without CR LF
    pub client_version: &'a str,
    /// V_S, server identification line without CR LF
    pub server_version: &'a str,
    /// I_C, payload of the client's KEXINIT
    pub client_kexinit: &'a [u8],
    /// I_S, payload of the server's KEXINIT
    pub server_kexinit: &'a [u8],
    /// K_S, server host key blob
    pub host_key_blob: &'a [u8],
    /// e or Q_C
    pub client_public: &'a [u8],
    /// f or Q_S
    pub server_public: &'a [u8],
}

/// Computes the exchange hash `H`.
///
/// ```text
/// H = HASH(string V_C || string V_S || string I_C || string I_S ||
///          string K_S || (mpint e || mpint f | string Q_C || string Q_S) ||
///          mpint K)
/// ```
pub fn compute_exchange_hash(
    algorithm: KexAlgorithm,
    input: &ExchangeHashInput<'_>,
    shared_secret: &SharedSecret,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1024);
    buf.put_str(input.client_version);
    buf.put_str(input.server_version);
    buf.put_string(input.client_kexinit);
    buf.put_string(input.server_kexinit);
    buf.put_string(input.host_key_blob);
    if algorithm.is_ecdh() {
        buf.put_string(input.client_public);
        buf.put_string(input.server_public);
    } else {
        buf.put_mpint_unsigned(input.client_public);
        buf.put_mpint_unsigned(input.server_public);
    }
    let k = shared_secret.to_mpint();

    algorithm.hash().digest(&[&buf, &k])
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...   truncated to `length`
/// ```
///
/// # Example
///
/// ```rust
/// use kestrel_proto::ssh::kex_dh::{derive_key, HashAlgorithm, SharedSecret};
///
/// let k = SharedSecret::new(vec![0x42; 32]);
/// let key = derive_key(HashAlgorithm::Sha256, &k, &[1; 32], b'C', &[2; 32], 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &SharedSecret,
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let k = shared_secret.to_mpint();
    let mut key = Zeroizing::new(hash.digest(&[&k, exchange_hash, &[letter], session_id]));

    while key.len() < length {
        let block = hash.digest(&[&k, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }

    key.truncate(length);
    key
}

/// The six keys of one key set (letters 'A' through 'F').
pub struct SessionKeys {
    /// Initial IV client to server
    pub iv_client_to_server: Zeroizing<Vec<u8>>,
    /// Initial IV server to client
    pub iv_server_to_client: Zeroizing<Vec<u8>>,
    /// Encryption key client to server
    pub enc_client_to_server: Zeroizing<Vec<u8>>,
    /// Encryption key server to client
    pub enc_server_to_client: Zeroizing<Vec<u8>>,
    /// Integrity key client to server
    pub mac_client_to_server: Zeroizing<Vec<u8>>,
    /// Integrity key server to client
    pub mac_server_to_client: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    /// Derives all six keys at the lengths `suite` needs.
    pub fn derive(
        suite: &AlgorithmSuite,
        shared_secret: &SharedSecret,
        exchange_hash: &[u8],
        session_id: &[u8],
    ) -> Self {
        let hash = suite.kex.hash();
        let c2s = suite.client_to_server;
        let s2c = suite.server_to_client;
        let derive = |letter: u8, length: usize| {
            derive_key(hash, shared_secret, exchange_hash, letter, session_id, length)
        };

        Self {
            iv_client_to_server: derive(b'A', c2s.cipher.iv_size()),
            iv_server_to_client: derive(b'B', s2c.cipher.iv_size()),
            enc_client_to_server: derive(b'C', c2s.cipher.key_size()),
            enc_server_to_client: derive(b'D', s2c.cipher.key_size()),
            mac_client_to_server: derive(b'E', c2s.mac.key_size()),
            mac_server_to_client: derive(b'F', s2c.mac.key_size()),
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(algorithm: KexAlgorithm) -> (SharedSecret, SharedSecret) {
        let client = EphemeralKey::generate(algorithm).unwrap();
        let server = EphemeralKey::generate(algorithm).unwrap();
        let client_public = client.public_value();
        let server_public = server.public_value();
        (
            client.agree(&server_public).unwrap(),
            server.agree(&client_public).unwrap(),
        )
    }

    #[test]
    fn test_names() {
        for alg in [
            KexAlgorithm::Curve25519Sha256,
            KexAlgorithm::Curve25519Sha256Libssh,
            KexAlgorithm::DhGroup14Sha256,
            KexAlgorithm::DhGroup14Sha1,
            KexAlgorithm::DhGroup1Sha1,
        ] {
            assert_eq!(KexAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(KexAlgorithm::from_name("ecdh-sha2-nistp256"), None);
        assert_eq!(KexAlgorithm::DhGroup1Sha1.hash(), HashAlgorithm::Sha1);
        assert_eq!(KexAlgorithm::Curve25519Sha256.hash(), HashAlgorithm::Sha256);
    }

    #[test]
    fn test_group_primes() {
        assert_eq!(GROUP1.prime.bits(), 1024);
        assert_eq!(GROUP14.prime.bits(), 2048);
        assert_eq!(
            hex::encode(&primes::GROUP14_PRIME[..8]),
            "ffffffffffffffff"
        );
    }

    #[test]
    fn test_dh_group1_agreement() {
        let (a, b) = exchange(KexAlgorithm::DhGroup1Sha1);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(!a.as_bytes().is_empty());
    }

    #[test]
    fn test_dh_group14_agreement() {
        let (a, b) = exchange(KexAlgorithm::DhGroup14Sha256);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_curve25519_agreement() {
        let (a, b) = exchange(KexAlgorithm::Curve25519Sha256);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_dh_rejects_out_of_range_peer_values() {
        let dh = DhExchange::new(&GROUP1);
        assert!(dh.compute_shared_secret(&[1]).is_err());
        assert!(dh.compute_shared_secret(&[0]).is_err());
        let p_minus_one = (&*GROUP1.prime - 1u32).to_bytes_be();
        assert!(dh.compute_shared_secret(&p_minus_one).is_err());
        assert!(dh.compute_shared_secret(&primes::GROUP1_PRIME).is_err());
    }

    #[test]
    fn test_curve25519_rejects_wrong_length() {
        let x = Curve25519Exchange::new().unwrap();
        assert!(x.compute_shared_secret(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_derive_key_follows_rfc_chaining() {
        let k = SharedSecret::new(vec![0x42; 32]);
        let h = [0x01u8; 20];
        let sid = [0x02u8; 20];

        let key = derive_key(HashAlgorithm::Sha1, &k, &h, b'C', &sid, 50);
        assert_eq!(key.len(), 50);

        let k_mpint = k.to_mpint();
        let k1 = HashAlgorithm::Sha1.digest(&[&k_mpint, &h, b"C", &sid]);
        let k2 = HashAlgorithm::Sha1.digest(&[&k_mpint, &h, &k1]);
        let k3 = HashAlgorithm::Sha1.digest(&[&k_mpint, &h, &k1, &k2]);
        let expected: Vec<u8> = [k1, k2, k3].concat();
        assert_eq!(&key[..], &expected[..50]);
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let k = SharedSecret::new(vec![0x42; 32]);
        let a = derive_key(HashAlgorithm::Sha256, &k, &[1; 32], b'A', &[2; 32], 16);
        let c = derive_key(HashAlgorithm::Sha256, &k, &[1; 32], b'C', &[2; 32], 16);
        assert_ne!(a, c);
        assert!(derive_key(HashAlgorithm::Sha256, &k, &[1; 32], b'E', &[2; 32], 0).is_empty());
    }

    #[test]
    fn test_shared_secret_mpint_padding() {
        let k = SharedSecret::new(vec![0x00, 0x80, 0x01]);
        assert_eq!(&k.to_mpint()[..], &[0, 0, 0, 3, 0x00, 0x80, 0x01]);
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let k = SharedSecret::new(vec![7; 32]);
        let base = ExchangeHashInput {
            client_version: "SSH-2.0-client",
            server_version: "SSH-2.0-server",
            client_kexinit: b"\x14client",
            server_kexinit: b"\x14server",
            host_key_blob: b"blob",
            client_public: &[1; 32],
            server_public: &[2; 32],
        };
        let h = compute_exchange_hash(KexAlgorithm::Curve25519Sha256, &base, &k);
        assert_eq!(h.len(), 32);

        let mut changed = base;
        changed.server_version = "SSH-2.0-other";
        assert_ne!(h, compute_exchange_hash(KexAlgorithm::Curve25519Sha256, &changed, &k));

        let sha1 = compute_exchange_hash(KexAlgorithm::DhGroup1Sha1, &base, &k);
        assert_eq!(sha1.len(), 20);
    }
}
