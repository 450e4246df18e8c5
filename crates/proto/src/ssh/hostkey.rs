//! SSH Host Key Algorithms
//!
//! This module implements host key algorithms for SSH server authentication
//! according to RFC 4253 Section 6.6, plus verification of client public keys
//! for the `publickey` and `hostbased` authentication methods.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//! - `rsa-sha2-256` / `rsa-sha2-512` - RSA PKCS#1 v1.5 with SHA-2 (RFC 8332)
//! - `ssh-rsa` - RSA PKCS#1 v1.5 with SHA-1, kept for legacy peers
//!
//! One RSA key serves all three RSA signature algorithms; the key blob is
//! always of type `ssh-rsa`.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, PublicKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(HostKeyAlgorithm::SshEd25519, b"data to sign")?;
//!
//! let public = PublicKey::from_blob(&blob)?;
//! assert!(public.verify(b"data to sign", &signature)?);
//! # Ok(())
//! # }
//! ```

use super::wire::{SshReader, SshWrite};
use bytes::BytesMut;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use kestrel_platform::{KestrelError, KestrelResult};
use rsa::pkcs1v15::{
    Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey,
};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use signature::{SignatureEncoding, Signer, Verifier};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Smallest RSA modulus accepted from peers and for generated keys.
pub const MIN_RSA_BITS: usize = 1024;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-256
    RsaSha2_256,
    /// rsa-sha2-512
    RsaSha2_512,
    /// ssh-rsa (SHA-1 signatures)
    SshRsa,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            _ => None,
        }
    }

    /// Key blob type that carries keys for this signature algorithm.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            _ => "ssh-rsa",
        }
    }
}

/// Trait for host key operations
pub trait HostKey: Send + Sync {
    /// Signature algorithms this key can produce, most preferred first.
    fn algorithms(&self) -> Vec<HostKeyAlgorithm>;

    /// Public key in SSH wire format (`K_S` in the exchange hash).
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature in SSH wire format:
    /// `string algorithm_name, string signature`.
    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> KestrelResult<Vec<u8>>;

    /// Whether this key can sign with `algorithm`.
    fn supports(&self, algorithm: HostKeyAlgorithm) -> bool {
        self.algorithms().contains(&algorithm)
    }
}

fn signature_blob(algorithm: HostKeyAlgorithm, raw: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_str(algorithm.name());
    buf.put_string(raw);
    buf.to_vec()
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> KestrelResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Self::from_bytes(&*secret_bytes)
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> KestrelResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            KestrelError::Crypto("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let key_bytes = Zeroizing::new(key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![HostKeyAlgorithm::SshEd25519]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> KestrelResult<Vec<u8>> {
        if algorithm != HostKeyAlgorithm::SshEd25519 {
            return Err(KestrelError::Crypto(format!(
                "Ed25519 key cannot sign with {}",
                algorithm.name()
            )));
        }
        let signature = self.signing_key.sign(data);
        Ok(signature_blob(algorithm, &signature.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// RSA host key serving `rsa-sha2-256`, `rsa-sha2-512` and `ssh-rsa`.
#[derive(Clone)]
pub struct RsaHostKey {
    private_key: RsaPrivateKey,
}

impl RsaHostKey {
    /// Generate a fresh key with a `bits`-bit modulus.
    pub fn generate(bits: usize) -> KestrelResult<Self> {
        if bits < MIN_RSA_BITS {
            return Err(KestrelError::Config(format!(
                "RSA key size {} below minimum {}",
                bits, MIN_RSA_BITS
            )));
        }
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| KestrelError::Crypto(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { private_key })
    }

    /// Create from a PKCS#8 DER-encoded private key.
    pub fn from_pkcs8_der(der: &[u8]) -> KestrelResult<Self> {
        use rsa::pkcs8::DecodePrivateKey;

        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| KestrelError::Crypto(format!("Invalid RSA private key: {}", e)))?;
        Ok(Self { private_key })
    }

    /// Wrap an existing key.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.private_key.size() * 8
    }
}

impl HostKey for RsaHostKey {
    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
            HostKeyAlgorithm::SshRsa,
        ]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_str("ssh-rsa");
        buf.put_mpint_unsigned(&self.private_key.e().to_bytes_be());
        buf.put_mpint_unsigned(&self.private_key.n().to_bytes_be());
        buf.to_vec()
    }

    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let raw = match algorithm {
            HostKeyAlgorithm::SshRsa => RsaSigningKey::<Sha1>::new(self.private_key.clone())
                .try_sign(data)
                .map(|s| s.to_vec()),
            HostKeyAlgorithm::RsaSha2_256 => {
                RsaSigningKey::<Sha256>::new(self.private_key.clone())
                    .try_sign(data)
                    .map(|s| s.to_vec())
            }
            HostKeyAlgorithm::RsaSha2_512 => {
                RsaSigningKey::<Sha512>::new(self.private_key.clone())
                    .try_sign(data)
                    .map(|s| s.to_vec())
            }
            HostKeyAlgorithm::SshEd25519 => {
                return Err(KestrelError::Crypto(
                    "RSA key cannot sign with ssh-ed25519".to_string(),
                ))
            }
        }
        .map_err(|e| KestrelError::Crypto(format!("RSA signing failed: {}", e)))?;

        Ok(signature_blob(algorithm, &raw))
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaHostKey")
            .field("algorithm", &"ssh-rsa")
            .field("key_size_bits", &self.bits())
            .finish_non_exhaustive()
    }
}

/// A peer's public key parsed from its SSH wire blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// ssh-ed25519
    Ed25519(VerifyingKey),
    /// ssh-rsa
    Rsa(RsaPublicKey),
}

impl PublicKey {
    /// Parses `string key_type, key data...`.
    pub fn from_blob(blob: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(blob);
        let key_type = reader.read_string()?;
        match key_type {
            b"ssh-ed25519" => {
                let raw = reader.read_string()?;
                let bytes: [u8; 32] = raw.try_into().map_err(|_| {
                    KestrelError::Crypto("Ed25519 public key must be 32 bytes".to_string())
                })?;
                let key = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KestrelError::Crypto(format!("Invalid Ed25519 key: {}", e)))?;
                Ok(PublicKey::Ed25519(key))
            }
            b"ssh-rsa" => {
                let e = reader.read_mpint_unsigned()?;
                let n = reader.read_mpint_unsigned()?;
                let key = RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(n),
                    rsa::BigUint::from_bytes_be(e),
                )
                .map_err(|e| KestrelError::Crypto(format!("Invalid RSA key: {}", e)))?;
                if key.size() * 8 < MIN_RSA_BITS {
                    return Err(KestrelError::Crypto(format!(
                        "RSA key too small: {} bits",
                        key.size() * 8
                    )));
                }
                Ok(PublicKey::Rsa(key))
            }
            other => Err(KestrelError::Crypto(format!(
                "Unsupported public key type: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Key blob type name.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa(_) => "ssh-rsa",
        }
    }

    /// Whether signatures of `algorithm` can be made by this kind of key.
    pub fn accepts(&self, algorithm: HostKeyAlgorithm) -> bool {
        algorithm.key_type() == self.key_type()
    }

    /// Verifies an SSH signature blob (`string alg, string sig`) over `data`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> KestrelResult<bool> {
        let mut reader = SshReader::new(signature);
        let alg_name = reader.read_utf8()?;
        let raw = reader.read_string()?;

        let algorithm = HostKeyAlgorithm::from_name(&alg_name).ok_or_else(|| {
            KestrelError::Crypto(format!("Unknown signature algorithm: {}", alg_name))
        })?;
        if !self.accepts(algorithm) {
            return Ok(false);
        }

        let ok = match self {
            PublicKey::Ed25519(key) => {
                let bytes: [u8; 64] = match raw.try_into() {
                    Ok(b) => b,
                    Err(_) => return Ok(false),
                };
                key.verify(data, &Signature::from_bytes(&bytes)).is_ok()
            }
            PublicKey::Rsa(key) => {
                let sig = match RsaSignature::try_from(raw) {
                    Ok(sig) => sig,
                    Err(_) => return Ok(false),
                };
                match algorithm {
                    HostKeyAlgorithm::SshRsa => RsaVerifyingKey::<Sha1>::new(key.clone())
                        .verify(data, &sig)
                        .is_ok(),
                    HostKeyAlgorithm::RsaSha2_256 => {
                        RsaVerifyingKey::<Sha256>::new(key.clone())
                            .verify(data, &sig)
                            .is_ok()
                    }
                    HostKeyAlgorithm::RsaSha2_512 => {
                        RsaVerifyingKey::<Sha512>::new(key.clone())
                            .verify(data, &sig)
                            .is_ok()
                    }
                    HostKeyAlgorithm::SshEd25519 => false,
                }
            }
        };
        Ok(ok)
    }
}

/// The host keys a server signs with, most preferred first.
#[derive(Clone, Default)]
pub struct HostKeySet {
    keys: Vec<Arc<dyn HostKey>>,
}

impl HostKeySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key.
    pub fn with_key(mut self, key: impl HostKey + 'static) -> Self {
        self.keys.push(Arc::new(key));
        self
    }

    /// Adds a shared key.
    pub fn push(&mut self, key: Arc<dyn HostKey>) {
        self.keys.push(key);
    }

    /// Whether no key is loaded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Every signature algorithm some key can produce.
    pub fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        let mut algs = Vec::new();
        for alg in self.keys.iter().flat_map(|k| k.algorithms()) {
            if !algs.contains(&alg) {
                algs.push(alg);
            }
        }
        algs
    }

    /// The first key able to sign with `algorithm`.
    pub fn key_for(&self, algorithm: HostKeyAlgorithm) -> Option<&dyn HostKey> {
        self.keys
            .iter()
            .find(|k| k.supports(algorithm))
            .map(|k| k.as_ref())
    }
}

impl std::fmt::Debug for HostKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeySet")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    // Key generation is slow in debug builds; share one key across tests.
    static RSA_KEY: Lazy<RsaHostKey> = Lazy::new(|| RsaHostKey::generate(1024).unwrap());

    #[test]
    fn test_algorithm_names() {
        for alg in [
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
            HostKeyAlgorithm::SshRsa,
        ] {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::from_name("ecdsa-sha2-nistp256"), None);
        assert_eq!(HostKeyAlgorithm::RsaSha2_256.key_type(), "ssh-rsa");
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        let public = PublicKey::from_blob(&key.public_key_blob()).unwrap();

        let sig = key.sign(HostKeyAlgorithm::SshEd25519, b"exchange hash").unwrap();
        assert!(public.verify(b"exchange hash", &sig).unwrap());
        assert!(!public.verify(b"other data", &sig).unwrap());
    }

    #[test]
    fn test_ed25519_rejects_rsa_algorithm() {
        let key = Ed25519HostKey::generate().unwrap();
        assert!(key.sign(HostKeyAlgorithm::SshRsa, b"x").is_err());
        assert!(!key.supports(HostKeyAlgorithm::RsaSha2_256));
    }

    #[test]
    fn test_ed25519_from_bytes_is_deterministic() {
        let a = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_blob(), b.public_key_blob());
        assert!(Ed25519HostKey::from_bytes(&[7u8; 31]).is_err());
    }

    #[test]
    fn test_ed25519_public_key_blob_layout() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let mut reader = SshReader::new(&blob);
        assert_eq!(reader.read_string().unwrap(), b"ssh-ed25519");
        assert_eq!(reader.read_string().unwrap().len(), 32);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_rsa_all_algorithms_verify() {
        let key = &*RSA_KEY;
        let public = PublicKey::from_blob(&key.public_key_blob()).unwrap();
        assert_eq!(public.key_type(), "ssh-rsa");

        for alg in key.algorithms() {
            let sig = key.sign(alg, b"payload").unwrap();
            let mut reader = SshReader::new(&sig);
            assert_eq!(reader.read_utf8().unwrap(), alg.name());
            assert_eq!(reader.read_string().unwrap().len(), 128);
            assert!(public.verify(b"payload", &sig).unwrap(), "{}", alg.name());
            assert!(!public.verify(b"tampered", &sig).unwrap());
        }
    }

    #[test]
    fn test_signature_for_wrong_key_type_fails() {
        let ed = Ed25519HostKey::generate().unwrap();
        let rsa_public = PublicKey::from_blob(&RSA_KEY.public_key_blob()).unwrap();
        let sig = ed.sign(HostKeyAlgorithm::SshEd25519, b"data").unwrap();
        assert!(!rsa_public.verify(b"data", &sig).unwrap());
    }

    #[test]
    fn test_unknown_key_type() {
        let mut buf = BytesMut::new();
        buf.put_str("ecdsa-sha2-nistp256");
        buf.put_string(&[0u8; 65]);
        assert!(PublicKey::from_blob(&buf).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = Ed25519HostKey::from_bytes(&[9u8; 32]).unwrap();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("Ed25519HostKey"));
        assert!(!debug_str.contains(&hex::encode([9u8; 32])));
        assert!(format!("{:?}", *RSA_KEY).contains("key_size_bits: 1024"));
    }

    #[test]
    fn test_host_key_set_lookup() {
        let set = HostKeySet::new()
            .with_key(Ed25519HostKey::generate().unwrap())
            .with_key(RSA_KEY.clone());
        assert_eq!(
            set.algorithms(),
            vec![
                HostKeyAlgorithm::SshEd25519,
                HostKeyAlgorithm::RsaSha2_256,
                HostKeyAlgorithm::RsaSha2_512,
                HostKeyAlgorithm::SshRsa,
            ]
        );
        let rsa = set.key_for(HostKeyAlgorithm::SshRsa).unwrap();
        assert_eq!(rsa.public_key_blob(), RSA_KEY.public_key_blob());
        assert!(HostKeySet::new().key_for(HostKeyAlgorithm::SshEd25519).is_none());
    }
}
