//! SSH cryptographic operations.
//!
//! This module implements the per-direction cipher and MAC contexts used by
//! the packet codec:
//! - AES-128/256-CTR (RFC 4344)
//! - AES-128/256-CBC (RFC 4253)
//! - HMAC-SHA1, HMAC-SHA256, HMAC-SHA512 (RFC 4253, RFC 6668)
//! - `none` for both, active until the first NEWKEYS
//!
//! Cipher contexts are stateful: CBC chains its IV and CTR keeps its counter
//! across packets, so each direction owns exactly one context for the life
//! of a key set.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::crypto::{CipherAlgorithm, DecryptionContext, EncryptionContext};
//!
//! let key = [0x11u8; 16];
//! let iv = [0x22u8; 16];
//! let mut enc = EncryptionContext::new(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();
//! let mut dec = DecryptionContext::new(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();
//!
//! let mut block = *b"sixteen byte msg";
//! enc.encrypt(&mut block).unwrap();
//! dec.decrypt(&mut block).unwrap();
//! assert_eq!(&block, b"sixteen byte msg");
//! ```

use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use kestrel_platform::{KestrelError, KestrelResult};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// No encryption
    None,
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// AES-256 in CBC mode
    Aes256Cbc,
    /// AES-128 in CTR mode
    Aes128Ctr,
    /// AES-256 in CTR mode
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Cbc | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Cbc | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            _ => 16,
        }
    }

    /// Cipher block size; `none` counts as 8 for padding purposes.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 8,
            _ => 16,
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }
}

fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KestrelResult<()> {
    if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
        return Err(KestrelError::Crypto(format!(
            "Insufficient key material for {}: key {} of {}, iv {} of {}",
            algorithm.name(),
            key.len(),
            algorithm.key_size(),
            iv.len(),
            algorithm.iv_size()
        )));
    }
    Ok(())
}

fn invalid_length(_: cipher::InvalidLength) -> KestrelError {
    KestrelError::Crypto("Invalid cipher key or IV length".to_string())
}

fn check_blocks(algorithm: CipherAlgorithm, data: &[u8]) -> KestrelResult<()> {
    if data.len() % algorithm.block_size() != 0 {
        return Err(KestrelError::Crypto(format!(
            "{} bytes is not a multiple of the {} block size",
            data.len(),
            algorithm.name()
        )));
    }
    Ok(())
}

enum EncryptState {
    None,
    Aes128Cbc(Aes128CbcEnc),
    Aes256Cbc(Aes256CbcEnc),
    Aes128Ctr(Aes128Ctr),
    Aes256Ctr(Aes256Ctr),
}

/// Outgoing cipher context.
pub struct EncryptionContext {
    algorithm: CipherAlgorithm,
    state: EncryptState,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EncryptionContext {
    /// The pass-through context used before the first key exchange.
    pub fn none() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            state: EncryptState::None,
        }
    }

    /// Creates a context from derived key and IV material.
    ///
    /// Longer material is truncated to the algorithm's sizes.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KestrelResult<Self> {
        check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let state = match algorithm {
            CipherAlgorithm::None => EncryptState::None,
            CipherAlgorithm::Aes128Cbc => {
                EncryptState::Aes128Cbc(Aes128CbcEnc::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes256Cbc => {
                EncryptState::Aes256Cbc(Aes256CbcEnc::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes128Ctr => {
                EncryptState::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes256Ctr => {
                EncryptState::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).map_err(invalid_length)?)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Encrypts whole blocks in place.
    pub fn encrypt(&mut self, data: &mut [u8]) -> KestrelResult<()> {
        check_blocks(self.algorithm, data)?;
        match &mut self.state {
            EncryptState::None => {}
            EncryptState::Aes128Cbc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            EncryptState::Aes256Cbc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            EncryptState::Aes128Ctr(c) => c.apply_keystream(data),
            EncryptState::Aes256Ctr(c) => c.apply_keystream(data),
        }
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

enum DecryptState {
    None,
    Aes128Cbc(Aes128CbcDec),
    Aes256Cbc(Aes256CbcDec),
    Aes128Ctr(Aes128Ctr),
    Aes256Ctr(Aes256Ctr),
}

/// Incoming cipher context.
pub struct DecryptionContext {
    algorithm: CipherAlgorithm,
    state: DecryptState,
}

impl std::fmt::Debug for DecryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionContext")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DecryptionContext {
    /// The pass-through context used before the first key exchange.
    pub fn none() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            state: DecryptState::None,
        }
    }

    /// Creates a context from derived key and IV material.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KestrelResult<Self> {
        check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let state = match algorithm {
            CipherAlgorithm::None => DecryptState::None,
            CipherAlgorithm::Aes128Cbc => {
                DecryptState::Aes128Cbc(Aes128CbcDec::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes256Cbc => {
                DecryptState::Aes256Cbc(Aes256CbcDec::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes128Ctr => {
                DecryptState::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).map_err(invalid_length)?)
            }
            CipherAlgorithm::Aes256Ctr => {
                DecryptState::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).map_err(invalid_length)?)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Decrypts whole blocks in place.
    pub fn decrypt(&mut self, data: &mut [u8]) -> KestrelResult<()> {
        check_blocks(self.algorithm, data)?;
        match &mut self.state {
            DecryptState::None => {}
            DecryptState::Aes128Cbc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            DecryptState::Aes256Cbc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            DecryptState::Aes128Ctr(c) => c.apply_keystream(data),
            DecryptState::Aes256Ctr(c) => c.apply_keystream(data),
        }
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// MAC algorithm for SSH packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// No MAC
    None,
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::None => "none",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::None => 0,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(MacAlgorithm::None),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum MacState {
    None,
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// Keyed MAC for one direction.
///
/// The sequence number is supplied per call; it belongs to the session and
/// keeps counting across key changes.
#[derive(Clone)]
pub struct MacKey {
    algorithm: MacAlgorithm,
    state: MacState,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// The no-op MAC used before the first key exchange.
    pub fn none() -> Self {
        Self {
            algorithm: MacAlgorithm::None,
            state: MacState::None,
        }
    }

    /// Creates a new MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KestrelResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KestrelError::Crypto(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        let key = &key_material[..algorithm.key_size()];
        let bad_key = |_| KestrelError::Crypto("Invalid HMAC key".to_string());

        let state = match algorithm {
            MacAlgorithm::None => MacState::None,
            MacAlgorithm::HmacSha1 => MacState::Sha1(Hmac::new_from_slice(key).map_err(bad_key)?),
            MacAlgorithm::HmacSha256 => {
                MacState::Sha256(Hmac::new_from_slice(key).map_err(bad_key)?)
            }
            MacAlgorithm::HmacSha512 => {
                MacState::Sha512(Hmac::new_from_slice(key).map_err(bad_key)?)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Computes `MAC(key, sequence_number || unencrypted_packet)`.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        fn run<M: Mac + Clone>(mac: &M, sequence: u32, packet: &[u8]) -> Vec<u8> {
            let mut mac = mac.clone();
            mac.update(&sequence.to_be_bytes());
            mac.update(packet);
            mac.finalize().into_bytes().to_vec()
        }

        match &self.state {
            MacState::None => Vec::new(),
            MacState::Sha1(m) => run(m, sequence, packet),
            MacState::Sha256(m) => run(m, sequence, packet),
            MacState::Sha512(m) => run(m, sequence, packet),
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received_mac: &[u8]) -> KestrelResult<()> {
        let computed = self.compute(sequence, packet);
        if computed.len() != received_mac.len() {
            return Err(KestrelError::Mac);
        }
        if computed.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(KestrelError::Mac)
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Bytes appended to each packet.
    pub fn mac_size(&self) -> usize {
        self.algorithm.mac_size()
    }
}
