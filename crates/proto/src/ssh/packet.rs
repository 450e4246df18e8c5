//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - Total `packet_length` + 4 MUST be a multiple of max(8, cipher block size)
//! - Declared lengths above the configured maximum (35000 by default) are
//!   rejected before any buffer is allocated
//! - Minimum framed size: 16 bytes, not counting the MAC
//!
//! # Sealing order
//!
//! compress payload, pad, MAC over `sequence || plaintext packet`, encrypt
//! the whole packet (length field included), append MAC. Opening verifies
//! the MAC in constant time before the payload is decompressed.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::packet::Packet;
//!
//! let payload = b"SSH-MSG-KEXINIT payload";
//! let packet = Packet::new(payload.to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), payload);
//! ```

use super::algorithm::DirectionAlgorithms;
use super::compression::{Compressor, Decompressor};
use super::crypto::{DecryptionContext, EncryptionContext, MacKey};
use bytes::{Buf, BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use zeroize::Zeroize;

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum framed packet size, excluding the MAC.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Block size used for alignment when the cipher's is smaller.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Upper bound on a decompressed payload.
pub const MAX_UNCOMPRESSED_PAYLOAD: usize = 256 * 1024;

/// Number of random padding bytes for a payload of `payload_len` bytes.
///
/// The result is in `[4, 255]` and makes `4 + 1 + payload_len + padding` a
/// multiple of `block_size` (itself at least 8).
pub fn padding_length(payload_len: usize, block_size: usize) -> usize {
    let block = block_size.max(MIN_BLOCK_SIZE);
    let unpadded = 4 + 1 + payload_len;
    let mut padding = block - (unpadded % block);
    if padding < MIN_PADDING_LEN {
        padding += block;
    }
    padding
}

/// An unencrypted SSH binary packet.
///
/// Used before the first NEWKEYS and as the plain framing reference; the
/// keyed path goes through [`PacketWriter`] and [`PacketReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the 8-byte default block size.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, MIN_BLOCK_SIZE)
    }

    /// Creates a packet padded for `block_size`.
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> Self {
        let mut padding = vec![0u8; padding_length(payload.len(), block_size)];
        rand::thread_rng().fill_bytes(&mut padding);
        Self { payload, padding }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses one unencrypted packet with no MAC.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the packet is oversized,
    /// misaligned, or its padding is out of range, and
    /// [`KestrelError::TruncatedInput`] if `data` ends early.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        if data.len() < 5 {
            return Err(KestrelError::TruncatedInput {
                needed: 5,
                available: data.len(),
            });
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        check_packet_length(packet_length, MAX_PACKET_SIZE, MIN_BLOCK_SIZE)?;

        if buf.len() < packet_length {
            return Err(KestrelError::TruncatedInput {
                needed: packet_length,
                available: buf.len(),
            });
        }

        let (payload, padding) = split_body(&buf[..packet_length])?;
        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

fn check_packet_length(packet_length: usize, max: usize, block: usize) -> KestrelResult<()> {
    if packet_length > max {
        return Err(KestrelError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, max
        )));
    }
    if packet_length + 4 < MIN_PACKET_SIZE {
        return Err(KestrelError::Protocol(format!(
            "Packet too small: {} bytes",
            packet_length
        )));
    }
    if (packet_length + 4) % block != 0 {
        return Err(KestrelError::Protocol(format!(
            "Packet length {} not aligned to block size {}",
            packet_length, block
        )));
    }
    Ok(())
}

/// Splits `padding_length || payload || padding` into payload and padding.
fn split_body(body: &[u8]) -> KestrelResult<(&[u8], &[u8])> {
    let padding_length = body[0] as usize;
    if padding_length < MIN_PADDING_LEN {
        return Err(KestrelError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if body.len() < 1 + padding_length + 1 {
        return Err(KestrelError::Protocol(format!(
            "Padding length {} leaves no payload in a {} byte packet",
            padding_length,
            body.len()
        )));
    }
    let payload_end = body.len() - padding_length;
    Ok((&body[1..payload_end], &body[payload_end..]))
}

/// Outgoing cipher, MAC and compressor for one key set.
#[derive(Debug)]
pub struct SealingKeys {
    cipher: EncryptionContext,
    mac: MacKey,
    compressor: Compressor,
}

impl SealingKeys {
    /// Plaintext keys used until the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: EncryptionContext::none(),
            mac: MacKey::none(),
            compressor: Compressor::new(super::compression::CompressionAlgorithm::None),
        }
    }

    /// Builds keys for `algorithms` from derived material.
    pub fn new(
        algorithms: DirectionAlgorithms,
        iv: &[u8],
        key: &[u8],
        mac_key: &[u8],
    ) -> KestrelResult<Self> {
        Ok(Self {
            cipher: EncryptionContext::new(algorithms.cipher, key, iv)?,
            mac: MacKey::new(algorithms.mac, mac_key)?,
            compressor: Compressor::new(algorithms.compression),
        })
    }

    /// Starts a delayed compression algorithm.
    pub fn activate_compression(&mut self) {
        self.compressor.activate();
    }

    fn block_size(&self) -> usize {
        self.cipher.algorithm().block_size().max(MIN_BLOCK_SIZE)
    }
}

/// Incoming cipher, MAC and decompressor for one key set.
#[derive(Debug)]
pub struct OpeningKeys {
    cipher: DecryptionContext,
    mac: MacKey,
    decompressor: Decompressor,
}

impl OpeningKeys {
    /// Plaintext keys used until the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: DecryptionContext::none(),
            mac: MacKey::none(),
            decompressor: Decompressor::new(
                super::compression::CompressionAlgorithm::None,
                MAX_UNCOMPRESSED_PAYLOAD,
            ),
        }
    }

    /// Builds keys for `algorithms` from derived material.
    pub fn new(
        algorithms: DirectionAlgorithms,
        iv: &[u8],
        key: &[u8],
        mac_key: &[u8],
    ) -> KestrelResult<Self> {
        Ok(Self {
            cipher: DecryptionContext::new(algorithms.cipher, key, iv)?,
            mac: MacKey::new(algorithms.mac, mac_key)?,
            decompressor: Decompressor::new(algorithms.compression, MAX_UNCOMPRESSED_PAYLOAD),
        })
    }

    /// Starts a delayed compression algorithm.
    pub fn activate_compression(&mut self) {
        self.decompressor.activate();
    }

    fn block_size(&self) -> usize {
        self.cipher.algorithm().block_size().max(MIN_BLOCK_SIZE)
    }
}

/// Message ids that may be sent while a key exchange is in progress
/// (RFC 4253 Section 7.1).
fn allowed_during_kex(msg_id: u8) -> bool {
    matches!(msg_id, 1..=4 | 20..=49)
}

/// Sending half of the packet stream.
///
/// Owns the send sequence number. While a key exchange is running, payloads
/// from higher layers are held back and flushed after the new keys are in
/// place.
pub struct PacketWriter<W> {
    writer: W,
    keys: SealingKeys,
    sequence: u32,
    bytes_since_kex: u64,
    max_packet_size: usize,
    kex_in_progress: bool,
    deferred: VecDeque<Vec<u8>>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Creates a plaintext writer.
    pub fn new(writer: W, max_packet_size: usize) -> Self {
        Self {
            writer,
            keys: SealingKeys::none(),
            sequence: 0,
            bytes_since_kex: 0,
            max_packet_size,
            kex_in_progress: false,
            deferred: VecDeque::new(),
        }
    }

    /// Next send sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes written under the current keys.
    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    /// Whether a key exchange is holding back non-transport payloads.
    pub fn kex_in_progress(&self) -> bool {
        self.kex_in_progress
    }

    /// Writes raw bytes before the packet stream starts (identification line).
    pub async fn write_raw(&mut self, data: &[u8]) -> KestrelResult<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Seals one payload into wire bytes and advances the sequence number.
    fn seal(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>> {
        let compressed = self.keys.compressor.compress(payload)?;
        let block = self.keys.block_size();
        let padding_len = padding_length(compressed.len(), block);
        let packet_length = 1 + compressed.len() + padding_len;
        if packet_length > self.max_packet_size {
            return Err(KestrelError::Protocol(format!(
                "Outgoing packet of {} bytes exceeds maximum {}",
                packet_length, self.max_packet_size
            )));
        }

        let mac_size = self.keys.mac.mac_size();
        let mut buf = Vec::with_capacity(4 + packet_length + mac_size);
        buf.extend_from_slice(&(packet_length as u32).to_be_bytes());
        buf.push(padding_len as u8);
        buf.extend_from_slice(&compressed);
        let pad_start = buf.len();
        buf.resize(pad_start + padding_len, 0);
        rand::thread_rng().fill_bytes(&mut buf[pad_start..]);

        let mac = self.keys.mac.compute(self.sequence, &buf);
        self.keys.cipher.encrypt(&mut buf)?;
        buf.extend_from_slice(&mac);

        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_kex += buf.len() as u64;
        Ok(buf)
    }

    async fn send_now(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let wire = self.seal(payload)?;
        trace!(
            msg_id = payload.first().copied().unwrap_or(0),
            len = wire.len(),
            seq = self.sequence.wrapping_sub(1),
            "Sent packet"
        );
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends one payload, or defers it if a key exchange is in progress and
    /// the message is not a transport message.
    pub async fn write_payload(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let msg_id = match payload.first() {
            Some(&id) => id,
            None => return Err(KestrelError::Protocol("Empty payload".to_string())),
        };
        if self.kex_in_progress && !allowed_during_kex(msg_id) {
            self.deferred.push_back(payload.to_vec());
            return Ok(());
        }
        self.send_now(payload).await
    }

    /// Marks the start of a key exchange.
    pub fn begin_kex(&mut self) {
        self.kex_in_progress = true;
    }

    /// Sends NEWKEYS under the old keys, switches to `keys` and flushes any
    /// deferred payloads under the new ones.
    pub async fn send_newkeys(&mut self, newkeys: &[u8], keys: SealingKeys) -> KestrelResult<()> {
        self.send_now(newkeys).await?;
        self.keys = keys;
        self.bytes_since_kex = 0;
        self.kex_in_progress = false;
        while let Some(payload) = self.deferred.pop_front() {
            self.send_now(&payload).await?;
        }
        Ok(())
    }

    /// Starts a delayed compression algorithm.
    pub fn activate_compression(&mut self) {
        self.keys.activate_compression();
    }

    /// Replaces the key set with plaintext and drops deferred payloads.
    pub fn clear_keys(&mut self) {
        self.keys = SealingKeys::none();
        for payload in self.deferred.iter_mut() {
            payload.zeroize();
        }
        self.deferred.clear();
    }

    /// Shuts down the underlying writer.
    pub async fn shutdown(&mut self) -> KestrelResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A received, authenticated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Receive sequence number of this packet
    pub sequence: u32,
    /// Decompressed payload
    pub payload: Vec<u8>,
}

/// Receiving half of the packet stream.
pub struct PacketReader<R> {
    reader: R,
    keys: OpeningKeys,
    sequence: u32,
    bytes_since_kex: u64,
    max_packet_size: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Creates a plaintext reader.
    pub fn new(reader: R, max_packet_size: usize) -> Self {
        Self {
            reader,
            keys: OpeningKeys::none(),
            sequence: 0,
            bytes_since_kex: 0,
            max_packet_size,
        }
    }

    /// Next receive sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes read under the current keys.
    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    /// The raw reader, for the identification exchange.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Switches to a new key set after NEWKEYS was received.
    pub fn set_keys(&mut self, keys: OpeningKeys) {
        self.keys = keys;
        self.bytes_since_kex = 0;
    }

    /// Starts a delayed compression algorithm.
    pub fn activate_compression(&mut self) {
        self.keys.activate_compression();
    }

    /// Replaces the key set with plaintext.
    pub fn clear_keys(&mut self) {
        self.keys = OpeningKeys::none();
    }

    /// Reads, decrypts and verifies one packet.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Protocol`] for an oversized, misaligned or badly
    ///   padded packet (checked before the body is allocated)
    /// - [`KestrelError::Mac`] if the MAC does not verify
    /// - [`KestrelError::Compression`] if the payload does not inflate
    /// - [`KestrelError::Io`] if the stream ends
    pub async fn read_packet(&mut self) -> KestrelResult<InboundPacket> {
        let block = self.keys.block_size();

        let mut first = [0u8; 32];
        let first = &mut first[..block];
        self.reader.read_exact(first).await?;
        self.keys.cipher.decrypt(first)?;

        let packet_length = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
        check_packet_length(packet_length, self.max_packet_size, block)?;

        let total = 4 + packet_length;
        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(first);
        first.zeroize();
        packet.resize(total, 0);
        self.reader.read_exact(&mut packet[block..]).await?;
        self.keys.cipher.decrypt(&mut packet[block..])?;

        let mac_size = self.keys.mac.mac_size();
        if mac_size > 0 {
            let mut mac = [0u8; 64];
            let mac = &mut mac[..mac_size];
            self.reader.read_exact(mac).await?;
            self.keys.mac.verify(self.sequence, &packet, mac)?;
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_kex += (total + mac_size) as u64;

        let result = split_body(&packet[4..])
            .and_then(|(payload, _)| self.keys.decompressor.decompress(payload));
        packet.zeroize();
        let payload = result?;

        trace!(
            msg_id = payload.first().copied().unwrap_or(0),
            seq = sequence,
            "Received packet"
        );
        Ok(InboundPacket { sequence, payload })
    }
}
