//! Payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` compresses from the first packet after NEWKEYS; `zlib@openssh.com`
//! waits until user authentication has succeeded. Each direction keeps one
//! zlib stream for the life of its key set and flushes at every packet
//! boundary, so a packet can always be decoded on its own arrival.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use kestrel_platform::{KestrelError, KestrelResult};

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// none
    None,
    /// zlib
    Zlib,
    /// zlib@openssh.com (delayed until authentication)
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    fn starts_active(&self) -> bool {
        matches!(self, CompressionAlgorithm::Zlib)
    }
}

fn compression_error(e: impl std::fmt::Display) -> KestrelError {
    KestrelError::Compression(e.to_string())
}

/// Outgoing payload compressor.
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    stream: Option<Compress>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.stream.is_some())
            .finish()
    }
}

impl Compressor {
    /// Creates a compressor; delayed algorithms start inactive.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let stream = algorithm
            .starts_active()
            .then(|| Compress::new(Compression::default(), true));
        Self { algorithm, stream }
    }

    /// Starts a delayed algorithm. No effect for `none` or if already active.
    pub fn activate(&mut self) {
        if self.algorithm != CompressionAlgorithm::None && self.stream.is_none() {
            self.stream = Some(Compress::new(Compression::default(), true));
        }
    }

    /// Whether payloads are currently being compressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Compresses one payload, ending on a flush boundary.
    pub fn compress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(payload.to_vec()),
        };

        let start = stream.total_in();
        let mut out = Vec::with_capacity(payload.len() / 2 + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            stream
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Partial)
                .map_err(compression_error)?;
            let consumed = (stream.total_in() - start) as usize;
            if consumed == payload.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

/// Incoming payload decompressor.
pub struct Decompressor {
    algorithm: CompressionAlgorithm,
    stream: Option<Decompress>,
    max_output: usize,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.stream.is_some())
            .finish()
    }
}

impl Decompressor {
    /// Creates a decompressor that refuses to inflate past `max_output` bytes.
    pub fn new(algorithm: CompressionAlgorithm, max_output: usize) -> Self {
        let stream = algorithm.starts_active().then(|| Decompress::new(true));
        Self {
            algorithm,
            stream,
            max_output,
        }
    }

    /// Starts a delayed algorithm.
    pub fn activate(&mut self) {
        if self.algorithm != CompressionAlgorithm::None && self.stream.is_none() {
            self.stream = Some(Decompress::new(true));
        }
    }

    /// Whether payloads are currently being decompressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Decompresses one payload.
    pub fn decompress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(payload.to_vec()),
        };

        let start = stream.total_in();
        let mut out = Vec::with_capacity(payload.len() * 2 + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            let status = stream
                .decompress_vec(&payload[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(compression_error)?;
            if out.len() > self.max_output {
                return Err(KestrelError::Compression(format!(
                    "Decompressed payload exceeds {} bytes",
                    self.max_output
                )));
            }
            let consumed = (stream.total_in() - start) as usize;
            if status == Status::StreamEnd
                || (consumed == payload.len() && out.len() < out.capacity())
            {
                return Ok(out);
            }
            if status == Status::BufError && consumed == payload.len() {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        for alg in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::ZlibOpenssh,
        ] {
            assert_eq!(CompressionAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(CompressionAlgorithm::from_name("lz4"), None);
    }

    #[test]
    fn test_none_is_identity() {
        let mut c = Compressor::new(CompressionAlgorithm::None);
        c.activate();
        assert!(!c.is_active());
        assert_eq!(c.compress(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_zlib_stream_across_packets() {
        let mut c = Compressor::new(CompressionAlgorithm::Zlib);
        let mut d = Decompressor::new(CompressionAlgorithm::Zlib, 1 << 20);

        let payloads: Vec<Vec<u8>> = vec![
            b"first packet payload".to_vec(),
            vec![b'a'; 10_000],
            Vec::new(),
            (0..=255u8).cycle().take(4096).collect(),
        ];
        for payload in &payloads {
            let compressed = c.compress(payload).unwrap();
            assert_eq!(&d.decompress(&compressed).unwrap(), payload);
        }
    }

    #[test]
    fn test_delayed_compression_waits_for_activation() {
        let mut c = Compressor::new(CompressionAlgorithm::ZlibOpenssh);
        let mut d = Decompressor::new(CompressionAlgorithm::ZlibOpenssh, 1 << 20);
        assert!(!c.is_active());
        assert_eq!(c.compress(b"plain").unwrap(), b"plain");

        c.activate();
        d.activate();
        let compressed = c.compress(&[b'z'; 2048]).unwrap();
        assert!(compressed.len() < 2048);
        assert_eq!(d.decompress(&compressed).unwrap(), vec![b'z'; 2048]);
    }

    #[test]
    fn test_decompression_limit() {
        let mut c = Compressor::new(CompressionAlgorithm::Zlib);
        let mut d = Decompressor::new(CompressionAlgorithm::Zlib, 1000);
        let compressed = c.compress(&[0u8; 100_000]).unwrap();
        assert!(matches!(
            d.decompress(&compressed),
            Err(KestrelError::Compression(_))
        ));
    }

    #[test]
    fn test_garbage_input_fails() {
        let mut d = Decompressor::new(CompressionAlgorithm::Zlib, 1 << 20);
        assert!(d.decompress(&[0xff; 32]).is_err());
    }
}
