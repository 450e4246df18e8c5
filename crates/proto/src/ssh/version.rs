//! Identification exchange (RFC 4253 Section 4.2).
//!
//! Before any packet is framed each side sends one line:
//!
//! ```text
//! SSH-2.0-<software>[ <comments>]\r\n
//! ```
//!
//! The server writes its own line first and then reads the client's,
//! skipping any preamble lines that do not begin with `SSH-`. A line longer
//! than [`MAX_VERSION_LENGTH`], one containing NUL, or a protocol version
//! other than `2.0`/`1.99` ends the connection. The raw client line (without
//! CR LF) is kept because it feeds the exchange hash.
//!
//! ```rust
//! use kestrel_proto::ssh::version::Version;
//!
//! let ours = Version::new("Kestrel_0.1.0", Some("protocol core"));
//! assert_eq!(ours.to_string(), "SSH-2.0-Kestrel_0.1.0 protocol core");
//!
//! let theirs = Version::parse("SSH-1.99-PuTTY_Release_0.80").unwrap();
//! assert_eq!(theirs.software(), "PuTTY_Release_0.80");
//! ```

use kestrel_platform::{KestrelError, KestrelResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Longest identification line accepted, excluding CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines tolerated before the version line.
pub const MAX_PREAMBLE_LINES: usize = 32;

/// SSH protocol version string.
///
/// Keeps the exact identification line (without CR LF) because the exchange
/// hash covers it byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    raw: String,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use kestrel_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Kestrel_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let raw = match comments {
            Some(c) => format!("SSH-2.0-{} {}", software, c),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            raw,
        }
    }

    /// Returns the default Kestrel version string.
    pub fn default_kestrel() -> Self {
        Self::new(&format!("Kestrel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the line is too long, contains a
    /// null byte or does not start with "SSH-". Returns
    /// [`KestrelError::VersionNotSupported`] if the protocol version is not
    /// "2.0" (or the compatible "1.99").
    ///
    /// # Example
    ///
    /// ```rust
    /// use kestrel_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_8.9");
    /// ```
    pub fn parse(line: &str) -> KestrelResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KestrelError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KestrelError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(KestrelError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(KestrelError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KestrelError::VersionNotSupported(proto_version.to_string()));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            raw: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification line exactly as sent or received, without CR LF.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.raw).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reads the peer's identification line from `reader`.
///
/// Reads one byte at a time so nothing past the line feed is consumed; the
/// binary packet stream starts right after it. Lines that do not start with
/// "SSH-" are skipped, up to [`MAX_PREAMBLE_LINES`].
pub async fn read_identification<R>(reader: &mut R) -> KestrelResult<Version>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..=MAX_PREAMBLE_LINES {
        let mut line = Vec::with_capacity(64);
        loop {
            let byte = reader.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_VERSION_LENGTH + 1 {
                return Err(KestrelError::Protocol(format!(
                    "Identification line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if !line.starts_with(b"SSH-") {
            debug!(len = line.len(), "Skipping pre-identification line");
            continue;
        }

        let text = String::from_utf8(line).map_err(|_| {
            KestrelError::Protocol("Identification line is not valid UTF-8".to_string())
        })?;
        return Version::parse(&text);
    }

    Err(KestrelError::Protocol(format!(
        "No identification line within {} lines",
        MAX_PREAMBLE_LINES
    )))
}
