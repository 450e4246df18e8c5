//! Algorithm registry and negotiation (RFC 4253 Section 7.1).
//!
//! An [`AlgorithmRegistry`] is the ordered, immutable capability table a
//! listener is built with. Each session advertises it in its KEXINIT and
//! [`negotiate`] picks one [`AlgorithmSuite`] from the two proposals: for
//! every category the first client name the server also lists wins.

use super::compression::CompressionAlgorithm;
use super::crypto::{CipherAlgorithm, MacAlgorithm};
use super::hostkey::HostKeyAlgorithm;
use super::kex::KexInit;
use super::kex_dh::KexAlgorithm;
use kestrel_platform::{KestrelError, KestrelResult};

/// Ordered algorithm preferences, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmRegistry {
    kex: Vec<KexAlgorithm>,
    host_key: Vec<HostKeyAlgorithm>,
    cipher: Vec<CipherAlgorithm>,
    mac: Vec<MacAlgorithm>,
    compression: Vec<CompressionAlgorithm>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self {
            kex: vec![
                KexAlgorithm::Curve25519Sha256,
                KexAlgorithm::Curve25519Sha256Libssh,
                KexAlgorithm::DhGroup14Sha256,
                KexAlgorithm::DhGroup14Sha1,
            ],
            host_key: vec![
                HostKeyAlgorithm::SshEd25519,
                HostKeyAlgorithm::RsaSha2_256,
                HostKeyAlgorithm::RsaSha2_512,
                HostKeyAlgorithm::SshRsa,
            ],
            cipher: vec![
                CipherAlgorithm::Aes256Ctr,
                CipherAlgorithm::Aes128Ctr,
                CipherAlgorithm::Aes256Cbc,
                CipherAlgorithm::Aes128Cbc,
            ],
            mac: vec![
                MacAlgorithm::HmacSha256,
                MacAlgorithm::HmacSha512,
                MacAlgorithm::HmacSha1,
            ],
            compression: vec![
                CompressionAlgorithm::None,
                CompressionAlgorithm::ZlibOpenssh,
                CompressionAlgorithm::Zlib,
            ],
        }
    }
}

impl AlgorithmRegistry {
    /// The minimal legacy suite: group1 DH, `ssh-rsa`, `aes128-cbc`,
    /// `hmac-sha1`, no compression.
    pub fn legacy() -> Self {
        Self {
            kex: vec![KexAlgorithm::DhGroup1Sha1],
            host_key: vec![HostKeyAlgorithm::SshRsa],
            cipher: vec![CipherAlgorithm::Aes128Cbc],
            mac: vec![MacAlgorithm::HmacSha1],
            compression: vec![CompressionAlgorithm::None],
        }
    }

    /// Replaces the key exchange preferences.
    pub fn with_kex(mut self, kex: Vec<KexAlgorithm>) -> Self {
        self.kex = kex;
        self
    }

    /// Replaces the host key preferences.
    pub fn with_host_keys(mut self, host_key: Vec<HostKeyAlgorithm>) -> Self {
        self.host_key = host_key;
        self
    }

    /// Replaces the cipher preferences (both directions).
    pub fn with_ciphers(mut self, cipher: Vec<CipherAlgorithm>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Replaces the MAC preferences (both directions).
    pub fn with_macs(mut self, mac: Vec<MacAlgorithm>) -> Self {
        self.mac = mac;
        self
    }

    /// Replaces the compression preferences (both directions).
    pub fn with_compression(mut self, compression: Vec<CompressionAlgorithm>) -> Self {
        self.compression = compression;
        self
    }

    /// Fails if any mandatory category is empty.
    pub fn validate(&self) -> KestrelResult<()> {
        let empty = [
            ("kex", self.kex.is_empty()),
            ("host key", self.host_key.is_empty()),
            ("encryption", self.cipher.is_empty()),
            ("mac", self.mac.is_empty()),
            ("compression", self.compression.is_empty()),
        ];
        for (category, is_empty) in empty {
            if is_empty {
                return Err(KestrelError::Config(format!(
                    "Algorithm registry has no {} algorithms",
                    category
                )));
            }
        }
        Ok(())
    }

    /// Key exchange algorithms.
    pub fn kex(&self) -> &[KexAlgorithm] {
        &self.kex
    }

    /// Host key algorithms.
    pub fn host_keys(&self) -> &[HostKeyAlgorithm] {
        &self.host_key
    }

    /// Ciphers.
    pub fn ciphers(&self) -> &[CipherAlgorithm] {
        &self.cipher
    }

    /// MACs.
    pub fn macs(&self) -> &[MacAlgorithm] {
        &self.mac
    }

    /// Compression algorithms.
    pub fn compression(&self) -> &[CompressionAlgorithm] {
        &self.compression
    }

    /// Builds a KEXINIT proposal, listing only host key algorithms for which
    /// a key is actually available.
    pub fn kex_init(&self, available_host_keys: &[HostKeyAlgorithm]) -> KexInit {
        let host_keys: Vec<HostKeyAlgorithm> = self
            .host_key
            .iter()
            .copied()
            .filter(|alg| available_host_keys.contains(alg))
            .collect();

        KexInit::new(
            names(&self.kex, KexAlgorithm::name),
            names(&host_keys, HostKeyAlgorithm::name),
            names(&self.cipher, CipherAlgorithm::name),
            names(&self.mac, MacAlgorithm::name),
            names(&self.compression, CompressionAlgorithm::name),
        )
    }
}

fn names<T>(algs: &[T], name: fn(&T) -> &'static str) -> Vec<String> {
    algs.iter().map(|a| name(a).to_string()).collect()
}

/// Algorithms for one direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionAlgorithms {
    /// Cipher
    pub cipher: CipherAlgorithm,
    /// MAC
    pub mac: MacAlgorithm,
    /// Compression
    pub compression: CompressionAlgorithm,
}

/// The outcome of one negotiation. Replaced wholesale on rekey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmSuite {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Host key signature algorithm
    pub host_key: HostKeyAlgorithm,
    /// Client to server
    pub client_to_server: DirectionAlgorithms,
    /// Server to client
    pub server_to_client: DirectionAlgorithms,
    /// Language client to server, if any matched
    pub language_client_to_server: Option<String>,
    /// Language server to client, if any matched
    pub language_server_to_client: Option<String>,
}

impl std::fmt::Display for AlgorithmSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s={}/{}/{} s2c={}/{}/{}",
            self.kex.name(),
            self.host_key.name(),
            self.client_to_server.cipher.name(),
            self.client_to_server.mac.name(),
            self.client_to_server.compression.name(),
            self.server_to_client.cipher.name(),
            self.server_to_client.mac.name(),
            self.server_to_client.compression.name(),
        )
    }
}

/// Returns the first client algorithm that the server also supports.
///
/// # Example
///
/// ```rust
/// use kestrel_proto::ssh::algorithm::negotiate_algorithm;
///
/// let client = vec!["a".to_string(), "b".to_string(), "c".to_string()];
/// let server = vec!["b".to_string(), "c".to_string()];
/// assert_eq!(negotiate_algorithm(&client, &server), Some("b"));
/// ```
pub fn negotiate_algorithm<'a>(client_list: &'a [String], server_list: &[String]) -> Option<&'a str> {
    client_list
        .iter()
        .find(|c| server_list.contains(c))
        .map(String::as_str)
}

fn select<T>(
    category: &str,
    client: &[String],
    server: &[String],
    parse: fn(&str) -> Option<T>,
) -> KestrelResult<T> {
    let name = negotiate_algorithm(client, server).ok_or_else(|| KestrelError::NoCommonAlgorithm {
        category: category.to_string(),
    })?;
    parse(name).ok_or_else(|| {
        KestrelError::KeyExchange(format!("Negotiated unsupported {} algorithm {}", category, name))
    })
}

/// Negotiates a full suite from the client's and server's KEXINIT.
///
/// # Errors
///
/// [`KestrelError::NoCommonAlgorithm`] when kex, host key, encryption, MAC or
/// compression has no common name in either direction.
pub fn negotiate(client: &KexInit, server: &KexInit) -> KestrelResult<AlgorithmSuite> {
    let kex = select(
        "kex",
        client.kex_algorithms(),
        server.kex_algorithms(),
        KexAlgorithm::from_name,
    )?;
    let host_key = select(
        "host key",
        client.server_host_key_algorithms(),
        server.server_host_key_algorithms(),
        HostKeyAlgorithm::from_name,
    )?;

    let client_to_server = DirectionAlgorithms {
        cipher: select(
            "encryption client->server",
            client.encryption_algorithms_client_to_server(),
            server.encryption_algorithms_client_to_server(),
            CipherAlgorithm::from_name,
        )?,
        mac: select(
            "mac client->server",
            client.mac_algorithms_client_to_server(),
            server.mac_algorithms_client_to_server(),
            MacAlgorithm::from_name,
        )?,
        compression: select(
            "compression client->server",
            client.compression_algorithms_client_to_server(),
            server.compression_algorithms_client_to_server(),
            CompressionAlgorithm::from_name,
        )?,
    };
    let server_to_client = DirectionAlgorithms {
        cipher: select(
            "encryption server->client",
            client.encryption_algorithms_server_to_client(),
            server.encryption_algorithms_server_to_client(),
            CipherAlgorithm::from_name,
        )?,
        mac: select(
            "mac server->client",
            client.mac_algorithms_server_to_client(),
            server.mac_algorithms_server_to_client(),
            MacAlgorithm::from_name,
        )?,
        compression: select(
            "compression server->client",
            client.compression_algorithms_server_to_client(),
            server.compression_algorithms_server_to_client(),
            CompressionAlgorithm::from_name,
        )?,
    };

    Ok(AlgorithmSuite {
        kex,
        host_key,
        client_to_server,
        server_to_client,
        language_client_to_server: negotiate_algorithm(
            client.languages_client_to_server(),
            server.languages_client_to_server(),
        )
        .map(String::from),
        language_server_to_client: negotiate_algorithm(
            client.languages_server_to_client(),
            server.languages_server_to_client(),
        )
        .map(String::from),
    })
}

/// Whether a client's guessed KEX packet matches the negotiated outcome.
///
/// The guess is right only if the client's first kex and host key
/// algorithms are both the ones that were selected.
pub fn guess_is_correct(client: &KexInit, suite: &AlgorithmSuite) -> bool {
    client.kex_algorithms().first().map(String::as_str) == Some(suite.kex.name())
        && client.server_host_key_algorithms().first().map(String::as_str)
            == Some(suite.host_key.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_client_preference_wins() {
        let client = strings(&["a", "b", "c"]);
        let server = strings(&["b", "c"]);
        assert_eq!(negotiate_algorithm(&client, &server), Some("b"));

        let server_reordered = strings(&["c", "b"]);
        assert_eq!(negotiate_algorithm(&client, &server_reordered), Some("b"));
    }

    #[test]
    fn test_disjoint_lists() {
        let client = strings(&["a"]);
        let server = strings(&["b"]);
        assert_eq!(negotiate_algorithm(&client, &server), None);
        assert_eq!(negotiate_algorithm(&[], &server), None);
    }

    #[test]
    fn test_negotiate_default_against_legacy_client() {
        let server = AlgorithmRegistry::default()
            .with_kex(vec![KexAlgorithm::Curve25519Sha256, KexAlgorithm::DhGroup1Sha1])
            .kex_init(&[HostKeyAlgorithm::SshRsa, HostKeyAlgorithm::RsaSha2_256]);
        let client = AlgorithmRegistry::legacy().kex_init(&[HostKeyAlgorithm::SshRsa]);

        let suite = negotiate(&client, &server).unwrap();
        assert_eq!(suite.kex, KexAlgorithm::DhGroup1Sha1);
        assert_eq!(suite.host_key, HostKeyAlgorithm::SshRsa);
        assert_eq!(suite.client_to_server.cipher, CipherAlgorithm::Aes128Cbc);
        assert_eq!(suite.server_to_client.mac, MacAlgorithm::HmacSha1);
        assert_eq!(
            suite.client_to_server.compression,
            CompressionAlgorithm::None
        );
        assert_eq!(suite.language_client_to_server, None);
    }

    #[test]
    fn test_no_common_kex() {
        let server = AlgorithmRegistry::default().kex_init(&[HostKeyAlgorithm::SshEd25519]);
        let client = AlgorithmRegistry::legacy().kex_init(&[HostKeyAlgorithm::SshRsa]);

        match negotiate(&client, &server) {
            Err(KestrelError::NoCommonAlgorithm { category }) => assert_eq!(category, "kex"),
            other => panic!("expected NoCommonAlgorithm, got {:?}", other),
        }
    }

    #[test]
    fn test_host_key_list_filtered_by_available_keys() {
        let init = AlgorithmRegistry::default().kex_init(&[HostKeyAlgorithm::SshEd25519]);
        assert_eq!(init.server_host_key_algorithms(), &["ssh-ed25519".to_string()]);
    }

    #[test]
    fn test_validate_rejects_empty_category() {
        assert!(AlgorithmRegistry::default().validate().is_ok());
        assert!(AlgorithmRegistry::default()
            .with_macs(Vec::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_guess_detection() {
        let server = AlgorithmRegistry::default().kex_init(&[
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::SshRsa,
        ]);
        let client = AlgorithmRegistry::default()
            .with_kex(vec![KexAlgorithm::DhGroup14Sha1, KexAlgorithm::Curve25519Sha256])
            .kex_init(&[HostKeyAlgorithm::SshEd25519]);

        let suite = negotiate(&client, &server).unwrap();
        assert_eq!(suite.kex, KexAlgorithm::DhGroup14Sha1);
        assert!(guess_is_correct(&client, &suite));

        let client = AlgorithmRegistry::default()
            .with_host_keys(vec![HostKeyAlgorithm::SshRsa, HostKeyAlgorithm::SshEd25519])
            .kex_init(&[HostKeyAlgorithm::SshRsa, HostKeyAlgorithm::SshEd25519]);
        let mut suite = negotiate(&client, &server).unwrap();
        assert!(guess_is_correct(&client, &suite));
        suite.host_key = HostKeyAlgorithm::SshEd25519;
        assert!(!guess_is_correct(&client, &suite));
    }

    #[test]
    fn test_suite_display() {
        let client = AlgorithmRegistry::legacy().kex_init(&[HostKeyAlgorithm::SshRsa]);
        let suite = negotiate(&client, &client).unwrap();
        assert_eq!(
            suite.to_string(),
            "kex=diffie-hellman-group1-sha1 hostkey=ssh-rsa \
             c2s=aes128-cbc/hmac-sha1/none s2c=aes128-cbc/hmac-sha1/none"
        );
    }
}
