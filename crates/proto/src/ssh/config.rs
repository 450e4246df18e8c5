//! SSH server configuration
//!
//! Provides [`SshServerConfig`] and its builder. A config is validated once
//! and then shared read-only by every session of a listener.

use super::algorithm::AlgorithmRegistry;
use super::auth::AuthMethod;
use super::packet::MAX_PACKET_SIZE;
use super::version::{Version, MAX_VERSION_LENGTH};
use super::wire::DEFAULT_MAX_FIELD_LEN;
use kestrel_platform::{KestrelError, KestrelResult};
use std::sync::Arc;
use std::time::Duration;

/// Default number of failed authentication attempts before disconnect.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default absolute authentication timeout.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(600);

/// Default initial channel window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum channel data packet.
pub const DEFAULT_MAX_CHANNEL_PACKET: u32 = 32 * 1024;

/// Default bytes per direction before the server starts a rekey (1 GiB).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Room kept for framing around a full channel data packet.
pub(crate) const CHANNEL_PACKET_OVERHEAD: usize = 1024;

/// Server configuration
#[derive(Clone, Debug)]
pub struct SshServerConfig {
    /// Software version in our identification line (no spaces or '-')
    pub software_version: String,

    /// Optional comments after the software version
    pub comments: Option<String>,

    /// Failed attempts allowed before the session is dropped
    pub max_auth_attempts: u32,

    /// Absolute limit from service start to successful authentication
    pub auth_timeout: Duration,

    /// Disconnect after this long without a received packet
    pub idle_timeout: Option<Duration>,

    /// Largest `packet_length` accepted or produced
    pub max_packet_size: usize,

    /// Ceiling for any length-prefixed field in a message
    pub max_field_length: usize,

    /// Window advertised for each channel
    pub initial_window_size: u32,

    /// Largest data chunk per channel packet
    pub max_channel_packet: u32,

    /// Send WINDOW_ADJUST once the local window falls below this
    pub window_replenish_threshold: u32,

    /// Channels allowed at once on one session
    pub max_channels: usize,

    /// Banner text sent before the first authentication reply
    pub banner: Option<String>,

    /// Authentication methods offered, in the order advertised
    pub auth_methods: Vec<AuthMethod>,

    /// Bytes per direction before a server initiated rekey; 0 disables
    pub rekey_bytes_limit: u64,

    /// Algorithm capability table
    pub registry: Arc<AlgorithmRegistry>,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Kestrel_{}", env!("CARGO_PKG_VERSION")),
            comments: None,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            idle_timeout: None,
            max_packet_size: MAX_PACKET_SIZE,
            max_field_length: DEFAULT_MAX_FIELD_LEN,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_channel_packet: DEFAULT_MAX_CHANNEL_PACKET,
            window_replenish_threshold: DEFAULT_WINDOW_SIZE / 2,
            max_channels: 64,
            banner: None,
            auth_methods: vec![AuthMethod::PublicKey, AuthMethod::Password],
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            registry: Arc::new(AlgorithmRegistry::default()),
        }
    }
}

impl SshServerConfig {
    /// Create builder for server configuration
    pub fn builder() -> SshServerConfigBuilder {
        SshServerConfigBuilder::new()
    }

    /// Our identification line.
    pub fn version(&self) -> Version {
        Version::new(&self.software_version, self.comments.as_deref())
    }

    /// Validate configuration
    pub fn validate(&self) -> KestrelResult<()> {
        if self.software_version.is_empty()
            || !self
                .software_version
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '-')
        {
            return Err(KestrelError::Config(format!(
                "Invalid software version '{}'",
                self.software_version
            )));
        }
        if self.version().as_str().len() > MAX_VERSION_LENGTH - 2 {
            return Err(KestrelError::Config(
                "Identification line too long".to_string(),
            ));
        }
        if self.max_auth_attempts == 0 {
            return Err(KestrelError::Config(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        if self.auth_timeout.is_zero() {
            return Err(KestrelError::Config(
                "auth_timeout must be positive".to_string(),
            ));
        }
        if self.max_packet_size < MAX_PACKET_SIZE {
            return Err(KestrelError::Config(format!(
                "max_packet_size must be at least {}",
                MAX_PACKET_SIZE
            )));
        }
        if self.max_channel_packet == 0
            || self.max_channel_packet as usize + CHANNEL_PACKET_OVERHEAD > self.max_packet_size
        {
            return Err(KestrelError::Config(format!(
                "max_channel_packet {} does not fit in packets of {}",
                self.max_channel_packet, self.max_packet_size
            )));
        }
        if self.initial_window_size == 0
            || self.window_replenish_threshold > self.initial_window_size
        {
            return Err(KestrelError::Config(
                "window_replenish_threshold must not exceed a non-zero initial_window_size"
                    .to_string(),
            ));
        }
        if self.max_field_length == 0 {
            return Err(KestrelError::Config(
                "max_field_length must be positive".to_string(),
            ));
        }
        if self.max_channels == 0 {
            return Err(KestrelError::Config(
                "max_channels must be at least 1".to_string(),
            ));
        }
        if self.auth_methods.is_empty() {
            return Err(KestrelError::Config(
                "At least one authentication method is required".to_string(),
            ));
        }
        self.registry.validate()
    }
}

/// Builder for SshServerConfig
#[derive(Default)]
pub struct SshServerConfigBuilder {
    config: SshServerConfig,
}

impl SshServerConfigBuilder {
    /// Create new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set software version and comments
    pub fn with_software_version(
        mut self,
        software: impl Into<String>,
        comments: Option<&str>,
    ) -> Self {
        self.config.software_version = software.into();
        self.config.comments = comments.map(String::from);
        self
    }

    /// Set maximum failed authentication attempts
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.config.max_auth_attempts = attempts;
        self
    }

    /// Set authentication timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Set maximum packet size
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Set field length ceiling
    pub fn with_max_field_length(mut self, len: usize) -> Self {
        self.config.max_field_length = len;
        self
    }

    /// Set channel window and packet sizes; the replenish threshold becomes
    /// half the window
    pub fn with_channel_window(mut self, window: u32, max_packet: u32) -> Self {
        self.config.initial_window_size = window;
        self.config.max_channel_packet = max_packet;
        self.config.window_replenish_threshold = window / 2;
        self
    }

    /// Set window replenish threshold
    pub fn with_window_replenish_threshold(mut self, threshold: u32) -> Self {
        self.config.window_replenish_threshold = threshold;
        self
    }

    /// Set maximum channels per session
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.config.max_channels = max;
        self
    }

    /// Set banner
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = Some(banner.into());
        self
    }

    /// Set offered authentication methods
    pub fn with_auth_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.config.auth_methods = methods;
        self
    }

    /// Set rekey byte limit (0 disables server initiated rekey)
    pub fn with_rekey_bytes_limit(mut self, limit: u64) -> Self {
        self.config.rekey_bytes_limit = limit;
        self
    }

    /// Set algorithm registry
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.config.registry = Arc::new(registry);
        self
    }

    /// Build SshServerConfig with validation
    pub fn build(self) -> KestrelResult<SshServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SshServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_auth_attempts, 6);
        assert_eq!(config.auth_timeout, Duration::from_secs(600));
        assert!(config.version().as_str().starts_with("SSH-2.0-Kestrel_"));
    }

    #[test]
    fn test_builder() {
        let config = SshServerConfig::builder()
            .with_software_version("TestServer_1.0", Some("unit"))
            .with_max_auth_attempts(3)
            .with_banner("Authorized use only\r\n")
            .with_channel_window(64 * 1024, 16 * 1024)
            .with_registry(AlgorithmRegistry::legacy())
            .build()
            .expect("Failed to build server config");

        assert_eq!(config.version().as_str(), "SSH-2.0-TestServer_1.0 unit");
        assert_eq!(config.window_replenish_threshold, 32 * 1024);
        assert_eq!(config.registry.kex().len(), 1);
    }

    #[test]
    fn test_invalid_values() {
        assert!(SshServerConfig::builder()
            .with_software_version("bad-name", None)
            .build()
            .is_err());
        assert!(SshServerConfig::builder()
            .with_max_auth_attempts(0)
            .build()
            .is_err());
        assert!(SshServerConfig::builder()
            .with_max_packet_size(1024)
            .build()
            .is_err());
        assert!(SshServerConfig::builder()
            .with_channel_window(1024, 64 * 1024)
            .with_window_replenish_threshold(4096)
            .build()
            .is_err());
        assert!(SshServerConfig::builder()
            .with_auth_methods(Vec::new())
            .build()
            .is_err());
        assert!(SshServerConfig::builder()
            .with_registry(AlgorithmRegistry::default().with_ciphers(Vec::new()))
            .build()
            .is_err());
    }
}
