//! SSH authentication protocol (RFC 4252).
//!
//! This module implements the server side of `ssh-userauth`:
//! - "none" - Lists the methods that can continue
//! - "password" - Password authentication, including password change
//! - "publickey" - Public key authentication (Ed25519, RSA), with the
//!   query phase answered by SSH_MSG_USERAUTH_PK_OK
//! - "hostbased" - Host based authentication (RFC 4252 Section 9)
//!
//! Credential decisions are delegated to an [`Authenticator`]. The
//! [`AuthService`] state machine enforces the attempt limit, sends the
//! banner once, handles partial success and verifies signatures over the
//! session identifier. [`AuthTimer`] bounds the whole phase.
//!
//! # Security
//!
//! - **Constant-time password comparison** - [`constant_time_compare`]
//! - **Signatures bound to the session** - Public key and host based
//!   signatures cover the session identifier
//! - **Secrets zeroized** - Passwords are held in [`Zeroizing`] buffers
//!   and redacted from `Debug` output
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::auth::{AuthRequest, MethodData};
//!
//! let auth = AuthRequest::new("user", "ssh-connection", MethodData::password("secret"));
//! assert_eq!(auth.method().name(), "password");
//! ```

use super::config::SshServerConfig;
use super::hostkey::{HostKeyAlgorithm, PublicKey};
use super::logging;
use super::message::{expect_type, MessageType};
use super::transport::PacketSender;
use super::wire::{SshReader, SshWrite, DEFAULT_MAX_FIELD_LEN};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Service name of the authentication protocol.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service name of the connection protocol.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// "none"
    None,
    /// "password"
    Password,
    /// "publickey"
    PublicKey,
    /// "hostbased"
    Hostbased,
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Hostbased => "hostbased",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(AuthMethod::None),
            "password" => Some(AuthMethod::Password),
            "publickey" => Some(AuthMethod::PublicKey),
            "hostbased" => Some(AuthMethod::Hostbased),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Method specific fields of a USERAUTH_REQUEST.
#[derive(Clone, PartialEq, Eq)]
pub enum MethodData {
    /// "none"
    None,
    /// "password"
    Password {
        /// Current password
        password: Zeroizing<String>,
        /// Replacement password when changing
        new_password: Option<Zeroizing<String>>,
    },
    /// "publickey"
    PublicKey {
        /// Signature algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature; absent in the query phase
        signature: Option<Vec<u8>>,
    },
    /// "hostbased"
    Hostbased {
        /// Host key algorithm name
        algorithm: String,
        /// Client host key blob
        host_key: Vec<u8>,
        /// Client host name (FQDN)
        client_host: String,
        /// User name on the client host
        client_user: String,
        /// Signature by the host key
        signature: Vec<u8>,
    },
    /// Any other method; it has no fields we can interpret.
    Unknown(String),
}

impl MethodData {
    /// Password request without a change.
    pub fn password(password: &str) -> Self {
        MethodData::Password {
            password: Zeroizing::new(password.to_string()),
            new_password: None,
        }
    }

    /// Wire name of the method.
    pub fn name(&self) -> &str {
        match self {
            MethodData::None => "none",
            MethodData::Password { .. } => "password",
            MethodData::PublicKey { .. } => "publickey",
            MethodData::Hostbased { .. } => "hostbased",
            MethodData::Unknown(name) => name,
        }
    }

    /// Known method, if any.
    pub fn method(&self) -> Option<AuthMethod> {
        AuthMethod::from_name(self.name())
    }
}

impl std::fmt::Debug for MethodData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodData::None => f.write_str("None"),
            MethodData::Password { new_password, .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .field("changing", &new_password.is_some())
                .finish(),
            MethodData::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish_non_exhaustive(),
            MethodData::Hostbased {
                algorithm,
                client_host,
                client_user,
                ..
            } => f
                .debug_struct("Hostbased")
                .field("algorithm", algorithm)
                .field("client_host", client_host)
                .field("client_user", client_user)
                .finish_non_exhaustive(),
            MethodData::Unknown(name) => f.debug_tuple("Unknown").field(name).finish(),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: MethodData,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: MethodData) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method specific fields.
    pub fn method(&self) -> &MethodData {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.put_body(&mut buf, true);
        buf.to_vec()
    }

    /// The data a public key or host based signature covers:
    /// `string session_id` followed by this request without its signature.
    pub fn signature_data(&self, session_id: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_string(session_id);
        self.put_body(&mut buf, false);
        buf.to_vec()
    }

    fn put_body(&self, buf: &mut BytesMut, with_signature: bool) {
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_str(&self.user_name);
        buf.put_str(&self.service_name);
        buf.put_str(self.method.name());
        match &self.method {
            MethodData::None | MethodData::Unknown(_) => {}
            MethodData::Password {
                password,
                new_password,
            } => {
                buf.put_bool(new_password.is_some());
                buf.put_str(password);
                if let Some(new_password) = new_password {
                    buf.put_str(new_password);
                }
            }
            MethodData::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some() || !with_signature);
                buf.put_str(algorithm);
                buf.put_string(public_key);
                if let (true, Some(signature)) = (with_signature, signature) {
                    buf.put_string(signature);
                }
            }
            MethodData::Hostbased {
                algorithm,
                host_key,
                client_host,
                client_user,
                signature,
            } => {
                buf.put_str(algorithm);
                buf.put_string(host_key);
                buf.put_str(client_host);
                buf.put_str(client_user);
                if with_signature {
                    buf.put_string(signature);
                }
            }
        }
    }

    /// Parses an authentication request from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] or [`KestrelError::TruncatedInput`]
    /// if the data is invalid.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        Self::from_bytes_with_limit(data, DEFAULT_MAX_FIELD_LEN)
    }

    /// Parses with an explicit ceiling on field lengths.
    pub fn from_bytes_with_limit(data: &[u8], max_field_len: usize) -> KestrelResult<Self> {
        let mut reader = SshReader::with_limit(data, max_field_len);
        expect_type(&mut reader, MessageType::UserauthRequest)?;
        let user_name = reader.read_utf8()?;
        let service_name = reader.read_utf8()?;
        let method_name = reader.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => MethodData::None,
            "password" => {
                let changing = reader.read_bool()?;
                let password = Zeroizing::new(reader.read_utf8()?);
                let new_password = if changing {
                    Some(Zeroizing::new(reader.read_utf8()?))
                } else {
                    None
                };
                MethodData::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let has_signature = reader.read_bool()?;
                let algorithm = reader.read_utf8()?;
                let public_key = reader.read_string()?.to_vec();
                let signature = if has_signature {
                    Some(reader.read_string()?.to_vec())
                } else {
                    None
                };
                MethodData::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "hostbased" => MethodData::Hostbased {
                algorithm: reader.read_utf8()?,
                host_key: reader.read_string()?.to_vec(),
                client_host: reader.read_utf8()?,
                client_user: reader.read_utf8()?,
                signature: reader.read_string()?.to_vec(),
            },
            _ => {
                reader.rest();
                MethodData::Unknown(method_name)
            }
        };
        reader.finish()?;

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods_can_continue);
        buf.put_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::UserauthFailure)?;
        Ok(Self {
            methods_can_continue: reader.read_name_list()?,
            partial_success: reader.read_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Creates a new authentication success message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::UserauthSuccess)?;
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes (empty language tag).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_str(&self.message);
        buf.put_str("");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::UserauthBanner)?;
        let message = reader.read_utf8()?;
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// Sent in reply to a public key query without signature when the key
/// would be acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.algorithm);
        buf.put_string(&self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::UserauthPkOk)?;
        Ok(Self {
            algorithm: reader.read_utf8()?,
            public_key: reader.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (RFC 4252 Section 8).
///
/// Shares message id 60 with PK_OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdChangeReq {
    prompt: String,
}

impl PasswdChangeReq {
    /// Creates a change request with the prompt shown to the user.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }

    /// Returns the prompt.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Serializes to bytes (empty language tag).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.prompt);
        buf.put_str("");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut reader = SshReader::new(data);
        expect_type(&mut reader, MessageType::UserauthPkOk)?;
        Ok(Self {
            prompt: reader.read_utf8()?,
        })
    }
}

/// Verified credentials handed to the [`Authenticator`].
///
/// Signatures have already been checked when this is built.
#[derive(Debug)]
pub enum Credentials<'a> {
    /// "none"
    None,
    /// "password"
    Password {
        /// Current password
        password: &'a str,
        /// Requested replacement, when changing
        new_password: Option<&'a str>,
    },
    /// "publickey" with a valid signature
    PublicKey {
        /// Signature algorithm used
        algorithm: HostKeyAlgorithm,
        /// The user's key
        public_key: &'a PublicKey,
    },
    /// "hostbased" with a valid signature
    Hostbased {
        /// Signature algorithm used
        algorithm: HostKeyAlgorithm,
        /// The client host's key
        host_key: &'a PublicKey,
        /// Client host name
        client_host: &'a str,
        /// User on the client host
        client_user: &'a str,
    },
}

impl Credentials<'_> {
    /// Method these credentials belong to.
    pub fn method(&self) -> AuthMethod {
        match self {
            Credentials::None => AuthMethod::None,
            Credentials::Password { .. } => AuthMethod::Password,
            Credentials::PublicKey { .. } => AuthMethod::PublicKey,
            Credentials::Hostbased { .. } => AuthMethod::Hostbased,
        }
    }
}

/// Result of checking one set of credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The user is authenticated
    Success,
    /// The credentials are wrong
    Failure,
    /// The credentials are right but another method is still required
    FurtherAuthRequired,
    /// The password is right but expired; ask for a new one
    PasswordExpired {
        /// Prompt shown to the user
        prompt: String,
    },
}

/// An [`AuthOutcome`] plus an optional override of the methods that may
/// continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    /// Outcome
    pub outcome: AuthOutcome,
    /// Methods that can continue; `None` keeps the current list
    pub allowed_methods: Option<Vec<AuthMethod>>,
}

impl AuthDecision {
    /// Authenticated.
    pub fn success() -> Self {
        Self::from(AuthOutcome::Success)
    }

    /// Rejected.
    pub fn failure() -> Self {
        Self::from(AuthOutcome::Failure)
    }

    /// Accepted as one factor of several.
    pub fn partial(remaining: Vec<AuthMethod>) -> Self {
        Self {
            outcome: AuthOutcome::FurtherAuthRequired,
            allowed_methods: Some(remaining),
        }
    }

    /// Password must be changed first.
    pub fn password_expired(prompt: impl Into<String>) -> Self {
        Self::from(AuthOutcome::PasswordExpired {
            prompt: prompt.into(),
        })
    }
}

impl From<AuthOutcome> for AuthDecision {
    fn from(outcome: AuthOutcome) -> Self {
        Self {
            outcome,
            allowed_methods: None,
        }
    }
}

/// Credential backend supplied by the application.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decides on one set of verified credentials for `user`.
    async fn authenticate(&self, user: &str, credentials: Credentials<'_>) -> AuthDecision;

    /// Whether `public_key` would be accepted for `user` (query phase).
    async fn accepts_public_key(
        &self,
        _user: &str,
        _algorithm: HostKeyAlgorithm,
        _public_key: &PublicKey,
    ) -> bool {
        true
    }
}

/// Compares two passwords in constant time.
///
/// Both inputs are hashed first so unequal lengths take the same time.
///
/// ```rust
/// use kestrel_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

/// Progress reported by [`AuthService::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Still authenticating, or a request after success that was ignored
    Continue,
    /// Authentication just succeeded
    Authenticated {
        /// Authenticated user
        user: String,
        /// Service to start (always `ssh-connection`)
        service: String,
    },
}

/// Server side state machine of the `ssh-userauth` service.
pub struct AuthService {
    methods: Vec<AuthMethod>,
    max_attempts: u32,
    attempts: u32,
    banner: Option<String>,
    banner_sent: bool,
    authenticated: bool,
    max_field_length: usize,
    session_id: Vec<u8>,
    sender: PacketSender,
    authenticator: Arc<dyn Authenticator>,
}

impl AuthService {
    /// Creates the service for one session.
    pub fn new(
        config: &SshServerConfig,
        session_id: &[u8],
        sender: PacketSender,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            methods: config.auth_methods.clone(),
            max_attempts: config.max_auth_attempts,
            attempts: 0,
            banner: config.banner.clone(),
            banner_sent: false,
            authenticated: false,
            max_field_length: config.max_field_length,
            session_id: session_id.to_vec(),
            sender,
            authenticator,
        }
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether authentication has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Methods that can currently continue.
    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    /// Handles one message of the authentication range.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::ServiceNotAvailable`] if the request targets a
    ///   service other than `ssh-connection`
    /// - [`KestrelError::Auth`] once the attempt limit is reached; no
    ///   failure reply is sent in that case
    /// - [`KestrelError::Protocol`] for a malformed request
    pub async fn handle(&mut self, payload: &[u8]) -> KestrelResult<AuthStatus> {
        if self.authenticated {
            debug!(peer = self.sender.peer(), "Ignoring auth message after success");
            return Ok(AuthStatus::Continue);
        }
        let request = AuthRequest::from_bytes_with_limit(payload, self.max_field_length)?;
        self.send_banner().await?;

        if request.service_name() != SERVICE_CONNECTION {
            return Err(KestrelError::ServiceNotAvailable(
                request.service_name().to_string(),
            ));
        }

        let user = request.user_name();
        let method_name = request.method().name();
        logging::log_auth_attempt(self.sender.peer(), user, method_name, self.attempts + 1);

        let offered = request
            .method()
            .method()
            .filter(|m| self.methods.contains(m));
        let decision = match (offered, request.method()) {
            (None, MethodData::None) => return self.reject(user, method_name, false).await,
            (None, _) => return self.reject(user, method_name, true).await,
            (Some(_), MethodData::None) => {
                self.authenticator
                    .authenticate(user, Credentials::None)
                    .await
            }
            (
                Some(_),
                MethodData::Password {
                    password,
                    new_password,
                },
            ) => {
                let credentials = Credentials::Password {
                    password: password.as_str(),
                    new_password: new_password.as_ref().map(|p| p.as_str()),
                };
                self.authenticator.authenticate(user, credentials).await
            }
            (
                Some(_),
                MethodData::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                },
            ) => {
                let parsed = parse_key(algorithm, public_key);
                let signature = match signature {
                    Some(signature) => signature,
                    None => return self.query_public_key(&request, parsed).await,
                };
                let (alg, key) = match parsed {
                    Some(parsed) => parsed,
                    None => return self.reject(user, method_name, true).await,
                };
                if !self.signature_valid(&request, alg, &key, signature) {
                    return self.reject(user, method_name, true).await;
                }
                let credentials = Credentials::PublicKey {
                    algorithm: alg,
                    public_key: &key,
                };
                self.authenticator.authenticate(user, credentials).await
            }
            (
                Some(_),
                MethodData::Hostbased {
                    algorithm,
                    host_key,
                    client_host,
                    client_user,
                    signature,
                },
            ) => {
                let (alg, key) = match parse_key(algorithm, host_key) {
                    Some(parsed) => parsed,
                    None => return self.reject(user, method_name, true).await,
                };
                if !self.signature_valid(&request, alg, &key, signature) {
                    return self.reject(user, method_name, true).await;
                }
                let credentials = Credentials::Hostbased {
                    algorithm: alg,
                    host_key: &key,
                    client_host: client_host.as_str(),
                    client_user: client_user.as_str(),
                };
                self.authenticator.authenticate(user, credentials).await
            }
            (Some(_), MethodData::Unknown(_)) => {
                return self.reject(user, method_name, true).await
            }
        };

        self.apply(&request, decision).await
    }

    async fn apply(
        &mut self,
        request: &AuthRequest,
        decision: AuthDecision,
    ) -> KestrelResult<AuthStatus> {
        let user = request.user_name();
        let method_name = request.method().name();
        if let Some(allowed) = decision.allowed_methods {
            self.methods = allowed;
        }

        match decision.outcome {
            AuthOutcome::Success => {
                self.authenticated = true;
                self.sender.send(&AuthSuccess.to_bytes()).await?;
                logging::log_auth_success(self.sender.peer(), user, method_name);
                Ok(AuthStatus::Authenticated {
                    user: user.to_string(),
                    service: request.service_name().to_string(),
                })
            }
            AuthOutcome::FurtherAuthRequired => {
                if let Some(used) = request.method().method() {
                    self.methods.retain(|m| *m != used);
                }
                if self.methods.iter().all(|m| *m == AuthMethod::None) {
                    warn!(
                        peer = self.sender.peer(),
                        user = user,
                        "Partial success with no method left to continue"
                    );
                    return Err(KestrelError::Auth(format!(
                        "No authentication methods left for {}",
                        user
                    )));
                }
                logging::log_auth_failure(self.sender.peer(), user, method_name, self.attempts, true);
                self.send_failure(true).await?;
                Ok(AuthStatus::Continue)
            }
            AuthOutcome::PasswordExpired { prompt } => {
                debug!(peer = self.sender.peer(), user = user, "Password change required");
                self.sender
                    .send(&PasswdChangeReq::new(prompt).to_bytes())
                    .await?;
                Ok(AuthStatus::Continue)
            }
            AuthOutcome::Failure => {
                let counted = !matches!(request.method(), MethodData::None);
                self.reject(user, method_name, counted).await
            }
        }
    }

    async fn query_public_key(
        &mut self,
        request: &AuthRequest,
        parsed: Option<(HostKeyAlgorithm, PublicKey)>,
    ) -> KestrelResult<AuthStatus> {
        if let Some((alg, key)) = parsed {
            if self
                .authenticator
                .accepts_public_key(request.user_name(), alg, &key)
                .await
            {
                if let MethodData::PublicKey { public_key, .. } = request.method() {
                    self.sender
                        .send(&AuthPkOk::new(alg.name(), public_key.clone()).to_bytes())
                        .await?;
                }
                return Ok(AuthStatus::Continue);
            }
        }
        self.reject(request.user_name(), "publickey", false).await
    }

    fn signature_valid(
        &self,
        request: &AuthRequest,
        algorithm: HostKeyAlgorithm,
        key: &PublicKey,
        signature: &[u8],
    ) -> bool {
        let mut reader = SshReader::new(signature);
        match reader.read_string() {
            Ok(name) if name == algorithm.name().as_bytes() => {}
            _ => return false,
        }
        let data = request.signature_data(&self.session_id);
        key.verify(&data, signature).unwrap_or(false)
    }

    /// Sends a failure. Counted failures at the limit end authentication
    /// with an error instead.
    async fn reject(&mut self, user: &str, method: &str, counted: bool) -> KestrelResult<AuthStatus> {
        if counted {
            self.attempts += 1;
            logging::log_auth_failure(self.sender.peer(), user, method, self.attempts, false);
            if self.attempts >= self.max_attempts {
                warn!(
                    peer = self.sender.peer(),
                    user = user,
                    attempts = self.attempts,
                    "Too many authentication failures"
                );
                return Err(KestrelError::Auth(format!(
                    "Too many authentication failures for {}",
                    user
                )));
            }
        }
        self.send_failure(false).await?;
        Ok(AuthStatus::Continue)
    }

    async fn send_failure(&self, partial_success: bool) -> KestrelResult<()> {
        let methods = self
            .methods
            .iter()
            .filter(|m| **m != AuthMethod::None)
            .map(|m| m.name().to_string())
            .collect();
        self.sender
            .send(&AuthFailure::new(methods, partial_success).to_bytes())
            .await
    }

    async fn send_banner(&mut self) -> KestrelResult<()> {
        if self.banner_sent {
            return Ok(());
        }
        self.banner_sent = true;
        if let Some(banner) = &self.banner {
            self.sender.send(&AuthBanner::new(banner.as_str()).to_bytes()).await?;
        }
        Ok(())
    }
}

fn parse_key(algorithm: &str, blob: &[u8]) -> Option<(HostKeyAlgorithm, PublicKey)> {
    let algorithm = HostKeyAlgorithm::from_name(algorithm)?;
    let key = PublicKey::from_blob(blob).ok()?;
    key.accepts(algorithm).then_some((algorithm, key))
}

/// Absolute deadline on the authentication phase.
///
/// When it fires, the session is disconnected with `BY_APPLICATION`.
/// Cancelling is idempotent and dropping the timer cancels it.
#[derive(Debug)]
pub struct AuthTimer {
    cancel: Option<oneshot::Sender<()>>,
}

impl AuthTimer {
    /// Starts the timer on the current runtime.
    pub fn start(timeout: Duration, sender: PacketSender) -> Self {
        let (cancel, cancelled) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(peer = sender.peer(), timeout_secs = timeout.as_secs(), "Authentication timed out");
                    sender
                        .disconnect(DisconnectReason::ByApplication, "Authentication timeout")
                        .await;
                }
                _ = cancelled => {}
            }
        });
        Self {
            cancel: Some(cancel),
        }
    }

    /// Stops the timer. Returns `false` if it was already stopped.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(cancel) => {
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Whether the timer has not been cancelled.
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for AuthTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{Ed25519HostKey, HostKey};
    use crate::ssh::message::Disconnect;
    use crate::ssh::packet::PacketReader;
    use tokio::io::{duplex, DuplexStream};

    const SESSION_ID: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct TestAuthenticator {
        user_key: Vec<u8>,
    }

    #[async_trait]
    impl Authenticator for TestAuthenticator {
        async fn authenticate(&self, user: &str, credentials: Credentials<'_>) -> AuthDecision {
            match (user, credentials) {
                ("alice", Credentials::Password { password, .. })
                    if constant_time_compare(password, "secret") =>
                {
                    AuthDecision::success()
                }
                ("mfa", Credentials::Password { password, .. })
                    if constant_time_compare(password, "secret") =>
                {
                    AuthDecision::from(AuthOutcome::FurtherAuthRequired)
                }
                ("expired", Credentials::Password { new_password: None, .. }) => {
                    AuthDecision::password_expired("Password expired")
                }
                ("expired", Credentials::Password { new_password: Some(_), .. }) => {
                    AuthDecision::success()
                }
                (
                    _,
                    Credentials::Hostbased {
                        host_key,
                        client_host: "ws1.example.com",
                        client_user: "dave",
                        ..
                    },
                ) => {
                    if PublicKey::from_blob(&self.user_key).ok().as_ref() == Some(host_key) {
                        AuthDecision::success()
                    } else {
                        AuthDecision::failure()
                    }
                }
                (_, Credentials::PublicKey { public_key, .. }) => {
                    if PublicKey::from_blob(&self.user_key).ok().as_ref() == Some(public_key) {
                        AuthDecision::success()
                    } else {
                        AuthDecision::failure()
                    }
                }
                _ => AuthDecision::failure(),
            }
        }
    }

    fn service(
        config: &SshServerConfig,
        user_key: &Ed25519HostKey,
    ) -> (AuthService, PacketReader<DuplexStream>) {
        let (ours, theirs) = duplex(1 << 20);
        let sender = PacketSender::new(Box::new(ours), 35000, "test");
        let authenticator = Arc::new(TestAuthenticator {
            user_key: user_key.public_key_blob(),
        });
        (
            AuthService::new(config, SESSION_ID, sender, authenticator),
            PacketReader::new(theirs, 35000),
        )
    }

    fn password(user: &str, password: &str) -> Vec<u8> {
        AuthRequest::new(user, SERVICE_CONNECTION, MethodData::password(password)).to_bytes()
    }

    fn signed_request(key: &Ed25519HostKey, user: &str) -> Vec<u8> {
        let mut request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: key.public_key_blob(),
                signature: None,
            },
        );
        let data = request.signature_data(SESSION_ID);
        let signature = key.sign(HostKeyAlgorithm::SshEd25519, &data).unwrap();
        if let MethodData::PublicKey { signature: sig, .. } = &mut request.method {
            *sig = Some(signature);
        }
        request.to_bytes()
    }

    fn hostbased_request(key: &Ed25519HostKey, user: &str) -> AuthRequest {
        let mut request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::Hostbased {
                algorithm: "ssh-ed25519".into(),
                host_key: key.public_key_blob(),
                client_host: "ws1.example.com".into(),
                client_user: "dave".into(),
                signature: Vec::new(),
            },
        );
        let data = request.signature_data(SESSION_ID);
        let signed = key.sign(HostKeyAlgorithm::SshEd25519, &data).unwrap();
        if let MethodData::Hostbased { signature, .. } = &mut request.method {
            *signature = signed;
        }
        request
    }

    #[test]
    fn test_auth_request_password_change() {
        let auth = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            MethodData::Password {
                password: Zeroizing::new("old".into()),
                new_password: Some(Zeroizing::new("new".into())),
            },
        );
        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed, auth);
        assert!(!format!("{:?}", parsed).contains("old"));
    }

    #[test]
    fn test_auth_request_unknown_method() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        buf.put_str("bob");
        buf.put_str(SERVICE_CONNECTION);
        buf.put_str("keyboard-interactive");
        buf.put_str("");
        buf.put_str("");
        let parsed = AuthRequest::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.method(),
            &MethodData::Unknown("keyboard-interactive".into())
        );
        assert_eq!(parsed.method().method(), None);
    }

    #[test]
    fn test_signature_data_layout() {
        let request = AuthRequest::new(
            "u",
            "s",
            MethodData::PublicKey {
                algorithm: "a".into(),
                public_key: vec![9],
                signature: Some(vec![1, 2, 3]),
            },
        );
        let data = request.signature_data(b"id");
        let expected: Vec<u8> = [
            &[0, 0, 0, 2][..],
            b"id",
            &[50, 0, 0, 0, 1],
            b"u",
            &[0, 0, 0, 1],
            b"s",
            &[0, 0, 0, 9],
            b"publickey",
            &[1, 0, 0, 0, 1],
            b"a",
            &[0, 0, 0, 1, 9],
        ]
        .concat();
        assert_eq!(data, expected);
    }

    #[test]
    fn test_failure_and_passwd_changereq_codecs() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], true);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed, failure);

        let change = PasswdChangeReq::new("Expired");
        let bytes = change.to_bytes();
        assert_eq!(bytes[0], 60);
        assert_eq!(PasswdChangeReq::from_bytes(&bytes).unwrap().prompt(), "Expired");
    }

    #[tokio::test]
    async fn test_password_success_with_banner_once() {
        let config = SshServerConfig::builder()
            .with_banner("Welcome\r\n")
            .build()
            .unwrap();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        let status = auth.handle(&password("alice", "wrong")).await.unwrap();
        assert_eq!(status, AuthStatus::Continue);
        let banner = reader.read_packet().await.unwrap();
        assert_eq!(AuthBanner::from_bytes(&banner.payload).unwrap().message(), "Welcome\r\n");
        let failure = reader.read_packet().await.unwrap();
        let failure = AuthFailure::from_bytes(&failure.payload).unwrap();
        assert_eq!(failure.methods_can_continue(), &["publickey", "password"]);
        assert!(!failure.partial_success());

        let status = auth.handle(&password("alice", "secret")).await.unwrap();
        assert_eq!(
            status,
            AuthStatus::Authenticated {
                user: "alice".into(),
                service: SERVICE_CONNECTION.into()
            }
        );
        let success = reader.read_packet().await.unwrap();
        assert_eq!(success.payload, vec![52]);
        assert_eq!(auth.attempts(), 1);

        assert_eq!(
            auth.handle(&password("alice", "secret")).await.unwrap(),
            AuthStatus::Continue
        );
    }

    #[tokio::test]
    async fn test_max_attempts_disconnects_without_failure() {
        let config = SshServerConfig::builder()
            .with_max_auth_attempts(2)
            .build()
            .unwrap();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        auth.handle(&password("alice", "a")).await.unwrap();
        let err = auth.handle(&password("alice", "b")).await.unwrap_err();
        assert!(matches!(err, KestrelError::Auth(_)));
        assert_eq!(
            err.disconnect_reason(),
            DisconnectReason::NoMoreAuthMethodsAvailable
        );

        let first = reader.read_packet().await.unwrap();
        assert_eq!(first.payload[0], 51);
        auth.sender.close().await;
        assert!(reader.read_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_none_lists_methods_without_counting() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        for _ in 0..10 {
            let request = AuthRequest::new("bob", SERVICE_CONNECTION, MethodData::None);
            auth.handle(&request.to_bytes()).await.unwrap();
            let reply = reader.read_packet().await.unwrap();
            assert!(!AuthFailure::from_bytes(&reply.payload).unwrap().partial_success());
        }
        assert_eq!(auth.attempts(), 0);
    }

    #[tokio::test]
    async fn test_wrong_service_is_not_available() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, _reader) = service(&config, &key);

        let request = AuthRequest::new("bob", "ssh-foo", MethodData::password("x"));
        let err = auth.handle(&request.to_bytes()).await.unwrap_err();
        assert_eq!(err.disconnect_reason(), DisconnectReason::ServiceNotAvailable);
    }

    #[tokio::test]
    async fn test_publickey_query_then_signature() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        let query = AuthRequest::new(
            "carol",
            SERVICE_CONNECTION,
            MethodData::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: key.public_key_blob(),
                signature: None,
            },
        );
        auth.handle(&query.to_bytes()).await.unwrap();
        let pk_ok = reader.read_packet().await.unwrap();
        let pk_ok = AuthPkOk::from_bytes(&pk_ok.payload).unwrap();
        assert_eq!(pk_ok.algorithm(), "ssh-ed25519");
        assert_eq!(pk_ok.public_key(), &key.public_key_blob()[..]);
        assert_eq!(auth.attempts(), 0);

        let status = auth.handle(&signed_request(&key, "carol")).await.unwrap();
        assert!(matches!(status, AuthStatus::Authenticated { .. }));
    }

    #[tokio::test]
    async fn test_publickey_bad_signature_counts() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let other = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        let mut request = AuthRequest::from_bytes(&signed_request(&other, "carol")).unwrap();
        if let MethodData::PublicKey { public_key, .. } = &mut request.method {
            *public_key = key.public_key_blob();
        }
        let status = auth.handle(&request.to_bytes()).await.unwrap();
        assert_eq!(status, AuthStatus::Continue);
        assert_eq!(auth.attempts(), 1);
        assert_eq!(reader.read_packet().await.unwrap().payload[0], 51);
    }

    #[tokio::test]
    async fn test_hostbased_signature_reaches_authenticator() {
        let config = SshServerConfig::builder()
            .with_auth_methods(vec![AuthMethod::Hostbased, AuthMethod::Password])
            .build()
            .unwrap();
        let host = Ed25519HostKey::generate().unwrap();
        let (mut auth, _reader) = service(&config, &host);

        let status = auth
            .handle(&hostbased_request(&host, "dave").to_bytes())
            .await
            .unwrap();
        assert_eq!(
            status,
            AuthStatus::Authenticated {
                user: "dave".into(),
                service: SERVICE_CONNECTION.into()
            }
        );
        assert_eq!(auth.attempts(), 0);
    }

    #[tokio::test]
    async fn test_hostbased_tampered_signature_counts() {
        let config = SshServerConfig::builder()
            .with_auth_methods(vec![AuthMethod::Hostbased, AuthMethod::Password])
            .build()
            .unwrap();
        let host = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &host);

        let mut request = hostbased_request(&host, "dave");
        if let MethodData::Hostbased { client_host, .. } = &mut request.method {
            *client_host = "evil.example.com".into();
        }
        let status = auth.handle(&request.to_bytes()).await.unwrap();
        assert_eq!(status, AuthStatus::Continue);
        assert_eq!(auth.attempts(), 1);
        let failure = AuthFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        assert_eq!(failure.methods_can_continue(), &["hostbased", "password"]);

        let mut request = hostbased_request(&host, "dave");
        if let MethodData::Hostbased { signature, .. } = &mut request.method {
            let last = signature.len() - 1;
            signature[last] ^= 0x01;
        }
        auth.handle(&request.to_bytes()).await.unwrap();
        assert_eq!(auth.attempts(), 2);
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_none_is_not_counted() {
        let config = SshServerConfig::builder()
            .with_auth_methods(vec![AuthMethod::None, AuthMethod::Password])
            .with_max_auth_attempts(1)
            .build()
            .unwrap();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        for _ in 0..3 {
            let request = AuthRequest::new("bob", SERVICE_CONNECTION, MethodData::None);
            assert_eq!(auth.handle(&request.to_bytes()).await.unwrap(), AuthStatus::Continue);
            let failure = AuthFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
            assert_eq!(failure.methods_can_continue(), &["password"]);
        }
        assert_eq!(auth.attempts(), 0);
    }

    #[tokio::test]
    async fn test_partial_success_without_remaining_method_ends_auth() {
        let config = SshServerConfig::builder()
            .with_auth_methods(vec![AuthMethod::Password])
            .build()
            .unwrap();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, _reader) = service(&config, &key);

        let err = auth.handle(&password("mfa", "secret")).await.unwrap_err();
        assert!(matches!(err, KestrelError::Auth(_)));
        assert_eq!(
            err.disconnect_reason(),
            DisconnectReason::NoMoreAuthMethodsAvailable
        );
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_partial_success_removes_method() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        auth.handle(&password("mfa", "secret")).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        let failure = AuthFailure::from_bytes(&reply.payload).unwrap();
        assert!(failure.partial_success());
        assert_eq!(failure.methods_can_continue(), &["publickey"]);
        assert_eq!(auth.methods(), &[AuthMethod::PublicKey]);

        auth.handle(&password("mfa", "secret")).await.unwrap();
        assert_eq!(auth.attempts(), 1);

        let status = auth.handle(&signed_request(&key, "mfa")).await.unwrap();
        assert!(matches!(status, AuthStatus::Authenticated { .. }));
    }

    #[tokio::test]
    async fn test_password_change_flow() {
        let config = SshServerConfig::default();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        auth.handle(&password("expired", "old")).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(PasswdChangeReq::from_bytes(&reply.payload).unwrap().prompt(), "Password expired");

        let change = AuthRequest::new(
            "expired",
            SERVICE_CONNECTION,
            MethodData::Password {
                password: Zeroizing::new("old".into()),
                new_password: Some(Zeroizing::new("new".into())),
            },
        );
        let status = auth.handle(&change.to_bytes()).await.unwrap();
        assert!(matches!(status, AuthStatus::Authenticated { .. }));
    }

    #[tokio::test]
    async fn test_method_not_offered_is_rejected() {
        let config = SshServerConfig::builder()
            .with_auth_methods(vec![AuthMethod::PublicKey])
            .build()
            .unwrap();
        let key = Ed25519HostKey::generate().unwrap();
        let (mut auth, mut reader) = service(&config, &key);

        auth.handle(&password("alice", "secret")).await.unwrap();
        let failure = AuthFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        assert_eq!(failure.methods_can_continue(), &["publickey"]);
        assert_eq!(auth.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timer_fires_once() {
        let (ours, theirs) = duplex(4096);
        let sender = PacketSender::new(Box::new(ours), 35000, "test");
        let mut reader = PacketReader::new(theirs, 35000);
        let _timer = AuthTimer::start(Duration::from_secs(600), sender.clone());

        tokio::time::sleep(Duration::from_secs(601)).await;
        sender.closed().await;
        let packet = reader.read_packet().await.unwrap();
        let msg = Disconnect::from_bytes(&packet.payload).unwrap();
        assert_eq!(msg.reason, DisconnectReason::ByApplication);
        assert!(!sender.disconnect(DisconnectReason::ByApplication, "again").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timer_cancel() {
        let (ours, _theirs) = duplex(4096);
        let sender = PacketSender::new(Box::new(ours), 35000, "test");
        let mut timer = AuthTimer::start(Duration::from_secs(5), sender.clone());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.is_active());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!sender.is_closed());
    }
}
