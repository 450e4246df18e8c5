//! SSH Client implementation.
//!
//! A small protocol client that speaks to [`SshServer`](super::server::SshServer).
//! It runs the key exchange, authenticates, opens channels and executes
//! commands. It is used by the integration tests and for interop checks;
//! host key trust is left to the caller via [`SshClient::server_host_key`].
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::algorithm::AlgorithmRegistry;
//! use kestrel_proto::ssh::client::{AuthReply, SshClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect_tcp("127.0.0.1:2222", &AlgorithmRegistry::default()).await?;
//! client.request_service("ssh-userauth").await?;
//! assert_eq!(client.authenticate_password("admin", "secret").await?, AuthReply::Success);
//!
//! let output = client.execute("whoami").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use super::algorithm::{negotiate, AlgorithmRegistry, AlgorithmSuite};
use super::auth::{AuthFailure, AuthPkOk, AuthRequest, MethodData, PasswdChangeReq, SERVICE_CONNECTION};
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelType, ChannelWindowAdjust, GlobalRequest, EXTENDED_DATA_STDERR,
};
use super::hostkey::{HostKey, HostKeyAlgorithm, PublicKey};
use super::kex::{ClientKex, KexContext, KexInit, NewKeys};
use super::message::{Disconnect, MessageType, ServiceAccept, ServiceRequest};
use super::packet::{OpeningKeys, PacketReader, PacketWriter, SealingKeys, MAX_PACKET_SIZE};
use super::transport::{BoxedReader, BoxedWriter};
use super::version::{read_identification, Version};
use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Software version the client announces.
pub const CLIENT_SOFTWARE: &str = "KestrelClient_0.1";

const CLIENT_WINDOW: u32 = 2 * 1024 * 1024;
const CLIENT_MAX_PACKET: u32 = 32 * 1024;

/// Server answer to an authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// SSH_MSG_USERAUTH_SUCCESS
    Success,
    /// SSH_MSG_USERAUTH_FAILURE
    Failure {
        /// Methods that can continue
        methods: Vec<String>,
        /// Partial success flag
        partial_success: bool,
    },
    /// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ
    PasswordChangeRequired(String),
}

/// A channel opened by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientChannel {
    /// Our channel number
    pub local_id: u32,
    /// The server's channel number
    pub remote_id: u32,
    /// Window the server granted us
    pub remote_window: u32,
    /// Largest data packet the server accepts
    pub remote_max_packet: u32,
}

/// Output of [`SshClient::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Channel data
    pub stdout: Vec<u8>,
    /// Extended data of type stderr
    pub stderr: Vec<u8>,
    /// Value of the `exit-status` request, if one arrived
    pub exit_status: Option<u32>,
}

/// SSH client.
pub struct SshClient {
    reader: PacketReader<BoxedReader>,
    writer: PacketWriter<BoxedWriter>,
    registry: AlgorithmRegistry,
    version: Version,
    server_version: Option<Version>,
    session_id: Vec<u8>,
    server_host_key: Option<PublicKey>,
    suite: Option<AlgorithmSuite>,
    authenticated: bool,
    banners: Vec<String>,
    pending: VecDeque<Vec<u8>>,
    next_channel: u32,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_version", &self.server_version)
            .field("suite", &self.suite)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Connects over TCP and runs the key exchange.
    pub async fn connect_tcp(addr: &str, registry: &AlgorithmRegistry) -> KestrelResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::connect(stream, registry).await
    }

    /// Runs version exchange and the first key exchange over `stream`.
    pub async fn connect<S>(stream: S, registry: &AlgorithmRegistry) -> KestrelResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut client = Self {
            reader: PacketReader::new(Box::new(r) as BoxedReader, MAX_PACKET_SIZE),
            writer: PacketWriter::new(Box::new(w) as BoxedWriter, MAX_PACKET_SIZE),
            registry: registry.clone(),
            version: Version::new(CLIENT_SOFTWARE, None),
            server_version: None,
            session_id: Vec::new(),
            server_host_key: None,
            suite: None,
            authenticated: false,
            banners: Vec::new(),
            pending: VecDeque::new(),
            next_channel: 0,
        };

        client.writer.write_raw(&client.version.to_wire_format()).await?;
        let server_version = read_identification(client.reader.get_mut()).await?;
        client.server_version = Some(server_version);
        client.key_exchange(None).await?;
        Ok(client)
    }

    /// Session identifier (first exchange hash).
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The server's identification line.
    pub fn server_version(&self) -> Option<&Version> {
        self.server_version.as_ref()
    }

    /// Host key the server proved possession of in the latest exchange.
    pub fn server_host_key(&self) -> Option<&PublicKey> {
        self.server_host_key.as_ref()
    }

    /// Negotiated algorithms.
    pub fn suite(&self) -> Option<&AlgorithmSuite> {
        self.suite.as_ref()
    }

    /// Banners received during authentication.
    pub fn banners(&self) -> &[String] {
        &self.banners
    }

    /// Whether authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Starts a key re-exchange.
    pub async fn rekey(&mut self) -> KestrelResult<()> {
        self.key_exchange(None).await
    }

    async fn key_exchange(&mut self, server_kexinit: Option<Vec<u8>>) -> KestrelResult<()> {
        let init = self.registry.kex_init(self.registry.host_keys());
        let client_kexinit = init.to_bytes();
        self.writer.begin_kex();
        self.writer.write_payload(&client_kexinit).await?;

        let server_kexinit = match server_kexinit {
            Some(payload) => payload,
            None => self.read_kex_message(MessageType::KexInit).await?,
        };
        let server_init = KexInit::from_bytes(&server_kexinit)?;
        let suite = negotiate(&init, &server_init)?;

        let server_version = self
            .server_version
            .as_ref()
            .map(|v| v.as_str().to_string())
            .ok_or_else(|| KestrelError::Protocol("No server identification".to_string()))?;
        let (kex, kexdh_init) = ClientKex::start(KexContext {
            client_version: self.version.as_str().to_string(),
            server_version,
            client_kexinit,
            server_kexinit,
            suite: suite.clone(),
        })?;
        self.writer.write_payload(&kexdh_init).await?;

        let reply = self.read_kex_message(MessageType::KexdhReply).await?;
        let (output, host_key) = kex.finish(&reply)?;
        if self.session_id.is_empty() {
            self.session_id = output.exchange_hash.clone();
        }
        let keys = output.session_keys(&self.session_id);

        let mut sealing = SealingKeys::new(
            suite.client_to_server,
            &keys.iv_client_to_server,
            &keys.enc_client_to_server,
            &keys.mac_client_to_server,
        )?;
        let mut opening = OpeningKeys::new(
            suite.server_to_client,
            &keys.iv_server_to_client,
            &keys.enc_server_to_client,
            &keys.mac_server_to_client,
        )?;
        if self.authenticated {
            sealing.activate_compression();
            opening.activate_compression();
        }

        self.writer
            .send_newkeys(&NewKeys::new().to_bytes(), sealing)
            .await?;
        let newkeys = self.read_kex_message(MessageType::NewKeys).await?;
        NewKeys::from_bytes(&newkeys)?;
        self.reader.set_keys(opening);

        debug!(suite = %suite, "Client key exchange complete");
        self.server_host_key = Some(host_key);
        self.suite = Some(suite);
        Ok(())
    }

    /// Reads until a packet of type `expected` arrives. Service messages
    /// received meanwhile are queued for [`recv`](Self::recv).
    async fn read_kex_message(&mut self, expected: MessageType) -> KestrelResult<Vec<u8>> {
        loop {
            let payload = self.read_transport().await?;
            match payload.first() {
                Some(&id) if id == expected as u8 => return Ok(payload),
                Some(&id) if (20..=49).contains(&id) => {
                    return Err(KestrelError::Protocol(format!(
                        "Expected {}, got message type {}",
                        expected, id
                    )))
                }
                _ => self.pending.push_back(payload),
            }
        }
    }

    /// Reads one packet, consuming IGNORE, DEBUG and UNIMPLEMENTED.
    async fn read_transport(&mut self) -> KestrelResult<Vec<u8>> {
        loop {
            let packet = self.reader.read_packet().await?;
            match packet.payload.first().copied().and_then(MessageType::from_u8) {
                Some(MessageType::Ignore | MessageType::Debug | MessageType::Unimplemented) => {
                    continue
                }
                Some(MessageType::Disconnect) => {
                    let msg = Disconnect::from_bytes(&packet.payload)?;
                    return Err(KestrelError::Disconnected {
                        reason: msg.reason,
                        description: msg.description,
                    });
                }
                _ => return Ok(packet.payload),
            }
        }
    }

    /// Sends one payload.
    pub async fn send(&mut self, payload: &[u8]) -> KestrelResult<()> {
        self.writer.write_payload(payload).await
    }

    /// Receives the next non transport payload. A server KEXINIT runs a
    /// re-exchange first; a DISCONNECT is returned as
    /// [`KestrelError::Disconnected`].
    pub async fn recv(&mut self) -> KestrelResult<Vec<u8>> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(payload);
        }
        loop {
            let payload = self.read_transport().await?;
            if payload.first() == Some(&(MessageType::KexInit as u8)) {
                self.key_exchange(Some(payload)).await?;
                if let Some(payload) = self.pending.pop_front() {
                    return Ok(payload);
                }
                continue;
            }
            return Ok(payload);
        }
    }

    /// Receives the next payload other than a USERAUTH_BANNER. Banners are
    /// collected in [`banners`](Self::banners).
    async fn recv_skip_banner(&mut self) -> KestrelResult<Vec<u8>> {
        loop {
            let payload = self.recv().await?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                let banner = super::auth::AuthBanner::from_bytes(&payload)?;
                self.banners.push(banner.message().to_string());
                continue;
            }
            return Ok(payload);
        }
    }

    /// Requests a service and waits for SERVICE_ACCEPT.
    pub async fn request_service(&mut self, name: &str) -> KestrelResult<()> {
        self.send(
            &ServiceRequest {
                service_name: name.to_string(),
            }
            .to_bytes(),
        )
        .await?;
        let accept = ServiceAccept::from_bytes(&self.recv().await?)?;
        if accept.service_name != name {
            return Err(KestrelError::Protocol(format!(
                "Accepted service {} instead of {}",
                accept.service_name, name
            )));
        }
        Ok(())
    }

    /// Sends a USERAUTH_REQUEST and reads the answer.
    pub async fn authenticate(&mut self, request: &AuthRequest) -> KestrelResult<AuthReply> {
        self.send(&request.to_bytes()).await?;
        let payload = self.recv_skip_banner().await?;
        match payload.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthSuccess) => {
                self.authenticated = true;
                self.reader.activate_compression();
                self.writer.activate_compression();
                Ok(AuthReply::Success)
            }
            Some(MessageType::UserauthFailure) => {
                let failure = AuthFailure::from_bytes(&payload)?;
                Ok(AuthReply::Failure {
                    methods: failure.methods_can_continue().to_vec(),
                    partial_success: failure.partial_success(),
                })
            }
            Some(MessageType::UserauthPkOk) if matches!(request.method(), MethodData::Password { .. }) => {
                let change = PasswdChangeReq::from_bytes(&payload)?;
                Ok(AuthReply::PasswordChangeRequired(change.prompt().to_string()))
            }
            _ => Err(KestrelError::Protocol(format!(
                "Unexpected authentication reply type {}",
                payload.first().copied().unwrap_or(0)
            ))),
        }
    }

    /// "none" authentication; the failure lists the methods the server offers.
    pub async fn authenticate_none(&mut self, user: &str) -> KestrelResult<AuthReply> {
        self.authenticate(&AuthRequest::new(user, SERVICE_CONNECTION, MethodData::None))
            .await
    }

    /// Password authentication.
    pub async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> KestrelResult<AuthReply> {
        self.authenticate(&AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::password(password),
        ))
        .await
    }

    /// Password change after SSH_MSG_USERAUTH_PASSWD_CHANGEREQ.
    pub async fn change_password(
        &mut self,
        user: &str,
        old_password: &str,
        new_password: &str,
    ) -> KestrelResult<AuthReply> {
        self.authenticate(&AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::Password {
                password: old_password.to_string().into(),
                new_password: Some(new_password.to_string().into()),
            },
        ))
        .await
    }

    /// Asks whether the server would accept `key` without signing.
    pub async fn query_publickey(
        &mut self,
        user: &str,
        algorithm: HostKeyAlgorithm,
        key: &dyn HostKey,
    ) -> KestrelResult<bool> {
        let request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::PublicKey {
                algorithm: algorithm.name().to_string(),
                public_key: key.public_key_blob(),
                signature: None,
            },
        );
        self.send(&request.to_bytes()).await?;
        let payload = self.recv_skip_banner().await?;
        match payload.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthPkOk) => {
                AuthPkOk::from_bytes(&payload)?;
                Ok(true)
            }
            Some(MessageType::UserauthFailure) => Ok(false),
            _ => Err(KestrelError::Protocol("Unexpected reply to key query".to_string())),
        }
    }

    /// Public key authentication with a signature over the session id.
    pub async fn authenticate_publickey(
        &mut self,
        user: &str,
        algorithm: HostKeyAlgorithm,
        key: &dyn HostKey,
    ) -> KestrelResult<AuthReply> {
        let unsigned = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::PublicKey {
                algorithm: algorithm.name().to_string(),
                public_key: key.public_key_blob(),
                signature: None,
            },
        );
        let signature = key.sign(algorithm, &unsigned.signature_data(&self.session_id))?;
        let signed = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            MethodData::PublicKey {
                algorithm: algorithm.name().to_string(),
                public_key: key.public_key_blob(),
                signature: Some(signature),
            },
        );
        self.authenticate(&signed).await
    }

    /// Host based authentication, signing with the client host key.
    pub async fn authenticate_hostbased(
        &mut self,
        user: &str,
        algorithm: HostKeyAlgorithm,
        host_key: &dyn HostKey,
        client_host: &str,
        client_user: &str,
    ) -> KestrelResult<AuthReply> {
        let method = |signature: Vec<u8>| MethodData::Hostbased {
            algorithm: algorithm.name().to_string(),
            host_key: host_key.public_key_blob(),
            client_host: client_host.to_string(),
            client_user: client_user.to_string(),
            signature,
        };
        let unsigned = AuthRequest::new(user, SERVICE_CONNECTION, method(Vec::new()));
        let signature = host_key.sign(algorithm, &unsigned.signature_data(&self.session_id))?;
        self.authenticate(&AuthRequest::new(user, SERVICE_CONNECTION, method(signature)))
            .await
    }

    /// Opens a channel. Returns the failure reason if the server refuses.
    pub async fn open_channel(
        &mut self,
        channel_type: ChannelType,
    ) -> KestrelResult<Result<ClientChannel, ChannelOpenFailureReason>> {
        let local_id = self.next_channel;
        self.next_channel += 1;
        self.send(&ChannelOpen::new(channel_type, local_id, CLIENT_WINDOW, CLIENT_MAX_PACKET).to_bytes())
            .await?;

        loop {
            let payload = self.recv().await?;
            match payload.first().copied().and_then(MessageType::from_u8) {
                Some(MessageType::ChannelOpenConfirmation) => {
                    let confirm = ChannelOpenConfirmation::from_bytes(&payload)?;
                    if confirm.recipient_channel() != local_id {
                        continue;
                    }
                    return Ok(Ok(ClientChannel {
                        local_id,
                        remote_id: confirm.sender_channel(),
                        remote_window: confirm.initial_window_size(),
                        remote_max_packet: confirm.maximum_packet_size(),
                    }));
                }
                Some(MessageType::ChannelOpenFailure) => {
                    let failure = ChannelOpenFailure::from_bytes(&payload)?;
                    if failure.recipient_channel() == local_id {
                        return Ok(Err(failure.reason_code()));
                    }
                }
                _ => {}
            }
        }
    }

    /// Opens a `session` channel.
    pub async fn open_session(&mut self) -> KestrelResult<ClientChannel> {
        self.open_channel(ChannelType::Session)
            .await?
            .map_err(|reason| {
                KestrelError::channel(
                    self.next_channel.saturating_sub(1),
                    format!("Session refused: {}", reason.as_str()),
                )
            })
    }

    /// Sends a channel request. With `want_reply` waits for the answer;
    /// other packets that arrive first are kept for [`recv`](Self::recv).
    pub async fn channel_request(
        &mut self,
        channel: &ClientChannel,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> KestrelResult<Option<bool>> {
        self.send(&ChannelRequest::new(channel.remote_id, request, want_reply).to_bytes())
            .await?;
        if !want_reply {
            return Ok(None);
        }
        self.wait_for_reply(&[
            MessageType::ChannelSuccess as u8,
            MessageType::ChannelFailure as u8,
        ])
        .await
        .map(|id| Some(id == MessageType::ChannelSuccess as u8))
    }

    /// Sends a global request. With `want_reply` waits for the answer.
    pub async fn global_request(&mut self, name: &str, want_reply: bool) -> KestrelResult<Option<bool>> {
        self.send(
            &GlobalRequest {
                name: name.to_string(),
                want_reply,
                data: Vec::new(),
            }
            .to_bytes(),
        )
        .await?;
        if !want_reply {
            return Ok(None);
        }
        self.wait_for_reply(&[
            MessageType::RequestSuccess as u8,
            MessageType::RequestFailure as u8,
        ])
        .await
        .map(|id| Some(id == MessageType::RequestSuccess as u8))
    }

    /// Sends `keepalive@openssh.com` and waits for the answer.
    pub async fn send_keepalive(&mut self) -> KestrelResult<bool> {
        Ok(self
            .global_request(super::connection_mgr::KEEPALIVE_REQUEST, true)
            .await?
            .unwrap_or(false))
    }

    async fn wait_for_reply(&mut self, ids: &[u8]) -> KestrelResult<u8> {
        let mut skipped = VecDeque::new();
        let result = loop {
            let payload = match self.recv().await {
                Ok(payload) => payload,
                Err(e) => break Err(e),
            };
            match payload.first() {
                Some(id) if ids.contains(id) => break Ok(*id),
                _ => skipped.push_back(payload),
            }
        };
        skipped.append(&mut self.pending);
        self.pending = skipped;
        result
    }

    /// Sends channel data.
    pub async fn send_data(&mut self, channel: &ClientChannel, data: &[u8]) -> KestrelResult<()> {
        self.send(&ChannelData::new(channel.remote_id, data.to_vec()).to_bytes())
            .await
    }

    /// Grants the server more window on `channel`.
    pub async fn adjust_window(&mut self, channel: &ClientChannel, bytes: u32) -> KestrelResult<()> {
        self.send(&ChannelWindowAdjust::new(channel.remote_id, bytes).to_bytes())
            .await
    }

    /// Sends CHANNEL_EOF.
    pub async fn send_eof(&mut self, channel: &ClientChannel) -> KestrelResult<()> {
        self.send(&ChannelEof::new(channel.remote_id).to_bytes()).await
    }

    /// Sends CHANNEL_CLOSE.
    pub async fn close_channel(&mut self, channel: &ClientChannel) -> KestrelResult<()> {
        self.send(&ChannelClose::new(channel.remote_id).to_bytes()).await
    }

    /// Collects output of `channel` until the server closes it, then
    /// answers with CHANNEL_CLOSE.
    pub async fn collect_output(&mut self, channel: &ClientChannel) -> KestrelResult<ExecOutput> {
        let mut output = ExecOutput::default();
        let mut consumed: u32 = 0;
        loop {
            let payload = self.recv().await?;
            match payload.first().copied().and_then(MessageType::from_u8) {
                Some(MessageType::ChannelData) => {
                    let data = ChannelData::from_bytes(&payload)?;
                    consumed += data.data().len() as u32;
                    output.stdout.extend_from_slice(data.data());
                }
                Some(MessageType::ChannelExtendedData) => {
                    let data = ChannelExtendedData::from_bytes(&payload)?;
                    consumed += data.data().len() as u32;
                    if data.data_type_code() == EXTENDED_DATA_STDERR {
                        output.stderr.extend_from_slice(data.data());
                    }
                }
                Some(MessageType::ChannelRequest) => {
                    let request = ChannelRequest::from_bytes(&payload)?;
                    if let ChannelRequestType::ExitStatus { exit_status } = request.request_type() {
                        output.exit_status = Some(*exit_status);
                    }
                }
                Some(MessageType::ChannelClose) => {
                    self.close_channel(channel).await?;
                    return Ok(output);
                }
                _ => {}
            }
            if consumed >= CLIENT_WINDOW / 2 {
                self.adjust_window(channel, consumed).await?;
                consumed = 0;
            }
        }
    }

    /// Opens a session, runs `command` and returns its output.
    pub async fn execute(&mut self, command: &str) -> KestrelResult<ExecOutput> {
        if !self.authenticated {
            return Err(KestrelError::Protocol("Not authenticated".to_string()));
        }
        let channel = self.open_session().await?;
        let accepted = self
            .channel_request(
                &channel,
                ChannelRequestType::Exec {
                    command: command.to_string(),
                },
                true,
            )
            .await?;
        if accepted != Some(true) {
            return Err(KestrelError::channel(
                channel.local_id,
                format!("exec refused: {}", command),
            ));
        }
        self.collect_output(&channel).await
    }

    /// Sends DISCONNECT (BY_APPLICATION) and shuts the connection down.
    pub async fn disconnect(&mut self) -> KestrelResult<()> {
        self.send(&Disconnect::new(DisconnectReason::ByApplication, "Client disconnecting").to_bytes())
            .await?;
        self.writer.shutdown().await
    }
}
