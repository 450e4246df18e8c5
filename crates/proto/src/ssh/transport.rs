//! SSH Transport Layer State Machine (RFC 4253).
//!
//! This module drives one connection from version exchange through
//! encrypted communication, including key re-exchange.
//!
//! # Transport States
//!
//! 1. **VersionExchange** - Exchange SSH-2.0 identification lines
//! 2. **KexInit** - Our SSH_MSG_KEXINIT is out, waiting for the peer's
//! 3. **KeyExchange** - Algorithms negotiated, waiting for KEXDH_INIT
//! 4. **NewKeys** - Our NEWKEYS is out, waiting for the peer's
//! 5. **Encrypted** - Normal operation
//! 6. **Closed** - Torn down, nothing more is sent or received
//!
//! # Rekeying
//!
//! A KEXINIT from the peer while `Encrypted` starts a re-exchange. The
//! server starts one itself once `rekey_bytes_limit` bytes have passed in
//! either direction. The session identifier stays the first exchange hash
//! and sequence numbers are never reset.
//!
//! # Sending
//!
//! All writes go through [`PacketSender`], a cloneable handle that
//! serializes packets so sequence numbers and cipher state stay
//! consistent. Channel handlers, the auth timer and the session loop all
//! hold one.

use super::algorithm::{guess_is_correct, negotiate, AlgorithmRegistry, AlgorithmSuite};
use super::config::{SshServerConfig, CHANNEL_PACKET_OVERHEAD};
use super::hostkey::HostKeySet;
use super::kex::{server_reply, KexContext, KexInit, NewKeys};
use super::logging;
use super::message::{DebugMessage, Disconnect, MessageType, Unimplemented};
use super::packet::{InboundPacket, OpeningKeys, PacketReader, PacketWriter, SealingKeys};
use super::version::{read_identification, Version};
use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Type-erased read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification lines are being exchanged.
    VersionExchange,

    /// Our KEXINIT has been sent.
    KexInit,

    /// Algorithms negotiated; the method specific exchange is running.
    KeyExchange,

    /// Our NEWKEYS has been sent.
    NewKeys,

    /// Keys installed in both directions.
    Encrypted,

    /// Session torn down.
    Closed,
}

/// Transport layer configuration, derived once from [`SshServerConfig`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification line.
    pub version: Version,

    /// Algorithm capability table.
    pub registry: Arc<AlgorithmRegistry>,

    /// Host keys available for signing.
    pub host_keys: HostKeySet,

    /// Largest packet accepted or produced.
    pub max_packet_size: usize,

    /// Bytes per direction before a server initiated rekey; 0 disables.
    pub rekey_bytes_limit: u64,

    /// Disconnect after this long without a received packet.
    pub idle_timeout: Option<Duration>,
}

impl TransportConfig {
    /// Builds the transport view of a server configuration.
    pub fn from_server_config(config: &SshServerConfig, host_keys: HostKeySet) -> Self {
        Self {
            version: config.version(),
            registry: Arc::clone(&config.registry),
            host_keys,
            max_packet_size: config.max_packet_size,
            rekey_bytes_limit: config.rekey_bytes_limit,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Cloneable, serialized handle to the sending half of a session.
///
/// Teardown is idempotent: the first call to [`disconnect`](Self::disconnect)
/// or [`close`](Self::close) wins, later calls return `false` and sends
/// after that fail.
#[derive(Clone)]
pub struct PacketSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    writer: Mutex<PacketWriter<BoxedWriter>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    max_packet_size: usize,
    peer: String,
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PacketSender {
    /// Wraps the write half of a connection.
    pub fn new(writer: BoxedWriter, max_packet_size: usize, peer: impl Into<String>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SenderInner {
                writer: Mutex::new(PacketWriter::new(writer, max_packet_size)),
                closed: AtomicBool::new(false),
                closed_tx,
                max_packet_size,
                peer: peer.into(),
            }),
        }
    }

    /// Largest channel data chunk that fits one outgoing packet.
    pub fn max_channel_data(&self) -> u32 {
        self.inner
            .max_packet_size
            .saturating_sub(CHANNEL_PACKET_OVERHEAD)
            .min(u32::MAX as usize) as u32
    }

    /// Peer address this sender writes to.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Sends one payload. Non-transport payloads are held back while a key
    /// exchange is running.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Disconnected`] once the session is closed.
    pub async fn send(&self, payload: &[u8]) -> KestrelResult<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        writer.write_payload(payload).await
    }

    /// Bytes sent under the current keys.
    pub async fn bytes_since_kex(&self) -> u64 {
        self.inner.writer.lock().await.bytes_since_kex()
    }

    pub(crate) async fn write_raw(&self, data: &[u8]) -> KestrelResult<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        writer.write_raw(data).await
    }

    pub(crate) async fn begin_kex(&self, kexinit: &[u8]) -> KestrelResult<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        writer.begin_kex();
        writer.write_payload(kexinit).await
    }

    /// Sends KEXDH_REPLY and NEWKEYS under the old keys, then switches.
    pub(crate) async fn finish_kex(&self, reply: &[u8], keys: SealingKeys) -> KestrelResult<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        writer.write_payload(reply).await?;
        writer.send_newkeys(&NewKeys::new().to_bytes(), keys).await
    }

    pub(crate) async fn activate_compression(&self) {
        self.inner.writer.lock().await.activate_compression();
    }

    /// Sends SSH_MSG_DISCONNECT, zeroizes the keys and shuts the stream.
    ///
    /// Returns `true` if this call performed the teardown.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) -> bool {
        if !self.mark_closed() {
            return false;
        }
        let mut writer = self.inner.writer.lock().await;
        let payload = Disconnect::new(reason, description).to_bytes();
        if let Err(e) = writer.write_payload(&payload).await {
            debug!(peer = %self.inner.peer, error = %e, "Could not send disconnect");
        }
        Self::teardown(&mut writer).await;
        logging::log_disconnect(&self.inner.peer, reason, description, true);
        true
    }

    /// Tears down without sending anything, e.g. after the peer
    /// disconnected or the stream failed.
    pub async fn close(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        let mut writer = self.inner.writer.lock().await;
        Self::teardown(&mut writer).await;
        true
    }

    fn mark_closed(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.closed_tx.send_replace(true);
        true
    }

    async fn teardown(writer: &mut PacketWriter<BoxedWriter>) {
        writer.clear_keys();
        let _ = writer.shutdown().await;
    }

    fn ensure_open(&self) -> KestrelResult<()> {
        if self.is_closed() {
            return Err(KestrelError::Disconnected {
                reason: DisconnectReason::ByApplication,
                description: "Session closed".to_string(),
            });
        }
        Ok(())
    }
}

/// Key exchange bookkeeping between KEXINIT and NEWKEYS.
struct PendingKex {
    server_init: KexInit,
    server_kexinit: Vec<u8>,
    client_kexinit: Option<Vec<u8>>,
    suite: Option<AlgorithmSuite>,
    opening: Option<OpeningKeys>,
}

/// Server side of the SSH transport layer for one connection.
pub struct Transport {
    state: State,
    config: Arc<TransportConfig>,
    reader: PacketReader<BoxedReader>,
    sender: PacketSender,
    client_version: Option<Version>,
    session_id: Option<Vec<u8>>,
    suite: Option<AlgorithmSuite>,
    kex: Option<PendingKex>,
    discard_next: bool,
    authenticated: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.sender.peer())
            .field("state", &self.state)
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates a transport over separate read and write halves.
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: Arc<TransportConfig>,
        peer: impl Into<String>,
    ) -> Self {
        let sender = PacketSender::new(writer, config.max_packet_size, peer);
        Self {
            state: State::VersionExchange,
            reader: PacketReader::new(reader, config.max_packet_size),
            config,
            sender,
            client_version: None,
            session_id: None,
            suite: None,
            kex: None,
            discard_next: false,
            authenticated: false,
        }
    }

    /// Creates a transport over a bidirectional stream.
    pub fn from_stream<S>(stream: S, config: Arc<TransportConfig>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(Box::new(r), Box::new(w), config, peer)
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Handle for sending on this connection.
    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Peer address.
    pub fn peer(&self) -> &str {
        self.sender.peer()
    }

    /// The client's identification line, once received.
    pub fn client_version(&self) -> Option<&Version> {
        self.client_version.as_ref()
    }

    /// Our identification line.
    pub fn server_version(&self) -> &Version {
        &self.config.version
    }

    /// Session identifier (first exchange hash), once set.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms in use after the latest completed negotiation.
    pub fn suite(&self) -> Option<&AlgorithmSuite> {
        self.suite.as_ref()
    }

    fn transition(&mut self, next: State) -> KestrelResult<()> {
        let valid = matches!(
            (self.state, next),
            (State::VersionExchange, State::KexInit)
                | (State::KexInit, State::KeyExchange)
                | (State::KeyExchange, State::NewKeys)
                | (State::NewKeys, State::Encrypted)
                | (State::Encrypted, State::KexInit)
                | (_, State::Closed)
        );
        if !valid {
            return Err(KestrelError::Protocol(format!(
                "Invalid transport transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Exchanges identification lines and runs the first key exchange.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::VersionNotSupported`] for a non 2.0 peer
    /// - [`KestrelError::NoCommonAlgorithm`] if negotiation fails
    /// - [`KestrelError::KeyExchange`] on a bad public value
    /// - [`KestrelError::Protocol`] for any service message before NEWKEYS
    pub async fn handshake(&mut self) -> KestrelResult<()> {
        self.sender
            .write_raw(&self.config.version.to_wire_format())
            .await?;
        let client_version = read_identification(self.reader.get_mut()).await?;
        logging::log_peer_version(self.sender.peer(), client_version.as_str());
        self.client_version = Some(client_version);

        self.send_kexinit().await?;
        while self.state != State::Encrypted {
            if let Some(packet) = self.step().await? {
                return Err(KestrelError::Protocol(format!(
                    "Message type {} before key exchange completed",
                    packet.payload[0]
                )));
            }
        }
        Ok(())
    }

    /// Returns the next packet for a higher layer.
    ///
    /// Transport messages (IGNORE, DEBUG, UNIMPLEMENTED, KEX) are consumed
    /// here. A peer DISCONNECT surfaces as [`KestrelError::Disconnected`].
    pub async fn next_packet(&mut self) -> KestrelResult<InboundPacket> {
        loop {
            if self.rekey_due().await {
                logging::log_rekey_start(self.sender.peer(), "server");
                self.send_kexinit().await?;
            }
            let step = match self.config.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, self.step())
                    .await
                    .map_err(|_| KestrelError::Timeout("Idle timeout".to_string()))?,
                None => self.step().await,
            };
            if let Some(packet) = step? {
                return Ok(packet);
            }
        }
    }

    /// Rejects a packet with SSH_MSG_UNIMPLEMENTED.
    pub async fn send_unimplemented(&mut self, sequence: u32) -> KestrelResult<()> {
        let sender = self.sender.clone();
        sender.send(&Unimplemented { sequence }.to_bytes()).await
    }

    /// Marks the user as authenticated and starts delayed compression
    /// (`zlib@openssh.com`) in both directions.
    pub async fn set_authenticated(&mut self) {
        self.authenticated = true;
        self.reader.activate_compression();
        self.sender.activate_compression().await;
    }

    /// Sends DISCONNECT and tears the session down. Idempotent.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        self.shutdown_state();
        self.sender.disconnect(reason, description).await;
    }

    /// Tears the session down without sending. Idempotent.
    pub async fn close(&mut self) {
        self.shutdown_state();
        self.sender.close().await;
    }

    fn shutdown_state(&mut self) {
        self.state = State::Closed;
        self.reader.clear_keys();
        self.kex = None;
    }

    async fn rekey_due(&mut self) -> bool {
        let limit = self.config.rekey_bytes_limit;
        if limit == 0 || self.state != State::Encrypted {
            return false;
        }
        if self.reader.bytes_since_kex() >= limit {
            return true;
        }
        let sender = self.sender.clone();
        sender.bytes_since_kex().await >= limit
    }

    async fn send_kexinit(&mut self) -> KestrelResult<()> {
        let init = self
            .config
            .registry
            .kex_init(&self.config.host_keys.algorithms());
        let payload = init.to_bytes();
        self.sender.begin_kex(&payload).await?;
        self.kex = Some(PendingKex {
            server_init: init,
            server_kexinit: payload,
            client_kexinit: None,
            suite: None,
            opening: None,
        });
        self.transition(State::KexInit)
    }

    /// Reads one packet and handles it if it belongs to the transport.
    async fn step(&mut self) -> KestrelResult<Option<InboundPacket>> {
        let packet = self.reader.read_packet().await?;
        if self.discard_next {
            self.discard_next = false;
            logging::log_guess_discarded(self.sender.peer());
            return Ok(None);
        }

        let msg_id = match packet.payload.first() {
            Some(&id) => id,
            None => return Err(KestrelError::Protocol("Empty payload".to_string())),
        };

        match MessageType::from_u8(msg_id) {
            Some(MessageType::Ignore) => {
                debug!(peer = %self.sender.peer(), seq = packet.sequence, "SSH_MSG_IGNORE");
                Ok(None)
            }
            Some(MessageType::Debug) => {
                let msg = DebugMessage::from_bytes(&packet.payload)?;
                debug!(
                    peer = %self.sender.peer(),
                    always_display = msg.always_display,
                    message = %msg.message,
                    "SSH_MSG_DEBUG"
                );
                Ok(None)
            }
            Some(MessageType::Unimplemented) => {
                let msg = Unimplemented::from_bytes(&packet.payload)?;
                debug!(
                    peer = %self.sender.peer(),
                    rejected_seq = msg.sequence,
                    "Peer rejected a packet"
                );
                Ok(None)
            }
            Some(MessageType::Disconnect) => {
                let msg = Disconnect::from_bytes(&packet.payload)?;
                logging::log_disconnect(self.sender.peer(), msg.reason, &msg.description, false);
                Err(KestrelError::Disconnected {
                    reason: msg.reason,
                    description: msg.description,
                })
            }
            Some(MessageType::KexInit) => {
                self.on_kexinit(&packet.payload).await?;
                Ok(None)
            }
            Some(MessageType::KexdhInit) => {
                self.on_kexdh_init(&packet.payload).await?;
                Ok(None)
            }
            Some(MessageType::NewKeys) => {
                self.on_newkeys(&packet.payload)?;
                Ok(None)
            }
            _ => {
                // Service traffic is allowed once keys exist and the peer has
                // not yet started its half of a re-exchange.
                let passthrough = self.session_id.is_some()
                    && matches!(self.state, State::Encrypted | State::KexInit);
                if !passthrough {
                    return Err(KestrelError::Protocol(format!(
                        "Unexpected message type {} in state {:?}",
                        msg_id, self.state
                    )));
                }
                Ok(Some(packet))
            }
        }
    }

    async fn on_kexinit(&mut self, payload: &[u8]) -> KestrelResult<()> {
        match self.state {
            State::Encrypted => {
                logging::log_rekey_start(self.sender.peer(), "client");
                self.send_kexinit().await?;
            }
            State::KexInit => {}
            state => {
                return Err(KestrelError::Protocol(format!(
                    "Unexpected KEXINIT in state {:?}",
                    state
                )))
            }
        }

        let client = KexInit::from_bytes(payload)?;
        let pending = self.pending_mut()?;
        let suite = negotiate(&client, &pending.server_init)?;
        if client.first_kex_packet_follows() && !guess_is_correct(&client, &suite) {
            self.discard_next = true;
        }
        logging::log_algorithms_negotiated(self.sender.peer(), &suite);

        let pending = self.pending_mut()?;
        pending.client_kexinit = Some(payload.to_vec());
        pending.suite = Some(suite);
        self.transition(State::KeyExchange)
    }

    async fn on_kexdh_init(&mut self, payload: &[u8]) -> KestrelResult<()> {
        if self.state != State::KeyExchange {
            return Err(KestrelError::Protocol(format!(
                "Unexpected KEXDH_INIT in state {:?}",
                self.state
            )));
        }

        let client_version = self
            .client_version
            .as_ref()
            .map(|v| v.as_str().to_string())
            .ok_or_else(|| KestrelError::Protocol("No client identification".to_string()))?;
        let server_version = self.config.version.as_str().to_string();

        let pending = self.pending_mut()?;
        let (client_kexinit, suite) = match (&pending.client_kexinit, &pending.suite) {
            (Some(init), Some(suite)) => (init.clone(), suite.clone()),
            _ => return Err(KestrelError::Protocol("KEXDH_INIT before KEXINIT".to_string())),
        };
        let ctx = KexContext {
            client_version,
            server_version,
            client_kexinit,
            server_kexinit: pending.server_kexinit.clone(),
            suite: suite.clone(),
        };

        let host_key = self.config.host_keys.key_for(suite.host_key).ok_or_else(|| {
            KestrelError::KeyExchange(format!("No host key for {}", suite.host_key.name()))
        })?;
        let (reply, output) = server_reply(ctx, payload, host_key)?;

        let rekey = self.session_id.is_some();
        let session_id = self
            .session_id
            .get_or_insert_with(|| output.exchange_hash.clone())
            .clone();
        let keys = output.session_keys(&session_id);

        let mut sealing = SealingKeys::new(
            suite.server_to_client,
            &keys.iv_server_to_client,
            &keys.enc_server_to_client,
            &keys.mac_server_to_client,
        )?;
        let mut opening = OpeningKeys::new(
            suite.client_to_server,
            &keys.iv_client_to_server,
            &keys.enc_client_to_server,
            &keys.mac_client_to_server,
        )?;
        if self.authenticated {
            sealing.activate_compression();
            opening.activate_compression();
        }

        self.sender.finish_kex(&reply, sealing).await?;
        self.pending_mut()?.opening = Some(opening);
        self.suite = Some(suite);
        logging::log_kex_complete(self.sender.peer(), &session_id, rekey);
        self.transition(State::NewKeys)
    }

    fn on_newkeys(&mut self, payload: &[u8]) -> KestrelResult<()> {
        NewKeys::from_bytes(payload)?;
        if self.state != State::NewKeys {
            return Err(KestrelError::Protocol(format!(
                "Unexpected NEWKEYS in state {:?}",
                self.state
            )));
        }
        let opening = self
            .kex
            .take()
            .and_then(|pending| pending.opening)
            .ok_or_else(|| KestrelError::Protocol("NEWKEYS without derived keys".to_string()))?;
        self.reader.set_keys(opening);
        self.transition(State::Encrypted)
    }

    fn pending_mut(&mut self) -> KestrelResult<&mut PendingKex> {
        self.kex
            .as_mut()
            .ok_or_else(|| KestrelError::Protocol("No key exchange in progress".to_string()))
    }
}
