//! SSH Channel management.
//!
//! A channel is one logical stream multiplexed over the connection. This
//! module holds the per-channel state machine and flow control, and the
//! capability interface every channel kind implements:
//!
//! - [`ChannelHandler`]: `open`, `process_data`, `process_request`, `close`
//! - [`ChannelKind`]: the closed set of kinds (`Session`, `Forwarded`,
//!   `Custom`) dispatched through that interface
//! - [`ChannelHandle`]: cloneable sending side that tracks the peer's
//!   window, usable from any task
//!
//! # Flow control
//!
//! The handle never transmits more data than the peer's advertised window.
//! [`ChannelHandle::send_data`] waits for WINDOW_ADJUST when the window is
//! exhausted; [`ChannelHandle::try_send_data`] fails instead. On the
//! receiving side [`Channel::consume_window`] rejects data beyond our
//! window and reports when a WINDOW_ADJUST is due.

use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelRequest,
    ChannelRequestType, ForwardTarget, PtyRequest, TerminalSize,
};
use super::transport::PacketSender;
use async_trait::async_trait;
use kestrel_platform::{KestrelError, KestrelResult};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// SSH Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open received, confirmation not yet sent
    Opening,
    /// Channel is open and ready
    Open,
    /// One side has sent CLOSE
    Closing,
    /// Both CLOSE messages exchanged
    Closed,
}

/// Window and packet limits we advertise for each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Initial window advertised to the peer
    pub initial_window: u32,
    /// Largest data chunk we accept per packet
    pub max_packet: u32,
    /// Send WINDOW_ADJUST once the window falls below this
    pub replenish_threshold: u32,
}

#[derive(Debug, Default)]
struct SendState {
    window: u32,
    eof_sent: bool,
    close_sent: bool,
}

#[derive(Debug, Default)]
struct SendShared {
    state: Mutex<SendState>,
    window_changed: Notify,
}

/// Sending side of one channel.
///
/// Clones share the peer's window, so concurrent writers never exceed it
/// together.
#[derive(Clone)]
pub struct ChannelHandle {
    local_id: u32,
    remote_id: u32,
    max_packet: u32,
    sender: PacketSender,
    shared: Arc<SendShared>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("max_packet", &self.max_packet)
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
        sender: PacketSender,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            max_packet: remote_max_packet.min(sender.max_channel_data()).max(1),
            sender,
            shared: Arc::new(SendShared {
                state: Mutex::new(SendState {
                    window: remote_window,
                    ..SendState::default()
                }),
                window_changed: Notify::new(),
            }),
        }
    }

    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Largest data chunk sent per packet: the peer's maximum, capped by
    /// our own transport packet limit.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet
    }

    /// Bytes we may still send before the peer adjusts the window.
    pub async fn remote_window(&self) -> u32 {
        self.shared.state.lock().await.window
    }

    /// Whether CLOSE has been sent on this channel.
    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.close_sent
    }

    /// Sends `data` as one packet if it fits the current window.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Channel`] without sending anything if `data`
    /// exceeds the peer's window or maximum packet size, or after EOF or
    /// CLOSE was sent.
    pub async fn try_send_data(&self, data: &[u8]) -> KestrelResult<()> {
        self.try_send(None, data).await
    }

    /// Like [`try_send_data`](Self::try_send_data) for extended data.
    pub async fn try_send_extended_data(&self, code: u32, data: &[u8]) -> KestrelResult<()> {
        self.try_send(Some(code), data).await
    }

    /// Sends `data`, split to the peer's packet size, waiting for window
    /// space as needed.
    ///
    /// Must not be awaited from inside a [`ChannelHandler`] callback when
    /// the window may be exhausted: the WINDOW_ADJUST that unblocks it is
    /// processed on the same session task. Spawn a task instead.
    pub async fn send_data(&self, data: &[u8]) -> KestrelResult<()> {
        self.send_chunked(None, data).await
    }

    /// Sends extended data (e.g. stderr), waiting for window space.
    pub async fn send_extended_data(&self, code: u32, data: &[u8]) -> KestrelResult<()> {
        self.send_chunked(Some(code), data).await
    }

    /// Sends CHANNEL_EOF once; later calls are no-ops.
    pub async fn send_eof(&self) -> KestrelResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.eof_sent || state.close_sent {
            return Ok(());
        }
        state.eof_sent = true;
        self.sender
            .send(&ChannelEof::new(self.remote_id).to_bytes())
            .await
    }

    /// Reports the exit status of the command run on this channel.
    pub async fn send_exit_status(&self, exit_status: u32) -> KestrelResult<()> {
        let state = self.shared.state.lock().await;
        if state.close_sent {
            return Err(self.closed_error());
        }
        let request = ChannelRequest::new(
            self.remote_id,
            ChannelRequestType::ExitStatus { exit_status },
            false,
        );
        self.sender.send(&request.to_bytes()).await
    }

    /// Sends CHANNEL_CLOSE once. Returns `true` if this call sent it.
    ///
    /// Writers blocked on the window are woken and fail.
    pub async fn close(&self) -> KestrelResult<bool> {
        let mut state = self.shared.state.lock().await;
        if state.close_sent {
            return Ok(false);
        }
        state.close_sent = true;
        drop(state);
        self.shared.window_changed.notify_waiters();
        self.sender
            .send(&ChannelClose::new(self.remote_id).to_bytes())
            .await?;
        Ok(true)
    }

    /// Adds `bytes` to the peer's window.
    pub(crate) async fn adjust_window(&self, bytes: u32) -> KestrelResult<()> {
        let mut state = self.shared.state.lock().await;
        state.window = state.window.checked_add(bytes).ok_or_else(|| {
            KestrelError::channel(self.local_id, "Window adjust overflows 2^32 - 1")
        })?;
        drop(state);
        self.shared.window_changed.notify_waiters();
        Ok(())
    }

    async fn try_send(&self, code: Option<u32>, data: &[u8]) -> KestrelResult<()> {
        let mut state = self.shared.state.lock().await;
        self.check_writable(&state)?;
        if data.len() > self.max_packet as usize {
            return Err(KestrelError::channel(
                self.local_id,
                format!(
                    "{} bytes exceed the peer's maximum packet of {}",
                    data.len(),
                    self.max_packet
                ),
            ));
        }
        if data.len() > state.window as usize {
            return Err(KestrelError::channel(
                self.local_id,
                format!(
                    "{} bytes exceed the remaining window of {}",
                    data.len(),
                    state.window
                ),
            ));
        }
        self.sender.send(&self.encode(code, data)).await?;
        state.window -= data.len() as u32;
        Ok(())
    }

    async fn send_chunked(&self, code: Option<u32>, mut data: &[u8]) -> KestrelResult<()> {
        while !data.is_empty() {
            let window_changed = self.shared.window_changed.notified();
            {
                let mut state = self.shared.state.lock().await;
                self.check_writable(&state)?;
                if state.window > 0 {
                    let n = data
                        .len()
                        .min(state.window as usize)
                        .min(self.max_packet as usize);
                    self.sender.send(&self.encode(code, &data[..n])).await?;
                    state.window -= n as u32;
                    data = &data[n..];
                    continue;
                }
            }
            window_changed.await;
        }
        Ok(())
    }

    fn encode(&self, code: Option<u32>, data: &[u8]) -> Vec<u8> {
        match code {
            None => ChannelData::new(self.remote_id, data.to_vec()).to_bytes(),
            Some(code) => ChannelExtendedData::new(self.remote_id, code, data.to_vec()).to_bytes(),
        }
    }

    fn check_writable(&self, state: &SendState) -> KestrelResult<()> {
        if state.close_sent {
            return Err(self.closed_error());
        }
        if state.eof_sent {
            return Err(KestrelError::channel(self.local_id, "EOF already sent"));
        }
        Ok(())
    }

    fn closed_error(&self) -> KestrelError {
        KestrelError::channel(self.local_id, "Channel closed")
    }
}

/// Capability interface shared by every channel kind.
///
/// Callbacks run on the session's own task, one at a time, in the order
/// the messages arrived.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Called once the open has been confirmed.
    async fn open(&mut self, _channel: &ChannelHandle) -> KestrelResult<()> {
        Ok(())
    }

    /// Data received from the peer.
    async fn process_data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()>;

    /// Extended data received from the peer.
    async fn process_extended_data(
        &mut self,
        _channel: &ChannelHandle,
        _code: u32,
        _data: &[u8],
    ) -> KestrelResult<()> {
        Ok(())
    }

    /// The peer will send no more data.
    async fn process_eof(&mut self, _channel: &ChannelHandle) -> KestrelResult<()> {
        Ok(())
    }

    /// A channel request; the return value decides SUCCESS or FAILURE.
    async fn process_request(
        &mut self,
        channel: &ChannelHandle,
        request: &ChannelRequestType,
    ) -> KestrelResult<bool>;

    /// The channel is being removed.
    async fn close(&mut self, _channel: &ChannelHandle) {}
}

/// Application side of a `session` channel (process or pty abstraction).
///
/// Output is written through the [`ChannelHandle`] passed to `shell`,
/// `exec` or `subsystem`, usually from a spawned task.
#[async_trait]
pub trait SessionConsumer: Send + Sync {
    /// A pseudo-terminal was requested.
    async fn pty_request(&mut self, _pty: &PtyRequest) -> bool {
        true
    }

    /// An environment variable was passed.
    async fn env(&mut self, _name: &str, _value: &str) -> bool {
        false
    }

    /// Start an interactive shell.
    async fn shell(&mut self, channel: &ChannelHandle, pty: Option<&PtyRequest>) -> bool;

    /// Run one command.
    async fn exec(&mut self, channel: &ChannelHandle, command: &str) -> bool;

    /// Start a named subsystem.
    async fn subsystem(&mut self, _channel: &ChannelHandle, _name: &str) -> bool {
        false
    }

    /// The client's terminal was resized.
    async fn window_change(&mut self, _size: TerminalSize) {}

    /// The client asked to deliver a signal.
    async fn signal(&mut self, _name: &str) {}

    /// Input from the client.
    async fn data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()>;

    /// The client closed its input.
    async fn eof(&mut self, _channel: &ChannelHandle) {}

    /// The channel is gone.
    async fn closed(&mut self) {}
}

/// Built-in `session` channel: interprets session requests and hands the
/// payload to a [`SessionConsumer`].
pub struct SessionChannel {
    consumer: Box<dyn SessionConsumer>,
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    started: bool,
}

impl SessionChannel {
    /// Wraps a consumer.
    pub fn new(consumer: Box<dyn SessionConsumer>) -> Self {
        Self {
            consumer,
            pty: None,
            env: Vec::new(),
            started: false,
        }
    }

    /// Accepted pty request, if any.
    pub fn pty(&self) -> Option<&PtyRequest> {
        self.pty.as_ref()
    }

    /// Accepted environment variables.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Whether a shell, command or subsystem is running.
    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[async_trait]
impl ChannelHandler for SessionChannel {
    async fn process_data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
        self.consumer.data(channel, data).await
    }

    async fn process_eof(&mut self, channel: &ChannelHandle) -> KestrelResult<()> {
        self.consumer.eof(channel).await;
        Ok(())
    }

    async fn process_request(
        &mut self,
        channel: &ChannelHandle,
        request: &ChannelRequestType,
    ) -> KestrelResult<bool> {
        let accepted = match request {
            ChannelRequestType::PtyReq(pty) if !self.started => {
                let ok = self.consumer.pty_request(pty).await;
                if ok {
                    self.pty = Some(pty.clone());
                }
                ok
            }
            ChannelRequestType::Env { name, value } if !self.started => {
                let ok = self.consumer.env(name, value).await;
                if ok {
                    self.env.push((name.clone(), value.clone()));
                }
                ok
            }
            ChannelRequestType::Shell if !self.started => {
                self.started = self.consumer.shell(channel, self.pty.as_ref()).await;
                self.started
            }
            ChannelRequestType::Exec { command } if !self.started => {
                self.started = self.consumer.exec(channel, command).await;
                self.started
            }
            ChannelRequestType::Subsystem { name } if !self.started => {
                self.started = self.consumer.subsystem(channel, name).await;
                self.started
            }
            ChannelRequestType::WindowChange(size) => {
                self.consumer.window_change(*size).await;
                true
            }
            ChannelRequestType::Signal { name } => {
                self.consumer.signal(name).await;
                true
            }
            _ => false,
        };
        Ok(accepted)
    }

    async fn close(&mut self, _channel: &ChannelHandle) {
        self.consumer.closed().await;
    }
}

/// `direct-tcpip` channel: carries bytes to a forwarding target.
///
/// The connection to the target is made by the consumer; this kind only
/// keeps the target and refuses channel requests.
pub struct ForwardedChannel {
    target: ForwardTarget,
    consumer: Box<dyn ChannelHandler>,
}

impl ForwardedChannel {
    /// Wraps the consumer that relays bytes to `target`.
    pub fn new(target: ForwardTarget, consumer: Box<dyn ChannelHandler>) -> Self {
        Self { target, consumer }
    }

    /// Forwarding target.
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }
}

#[async_trait]
impl ChannelHandler for ForwardedChannel {
    async fn open(&mut self, channel: &ChannelHandle) -> KestrelResult<()> {
        self.consumer.open(channel).await
    }

    async fn process_data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
        self.consumer.process_data(channel, data).await
    }

    async fn process_eof(&mut self, channel: &ChannelHandle) -> KestrelResult<()> {
        self.consumer.process_eof(channel).await
    }

    async fn process_request(
        &mut self,
        _channel: &ChannelHandle,
        _request: &ChannelRequestType,
    ) -> KestrelResult<bool> {
        Ok(false)
    }

    async fn close(&mut self, channel: &ChannelHandle) {
        self.consumer.close(channel).await;
    }
}

/// The closed set of channel kinds.
pub enum ChannelKind {
    /// Interactive shell, exec or subsystem
    Session(SessionChannel),
    /// Port forwarding
    Forwarded(ForwardedChannel),
    /// Application defined channel type
    Custom(Box<dyn ChannelHandler>),
}

impl std::fmt::Debug for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ChannelKind {
    /// Short name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session(_) => "session",
            ChannelKind::Forwarded(_) => "forwarded",
            ChannelKind::Custom(_) => "custom",
        }
    }

    fn handler(&mut self) -> &mut dyn ChannelHandler {
        match self {
            ChannelKind::Session(session) => session,
            ChannelKind::Forwarded(forwarded) => forwarded,
            ChannelKind::Custom(custom) => custom.as_mut(),
        }
    }
}

/// One entry of the channel table.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,
    eof_received: bool,
    local_window: u32,
    limits: ChannelLimits,
    kind: ChannelKind,
    handle: ChannelHandle,
}

impl Channel {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
        limits: ChannelLimits,
        kind: ChannelKind,
        sender: PacketSender,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            state: ChannelState::Opening,
            eof_received: false,
            local_window: limits.initial_window,
            limits,
            kind,
            handle: ChannelHandle::new(
                local_id,
                remote_id,
                remote_window,
                remote_max_packet,
                sender,
            ),
        }
    }

    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Bytes the peer may still send before we adjust the window.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Kind of this channel.
    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Sending handle.
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Accounts for `len` received bytes.
    ///
    /// Returns the WINDOW_ADJUST amount to send when the window fell below
    /// the replenish threshold.
    pub fn consume_window(&mut self, len: u32) -> KestrelResult<Option<u32>> {
        if self.eof_received || self.state != ChannelState::Open {
            return Err(KestrelError::channel(
                self.local_id,
                "Data after EOF or CLOSE",
            ));
        }
        if len > self.limits.max_packet {
            return Err(KestrelError::channel(
                self.local_id,
                format!("{} bytes exceed maximum packet {}", len, self.limits.max_packet),
            ));
        }
        if len > self.local_window {
            return Err(KestrelError::channel(
                self.local_id,
                format!("{} bytes exceed window {}", len, self.local_window),
            ));
        }
        self.local_window -= len;
        if self.local_window < self.limits.replenish_threshold {
            let add = self.limits.initial_window - self.local_window;
            self.local_window = self.limits.initial_window;
            return Ok(Some(add));
        }
        Ok(None)
    }

    pub(crate) async fn open(&mut self) -> KestrelResult<()> {
        self.state = ChannelState::Open;
        let handle = self.handle.clone();
        self.kind.handler().open(&handle).await
    }

    pub(crate) async fn process_data(&mut self, data: &[u8]) -> KestrelResult<()> {
        let handle = self.handle.clone();
        self.kind.handler().process_data(&handle, data).await
    }

    pub(crate) async fn process_extended_data(&mut self, code: u32, data: &[u8]) -> KestrelResult<()> {
        let handle = self.handle.clone();
        self.kind
            .handler()
            .process_extended_data(&handle, code, data)
            .await
    }

    pub(crate) async fn process_eof(&mut self) -> KestrelResult<()> {
        self.eof_received = true;
        let handle = self.handle.clone();
        self.kind.handler().process_eof(&handle).await
    }

    pub(crate) async fn process_request(&mut self, request: &ChannelRequestType) -> KestrelResult<bool> {
        let handle = self.handle.clone();
        self.kind.handler().process_request(&handle, request).await
    }

    pub(crate) async fn close(&mut self) {
        self.state = ChannelState::Closed;
        let handle = self.handle.clone();
        self.kind.handler().close(&handle).await;
    }
}

/// Event delivered by an [`EventForwarder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Open confirmed
    Opened,
    /// Data received on this channel
    Data(Vec<u8>),
    /// Extended data received on this channel
    ExtendedData {
        /// Data type code
        code: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// Channel EOF
    Eof,
    /// Channel request
    Request(ChannelRequestType),
    /// Channel removed
    Closed,
}

/// Handler that turns channel callbacks into messages on an mpsc queue,
/// for applications that consume channels from their own task.
#[derive(Debug)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    accept_requests: bool,
}

impl EventForwarder {
    /// Creates a forwarder and the receiving end of its queue.
    ///
    /// Requests are answered with `accept_requests`.
    pub fn channel(accept_requests: bool) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                accept_requests,
            },
            rx,
        )
    }

    fn forward(&self, channel: &ChannelHandle, event: ChannelEvent) -> KestrelResult<()> {
        self.tx
            .send(event)
            .map_err(|_| KestrelError::channel(channel.local_id(), "Channel consumer dropped"))
    }
}

#[async_trait]
impl ChannelHandler for EventForwarder {
    async fn open(&mut self, channel: &ChannelHandle) -> KestrelResult<()> {
        self.forward(channel, ChannelEvent::Opened)
    }

    async fn process_data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
        self.forward(channel, ChannelEvent::Data(data.to_vec()))
    }

    async fn process_extended_data(
        &mut self,
        channel: &ChannelHandle,
        code: u32,
        data: &[u8],
    ) -> KestrelResult<()> {
        self.forward(
            channel,
            ChannelEvent::ExtendedData {
                code,
                data: data.to_vec(),
            },
        )
    }

    async fn process_eof(&mut self, channel: &ChannelHandle) -> KestrelResult<()> {
        self.forward(channel, ChannelEvent::Eof)
    }

    async fn process_request(
        &mut self,
        channel: &ChannelHandle,
        request: &ChannelRequestType,
    ) -> KestrelResult<bool> {
        self.forward(channel, ChannelEvent::Request(request.clone()))?;
        Ok(self.accept_requests)
    }

    async fn close(&mut self, _channel: &ChannelHandle) {
        let _ = self.tx.send(ChannelEvent::Closed);
    }
}
