//! SSH Server implementation.
//!
//! [`SshServer`] accepts TCP connections and runs each one as an
//! [`SshSession`] on its own tokio task. A session drives the transport
//! handshake, then routes packets through the [`Dispatcher`] to the
//! authentication and connection services until either side disconnects.
//!
//! The server keeps the set of active sessions so [`ServerHandle::shutdown`]
//! can disconnect all of them. Configuration, host keys and the algorithm
//! registry are immutable and shared by `Arc` between sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::auth::{AuthDecision, Authenticator, Credentials};
//! use kestrel_proto::ssh::channel::{ChannelHandle, SessionConsumer};
//! use kestrel_proto::ssh::config::SshServerConfig;
//! use kestrel_proto::ssh::hostkey::{Ed25519HostKey, HostKeySet};
//! use kestrel_proto::ssh::server::{SessionHandler, SshServer};
//! use kestrel_platform::KestrelResult;
//! use std::sync::Arc;
//!
//! struct Users;
//!
//! #[async_trait::async_trait]
//! impl Authenticator for Users {
//!     async fn authenticate(&self, user: &str, credentials: Credentials<'_>) -> AuthDecision {
//!         match credentials {
//!             Credentials::Password { password, .. } if user == "admin" && password == "secret" => {
//!                 AuthDecision::success()
//!             }
//!             _ => AuthDecision::failure(),
//!         }
//!     }
//! }
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SessionConsumer for Echo {
//!     async fn shell(&mut self, _channel: &ChannelHandle, _pty: Option<&kestrel_proto::ssh::connection::PtyRequest>) -> bool {
//!         true
//!     }
//!     async fn exec(&mut self, _channel: &ChannelHandle, _command: &str) -> bool {
//!         false
//!     }
//!     async fn data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
//!         channel.try_send_data(data).await
//!     }
//! }
//!
//! struct Handler;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Handler {
//!     async fn session(&self, _user: &str) -> Option<Box<dyn SessionConsumer>> {
//!         Some(Box::new(Echo))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host_keys = HostKeySet::new().with_key(Ed25519HostKey::generate()?);
//! let server = SshServer::bind(
//!     "127.0.0.1:2222",
//!     SshServerConfig::default(),
//!     host_keys,
//!     Arc::new(Users),
//!     Arc::new(Handler),
//! )
//! .await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use super::auth::{AuthService, AuthStatus, AuthTimer, Authenticator};
use super::channel::{ChannelHandler, SessionConsumer};
use super::config::SshServerConfig;
use super::connection::ForwardTarget;
use super::connection_mgr::ConnectionService;
use super::dispatcher::{Dispatcher, Route, ServiceKind};
use super::hostkey::HostKeySet;
use super::logging;
use super::message::{ServiceAccept, ServiceRequest};
use super::packet::InboundPacket;
use super::transport::{PacketSender, Transport, TransportConfig};
use async_trait::async_trait;
use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Application hooks for the connection service.
///
/// One handler serves every session of a server; per-channel state lives in
/// the consumers it returns.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Consumer for a new `session` channel, or `None` to refuse it.
    async fn session(&self, user: &str) -> Option<Box<dyn SessionConsumer>>;

    /// Consumer for a `direct-tcpip` channel. Refused by default.
    async fn direct_tcpip(
        &self,
        _user: &str,
        _target: &ForwardTarget,
    ) -> Option<Box<dyn ChannelHandler>> {
        None
    }

    /// Handler for any other channel type. Unknown types are refused with
    /// `SSH_OPEN_UNKNOWN_CHANNEL_TYPE` by default.
    async fn custom(
        &self,
        _user: &str,
        _channel_type: &str,
        _data: &[u8],
    ) -> Option<Box<dyn ChannelHandler>> {
        None
    }

    /// Global request other than `keepalive@openssh.com`.
    async fn global_request(&self, _user: &str, _name: &str, _data: &[u8]) -> bool {
        false
    }
}

struct ServerShared {
    config: Arc<SshServerConfig>,
    transport: Arc<TransportConfig>,
    authenticator: Arc<dyn Authenticator>,
    handler: Arc<dyn SessionHandler>,
    sessions: Mutex<HashMap<u64, PacketSender>>,
    next_session: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// SSH Server.
pub struct SshServer {
    listener: TcpListener,
    shared: Arc<ServerShared>,
}

impl SshServer {
    /// Validates the configuration and binds to `addr`.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Config`] for an invalid configuration or an empty
    ///   host key set
    /// - [`KestrelError::Io`] if the address cannot be bound
    pub async fn bind(
        addr: &str,
        config: SshServerConfig,
        host_keys: HostKeySet,
        authenticator: Arc<dyn Authenticator>,
        handler: Arc<dyn SessionHandler>,
    ) -> KestrelResult<Self> {
        config.validate()?;
        if host_keys.is_empty() {
            return Err(KestrelError::Config("At least one host key is required".to_string()));
        }
        let listener = TcpListener::bind(addr).await?;
        let transport = Arc::new(TransportConfig::from_server_config(&config, host_keys));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            shared: Arc::new(ServerShared {
                config: Arc::new(config),
                transport,
                authenticator,
                handler,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                shutdown,
            }),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> KestrelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for shutting down and inspecting the server from other tasks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts one TCP connection. The returned session has not started
    /// the handshake yet; call [`SshSession::run`].
    pub async fn accept(&self) -> KestrelResult<SshSession> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(SshSession::new(
            stream,
            peer_addr.to_string(),
            Arc::clone(&self.shared),
        ))
    }

    /// Accepts connections until [`ServerHandle::shutdown`] is called,
    /// running each session on its own task.
    pub async fn run(&self) -> KestrelResult<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        info!(addr = ?self.listener.local_addr().ok(), "SSH server listening");

        loop {
            let session = tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };
            tokio::spawn(async move {
                let peer = session.peer().to_string();
                if let Err(e) = session.run().await {
                    debug!(peer = %peer, error = %e, "Session ended with error");
                }
            });
        }
        info!("SSH server stopped accepting connections");
        Ok(())
    }
}

/// Cloneable control handle of a running [`SshServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Number of sessions currently running.
    pub async fn active_sessions(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Stops the accept loop and disconnects every active session with
    /// `BY_APPLICATION`. Returns how many sessions were disconnected.
    pub async fn shutdown(&self) -> usize {
        self.shared.shutdown.send_replace(true);
        let senders: Vec<PacketSender> = self
            .shared
            .sessions
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        let mut disconnected = 0;
        for sender in senders {
            if sender
                .disconnect(DisconnectReason::ByApplication, "Server shutting down")
                .await
            {
                disconnected += 1;
            }
        }
        info!(sessions = disconnected, "SSH server shut down");
        disconnected
    }
}

/// One client connection.
pub struct SshSession {
    id: u64,
    transport: Transport,
    shared: Arc<ServerShared>,
    dispatcher: Dispatcher,
    auth: Option<AuthService>,
    auth_timer: Option<AuthTimer>,
    connection: Option<ConnectionService>,
    user: Option<String>,
}

impl SshSession {
    fn new<S>(stream: S, peer: String, shared: Arc<ServerShared>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = Transport::from_stream(stream, Arc::clone(&shared.transport), peer);
        Self {
            id: shared.next_session.fetch_add(1, Ordering::Relaxed),
            transport,
            shared,
            dispatcher: Dispatcher::new(),
            auth: None,
            auth_timer: None,
            connection: None,
            user: None,
        }
    }

    /// Peer address.
    pub fn peer(&self) -> &str {
        self.transport.peer()
    }

    /// Authenticated user, once authentication has succeeded.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Runs the session to completion.
    ///
    /// Terminal errors disconnect with the matching reason code before they
    /// are returned. A peer DISCONNECT ends the session with `Ok`.
    pub async fn run(mut self) -> KestrelResult<()> {
        let started = Instant::now();
        let sender = self.transport.sender();
        self.shared
            .sessions
            .lock()
            .await
            .insert(self.id, sender.clone());
        logging::log_session_start(sender.peer());

        let result = self.serve(&sender).await;
        let result = match result {
            Ok(()) => {
                self.transport.close().await;
                Ok(())
            }
            Err(KestrelError::Disconnected { .. }) => {
                self.transport.close().await;
                Ok(())
            }
            Err(KestrelError::Io(e)) => {
                self.transport.close().await;
                Err(KestrelError::Io(e))
            }
            Err(e) => {
                self.transport
                    .disconnect(e.disconnect_reason(), &e.to_string())
                    .await;
                Err(e)
            }
        };

        self.teardown().await;
        logging::log_session_end(sender.peer(), started.elapsed().as_millis() as u64);
        result
    }

    async fn serve(&mut self, sender: &PacketSender) -> KestrelResult<()> {
        let grace = self.shared.config.auth_timeout;
        tokio::select! {
            handshake = tokio::time::timeout(grace, self.transport.handshake()) => {
                handshake.map_err(|_| KestrelError::Timeout("Handshake timeout".to_string()))??;
            }
            _ = sender.closed() => return Ok(()),
        }

        loop {
            let packet = tokio::select! {
                packet = self.transport.next_packet() => packet?,
                _ = sender.closed() => return Ok(()),
            };
            match self.dispatch(packet).await {
                Ok(()) => {}
                Err(e) if !e.is_terminal() => {
                    warn!(peer = sender.peer(), error = %e, "Channel error");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&mut self, packet: InboundPacket) -> KestrelResult<()> {
        match self.dispatcher.route(&packet.payload) {
            Route::ServiceRequest => {
                let request = ServiceRequest::from_bytes(&packet.payload)?;
                let kind = self.dispatcher.request_service(&request.service_name)?;
                self.transport
                    .sender()
                    .send(
                        &ServiceAccept {
                            service_name: request.service_name,
                        }
                        .to_bytes(),
                    )
                    .await?;
                if kind == ServiceKind::UserAuth {
                    self.start_auth()?;
                }
                Ok(())
            }
            Route::Service(ServiceKind::UserAuth) => {
                let auth = self
                    .auth
                    .as_mut()
                    .ok_or_else(|| KestrelError::Protocol("Authentication not started".to_string()))?;
                if let AuthStatus::Authenticated { user, .. } = auth.handle(&packet.payload).await? {
                    self.on_authenticated(user).await;
                }
                Ok(())
            }
            Route::Service(ServiceKind::Connection) => {
                let connection = self
                    .connection
                    .as_mut()
                    .ok_or_else(|| KestrelError::Protocol("Connection service not started".to_string()))?;
                connection.handle(&packet.payload).await
            }
            Route::Ignore => Ok(()),
            Route::Unimplemented => {
                debug!(
                    peer = self.transport.peer(),
                    msg_type = packet.payload.first().copied().unwrap_or(0),
                    "Unimplemented message"
                );
                self.transport.send_unimplemented(packet.sequence).await
            }
        }
    }

    fn start_auth(&mut self) -> KestrelResult<()> {
        let session_id = self
            .transport
            .session_id()
            .ok_or_else(|| KestrelError::Protocol("No session identifier".to_string()))?;
        let sender = self.transport.sender();
        self.auth = Some(AuthService::new(
            &self.shared.config,
            session_id,
            sender.clone(),
            Arc::clone(&self.shared.authenticator),
        ));
        self.auth_timer = Some(AuthTimer::start(self.shared.config.auth_timeout, sender));
        Ok(())
    }

    async fn on_authenticated(&mut self, user: String) {
        if let Some(timer) = self.auth_timer.as_mut() {
            timer.cancel();
        }
        self.auth = None;
        self.dispatcher.set_authenticated();
        self.transport.set_authenticated().await;
        self.connection = Some(ConnectionService::new(
            &self.shared.config,
            user.clone(),
            self.transport.sender(),
            Arc::clone(&self.shared.handler),
        ));
        self.user = Some(user);
    }

    async fn teardown(&mut self) {
        if let Some(mut timer) = self.auth_timer.take() {
            timer.cancel();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
        self.shared.sessions.lock().await.remove(&self.id);
    }
}
