//! SSH Connection Manager.
//!
//! [`ConnectionService`] runs the `ssh-connection` service for one
//! authenticated session: it owns the channel table, answers global
//! requests and routes channel messages to the right [`Channel`].
//!
//! Channel numbers are allocated locally and never reused while the
//! channel is in the table. Errors that concern a single channel close
//! that channel and surface as [`KestrelError::Channel`], which the
//! session loop logs without tearing the connection down.

use super::channel::{
    Channel, ChannelKind, ChannelLimits, ChannelState, ForwardedChannel, SessionChannel,
};
use super::config::SshServerConfig;
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelSuccess, ChannelType, ChannelWindowAdjust, GlobalRequest, RequestFailure,
    RequestSuccess,
};
use super::logging;
use super::message::MessageType;
use super::server::SessionHandler;
use super::transport::PacketSender;
use super::wire::SshReader;
use kestrel_platform::{KestrelError, KestrelResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Global request answered by the service itself.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// The `ssh-connection` service of one session.
pub struct ConnectionService {
    user: String,
    sender: PacketSender,
    handler: Arc<dyn SessionHandler>,
    channels: HashMap<u32, Channel>,
    next_id: u32,
    limits: ChannelLimits,
    max_channels: usize,
    max_field_length: usize,
}

impl ConnectionService {
    /// Creates the service for `user`.
    pub fn new(
        config: &SshServerConfig,
        user: impl Into<String>,
        sender: PacketSender,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            user: user.into(),
            sender,
            handler,
            channels: HashMap::new(),
            next_id: 0,
            limits: ChannelLimits {
                initial_window: config.initial_window_size,
                max_packet: config.max_channel_packet,
                replenish_threshold: config.window_replenish_threshold,
            },
            max_channels: config.max_channels,
            max_field_length: config.max_field_length,
        }
    }

    /// Authenticated user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Channels currently in the table.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Looks up a channel by local number.
    pub fn channel(&self, local_id: u32) -> Option<&Channel> {
        self.channels.get(&local_id)
    }

    /// Handles one message of the connection range.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Channel`] for a message about an unknown channel or
    ///   a flow control violation; the session continues
    /// - [`KestrelError::Protocol`] for malformed messages
    /// - transport errors from sending replies
    pub async fn handle(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let msg_type = payload
            .first()
            .and_then(|id| MessageType::from_u8(*id))
            .ok_or_else(|| KestrelError::Protocol("Empty or unknown connection message".into()))?;

        match msg_type {
            MessageType::GlobalRequest => self.on_global_request(payload).await,
            MessageType::RequestSuccess | MessageType::RequestFailure => {
                debug!(peer = self.sender.peer(), "Ignoring unsolicited global reply");
                Ok(())
            }
            MessageType::ChannelOpen => self.on_open(payload).await,
            MessageType::ChannelWindowAdjust => self.on_window_adjust(payload).await,
            MessageType::ChannelData => self.on_data(payload).await,
            MessageType::ChannelExtendedData => self.on_extended_data(payload).await,
            MessageType::ChannelEof => self.on_eof(payload).await,
            MessageType::ChannelClose => self.on_close(payload).await,
            MessageType::ChannelRequest => self.on_request(payload).await,
            MessageType::ChannelSuccess | MessageType::ChannelFailure => Ok(()),
            MessageType::ChannelOpenConfirmation | MessageType::ChannelOpenFailure => {
                let mut reader = SshReader::new(&payload[1..]);
                let recipient = reader.read_u32()?;
                Err(KestrelError::channel(recipient, "No channel open is pending"))
            }
            other => Err(KestrelError::Protocol(format!(
                "Unexpected {} in connection service",
                other
            ))),
        }
    }

    /// Drops every channel. Writers blocked on a window are woken.
    pub async fn shutdown(&mut self) {
        for (local_id, mut channel) in self.channels.drain() {
            let _ = channel.handle().close().await;
            channel.close().await;
            logging::log_channel_closed(local_id);
        }
    }

    async fn on_global_request(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        let accepted = if request.name == KEEPALIVE_REQUEST {
            true
        } else {
            self.handler
                .global_request(&self.user, &request.name, &request.data)
                .await
        };
        debug!(
            peer = self.sender.peer(),
            request = %request.name,
            want_reply = request.want_reply,
            accepted = accepted,
            "Global request"
        );
        if request.want_reply {
            if accepted {
                self.sender.send(&RequestSuccess::default().to_bytes()).await?;
            } else {
                self.sender.send(&RequestFailure.to_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn on_open(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let open = ChannelOpen::parse(&mut SshReader::with_limit(payload, self.max_field_length))?;
        let remote_id = open.sender_channel();
        let type_name = open.channel_type().name().to_string();

        if self.channels.len() >= self.max_channels {
            return self
                .reject_open(remote_id, &type_name, ChannelOpenFailureReason::ResourceShortage)
                .await;
        }

        let kind = match open.channel_type() {
            ChannelType::Session => self
                .handler
                .session(&self.user)
                .await
                .map(|consumer| ChannelKind::Session(SessionChannel::new(consumer))),
            ChannelType::DirectTcpip(target) => self
                .handler
                .direct_tcpip(&self.user, target)
                .await
                .map(|consumer| ChannelKind::Forwarded(ForwardedChannel::new(target.clone(), consumer))),
            ChannelType::Other { name, data } => {
                match self.handler.custom(&self.user, name, data).await {
                    Some(handler) => Some(ChannelKind::Custom(handler)),
                    None => {
                        return self
                            .reject_open(
                                remote_id,
                                &type_name,
                                ChannelOpenFailureReason::UnknownChannelType,
                            )
                            .await
                    }
                }
            }
        };
        let kind = match kind {
            Some(kind) => kind,
            None => {
                return self
                    .reject_open(
                        remote_id,
                        &type_name,
                        ChannelOpenFailureReason::AdministrativelyProhibited,
                    )
                    .await
            }
        };

        let local_id = self.allocate_id();
        let mut channel = Channel::new(
            local_id,
            remote_id,
            open.initial_window_size(),
            open.maximum_packet_size(),
            self.limits,
            kind,
            self.sender.clone(),
        );
        let confirmation = ChannelOpenConfirmation::new(
            remote_id,
            local_id,
            self.limits.initial_window,
            self.limits.max_packet,
        );
        self.sender.send(&confirmation.to_bytes()).await?;
        logging::log_channel_open(local_id, remote_id, &type_name, self.limits.initial_window);

        let opened = channel.open().await;
        self.channels.insert(local_id, channel);
        if let Err(e) = opened {
            self.close_after_error(local_id, e).await?;
        }
        Ok(())
    }

    async fn reject_open(
        &self,
        remote_id: u32,
        type_name: &str,
        reason: ChannelOpenFailureReason,
    ) -> KestrelResult<()> {
        logging::log_channel_rejected(type_name, reason.as_str());
        self.sender
            .send(&ChannelOpenFailure::new(remote_id, reason).to_bytes())
            .await
    }

    async fn on_window_adjust(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let adjust = ChannelWindowAdjust::from_bytes(payload)?;
        let local_id = adjust.recipient_channel();
        let channel = lookup(&mut self.channels, local_id)?;
        if let Err(e) = channel.handle().adjust_window(adjust.bytes_to_add()).await {
            return self.fail_channel(local_id, e).await;
        }
        Ok(())
    }

    async fn on_data(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let mut reader = SshReader::with_limit(payload, self.max_field_length);
        let msg = ChannelData::parse(&mut reader)?;
        self.deliver(msg.recipient_channel(), None, msg.data()).await
    }

    async fn on_extended_data(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let mut reader = SshReader::with_limit(payload, self.max_field_length);
        let msg = ChannelExtendedData::parse(&mut reader)?;
        self.deliver(msg.recipient_channel(), Some(msg.data_type_code()), msg.data())
            .await
    }

    async fn deliver(&mut self, local_id: u32, code: Option<u32>, data: &[u8]) -> KestrelResult<()> {
        let channel = lookup(&mut self.channels, local_id)?;
        if channel.handle().is_closed().await {
            return Ok(());
        }
        let adjust = match channel.consume_window(data.len() as u32) {
            Ok(adjust) => adjust,
            Err(e) => return self.fail_channel(local_id, e).await,
        };
        let remote_id = channel.remote_id();
        let result = match code {
            None => channel.process_data(data).await,
            Some(code) => channel.process_extended_data(code, data).await,
        };
        if let Some(bytes) = adjust {
            self.sender
                .send(&ChannelWindowAdjust::new(remote_id, bytes).to_bytes())
                .await?;
        }
        if let Err(e) = result {
            self.close_after_error(local_id, e).await?;
        }
        Ok(())
    }

    async fn on_eof(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let msg = ChannelEof::from_bytes(payload)?;
        let local_id = msg.recipient_channel();
        let channel = lookup(&mut self.channels, local_id)?;
        if let Err(e) = channel.process_eof().await {
            self.close_after_error(local_id, e).await?;
        }
        Ok(())
    }

    async fn on_close(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let msg = ChannelClose::from_bytes(payload)?;
        let local_id = msg.recipient_channel();
        let mut channel = self
            .channels
            .remove(&local_id)
            .ok_or_else(|| KestrelError::channel(local_id, "Unknown channel"))?;
        channel.set_state(ChannelState::Closing);
        channel.handle().close().await?;
        channel.close().await;
        logging::log_channel_closed(local_id);
        Ok(())
    }

    async fn on_request(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let mut reader = SshReader::with_limit(payload, self.max_field_length);
        let request = ChannelRequest::parse(&mut reader)?;
        let local_id = request.recipient_channel();
        let channel = lookup(&mut self.channels, local_id)?;
        let remote_id = channel.remote_id();

        let accepted = match channel.process_request(request.request_type()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                if request.want_reply() {
                    self.sender.send(&ChannelFailure::new(remote_id).to_bytes()).await?;
                }
                return self.close_after_error(local_id, e).await;
            }
        };
        logging::log_channel_request(
            local_id,
            request.request_type().name(),
            request.want_reply(),
            accepted,
        );
        if request.want_reply() {
            if accepted {
                self.sender.send(&ChannelSuccess::new(remote_id).to_bytes()).await?;
            } else {
                self.sender.send(&ChannelFailure::new(remote_id).to_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Closes the channel after a handler error; the session carries on.
    async fn close_after_error(&mut self, local_id: u32, error: KestrelError) -> KestrelResult<()> {
        warn!(
            peer = self.sender.peer(),
            channel = local_id,
            error = %error,
            "Channel handler failed, closing channel"
        );
        self.close_channel(local_id).await
    }

    /// Closes the channel and reports the violation to the caller.
    async fn fail_channel(&mut self, local_id: u32, error: KestrelError) -> KestrelResult<()> {
        self.close_channel(local_id).await?;
        Err(error)
    }

    async fn close_channel(&mut self, local_id: u32) -> KestrelResult<()> {
        if let Some(channel) = self.channels.get_mut(&local_id) {
            channel.set_state(ChannelState::Closing);
            channel.handle().close().await?;
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u32 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

fn lookup(channels: &mut HashMap<u32, Channel>, local_id: u32) -> KestrelResult<&mut Channel> {
    channels
        .get_mut(&local_id)
        .ok_or_else(|| KestrelError::channel(local_id, "Unknown channel"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::channel::{ChannelHandle, ChannelHandler, EventForwarder, SessionConsumer};
    use crate::ssh::connection::{ChannelRequestType, ForwardTarget, PtyRequest};
    use crate::ssh::packet::PacketReader;
    use async_trait::async_trait;
    use bytes::{BufMut, BytesMut};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{duplex, DuplexStream};

    struct Echo;

    #[async_trait]
    impl SessionConsumer for Echo {
        async fn shell(&mut self, _channel: &ChannelHandle, _pty: Option<&PtyRequest>) -> bool {
            true
        }

        async fn exec(&mut self, channel: &ChannelHandle, command: &str) -> bool {
            let channel = channel.clone();
            let output = command.as_bytes().to_vec();
            tokio::spawn(async move {
                channel.send_data(&output).await?;
                channel.send_exit_status(0).await?;
                channel.send_eof().await?;
                channel.close().await.map(|_| ())
            });
            true
        }

        async fn data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
            if data == b"fail" {
                return Err(KestrelError::channel(channel.local_id(), "consumer failed"));
            }
            channel.try_send_data(data).await
        }
    }

    struct TestHandler {
        custom: StdMutex<Option<EventForwarder>>,
    }

    #[async_trait]
    impl SessionHandler for TestHandler {
        async fn session(&self, _user: &str) -> Option<Box<dyn SessionConsumer>> {
            Some(Box::new(Echo))
        }

        async fn custom(
            &self,
            _user: &str,
            channel_type: &str,
            _data: &[u8],
        ) -> Option<Box<dyn ChannelHandler>> {
            if channel_type != "kestrel-test@example.com" {
                return None;
            }
            let forwarder = self.custom.lock().unwrap().take()?;
            Some(Box::new(forwarder))
        }
    }

    fn service(config: SshServerConfig) -> (ConnectionService, PacketReader<DuplexStream>) {
        let (ours, theirs) = duplex(1 << 20);
        let sender = PacketSender::new(Box::new(ours), 35000, "test");
        let handler = Arc::new(TestHandler {
            custom: StdMutex::new(None),
        });
        (
            ConnectionService::new(&config, "alice", sender, handler),
            PacketReader::new(theirs, 35000),
        )
    }

    async fn open_session(
        service: &mut ConnectionService,
        reader: &mut PacketReader<DuplexStream>,
        remote_id: u32,
        window: u32,
    ) -> u32 {
        let open = ChannelOpen::new(ChannelType::Session, remote_id, window, 32768);
        service.handle(&open.to_bytes()).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        let confirmation = ChannelOpenConfirmation::from_bytes(&reply.payload).unwrap();
        assert_eq!(confirmation.recipient_channel(), remote_id);
        confirmation.sender_channel()
    }

    #[tokio::test]
    async fn test_exec_round_trip() {
        let (mut service, mut reader) = service(SshServerConfig::default());
        let local = open_session(&mut service, &mut reader, 7, 1 << 20).await;
        assert_eq!(service.channel(local).unwrap().state(), ChannelState::Open);

        let exec = ChannelRequest::new(
            local,
            ChannelRequestType::Exec {
                command: "hello".into(),
            },
            true,
        );
        service.handle(&exec.to_bytes()).await.unwrap();

        let mut seen = Vec::new();
        loop {
            let packet = reader.read_packet().await.unwrap();
            let id = packet.payload[0];
            if id == MessageType::ChannelData as u8 {
                let data = ChannelData::from_bytes(&packet.payload).unwrap();
                assert_eq!(data.data(), b"hello");
            }
            if id == MessageType::ChannelRequest as u8 {
                let request = ChannelRequest::from_bytes(&packet.payload).unwrap();
                assert_eq!(
                    request.request_type(),
                    &ChannelRequestType::ExitStatus { exit_status: 0 }
                );
            }
            seen.push(id);
            if id == MessageType::ChannelClose as u8 {
                break;
            }
        }
        assert!(seen.contains(&(MessageType::ChannelSuccess as u8)));
        assert!(seen.contains(&(MessageType::ChannelData as u8)));
        assert!(seen.contains(&(MessageType::ChannelEof as u8)));

        service
            .handle(&ChannelClose::new(local).to_bytes())
            .await
            .unwrap();
        assert_eq!(service.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_non_terminal() {
        let (mut service, _reader) = service(SshServerConfig::default());
        let err = service
            .handle(&ChannelData::new(42, b"x".to_vec()).to_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Channel { channel: 42, .. }));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_data_beyond_window_closes_channel() {
        let config = SshServerConfig::builder()
            .with_channel_window(64, 64)
            .with_max_packet_size(35000)
            .build()
            .unwrap();
        let (mut service, mut reader) = service(config);
        let local = open_session(&mut service, &mut reader, 1, 1 << 20).await;

        let err = service
            .handle(&ChannelData::new(local, vec![0u8; 65]).to_bytes())
            .await
            .unwrap_err();
        assert!(!err.is_terminal());
        let close = reader.read_packet().await.unwrap();
        assert_eq!(close.payload, ChannelClose::new(1).to_bytes());
    }

    #[tokio::test]
    async fn test_window_replenished() {
        let config = SshServerConfig::builder()
            .with_channel_window(100, 64)
            .build()
            .unwrap();
        let (mut service, mut reader) = service(config);
        let local = open_session(&mut service, &mut reader, 1, 1 << 20).await;

        service
            .handle(&ChannelData::new(local, vec![1u8; 40]).to_bytes())
            .await
            .unwrap();
        let echo = reader.read_packet().await.unwrap();
        assert_eq!(echo.payload[0], MessageType::ChannelData as u8);
        assert_eq!(service.channel(local).unwrap().local_window(), 60);

        service
            .handle(&ChannelData::new(local, vec![1u8; 20]).to_bytes())
            .await
            .unwrap();
        let _echo = reader.read_packet().await.unwrap();
        let adjust = reader.read_packet().await.unwrap();
        let adjust = ChannelWindowAdjust::from_bytes(&adjust.payload).unwrap();
        assert_eq!(adjust.bytes_to_add(), 60);
        assert_eq!(service.channel(local).unwrap().local_window(), 100);
    }

    #[tokio::test]
    async fn test_handler_error_closes_only_that_channel() {
        let (mut service, mut reader) = service(SshServerConfig::default());
        let first = open_session(&mut service, &mut reader, 10, 1 << 20).await;
        let second = open_session(&mut service, &mut reader, 11, 1 << 20).await;
        assert_ne!(first, second);

        service
            .handle(&ChannelData::new(first, b"fail".to_vec()).to_bytes())
            .await
            .unwrap();
        let close = reader.read_packet().await.unwrap();
        assert_eq!(close.payload, ChannelClose::new(10).to_bytes());
        assert_eq!(service.channel_count(), 2);

        service
            .handle(&ChannelData::new(second, b"ok".to_vec()).to_bytes())
            .await
            .unwrap();
        let echo = reader.read_packet().await.unwrap();
        assert_eq!(ChannelData::from_bytes(&echo.payload).unwrap().recipient_channel(), 11);
    }

    #[tokio::test]
    async fn test_open_rejections() {
        let config = SshServerConfig::builder().with_max_channels(1).build().unwrap();
        let (mut service, mut reader) = service(config);

        let forward = ChannelOpen::new(
            ChannelType::DirectTcpip(ForwardTarget {
                host: "localhost".into(),
                port: 80,
                originator_address: "127.0.0.1".into(),
                originator_port: 5000,
            }),
            3,
            1024,
            1024,
        );
        service.handle(&forward.to_bytes()).await.unwrap();
        let failure = ChannelOpenFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        assert_eq!(
            failure.reason_code(),
            ChannelOpenFailureReason::AdministrativelyProhibited
        );

        let unknown = ChannelOpen::new(
            ChannelType::Other {
                name: "x11".into(),
                data: Vec::new(),
            },
            4,
            1024,
            1024,
        );
        service.handle(&unknown.to_bytes()).await.unwrap();
        let failure = ChannelOpenFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        assert_eq!(failure.reason_code(), ChannelOpenFailureReason::UnknownChannelType);
        assert_eq!(service.channel_count(), 0);

        open_session(&mut service, &mut reader, 5, 1024).await;
        let extra = ChannelOpen::new(ChannelType::Session, 6, 1024, 1024);
        service.handle(&extra.to_bytes()).await.unwrap();
        let failure = ChannelOpenFailure::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        assert_eq!(failure.reason_code(), ChannelOpenFailureReason::ResourceShortage);
    }

    #[tokio::test]
    async fn test_custom_channel_kind() {
        let (mut service, mut reader) = service(SshServerConfig::default());
        let (forwarder, mut events) = EventForwarder::channel(true);
        let handler = Arc::new(TestHandler {
            custom: StdMutex::new(Some(forwarder)),
        });
        service.handler = handler;

        let open = ChannelOpen::new(
            ChannelType::Other {
                name: "kestrel-test@example.com".into(),
                data: vec![0, 0, 0, 1],
            },
            9,
            4096,
            1024,
        );
        service.handle(&open.to_bytes()).await.unwrap();
        let confirmation =
            ChannelOpenConfirmation::from_bytes(&reader.read_packet().await.unwrap().payload).unwrap();
        let local = confirmation.sender_channel();

        service
            .handle(&ChannelExtendedData::new(local, 1, b"err".to_vec()).to_bytes())
            .await
            .unwrap();
        use crate::ssh::channel::ChannelEvent;
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::ExtendedData {
                code: 1,
                data: b"err".to_vec()
            })
        );
        assert_eq!(service.channel(local).unwrap().kind().name(), "custom");
    }

    #[tokio::test]
    async fn test_global_requests() {
        let (mut service, mut reader) = service(SshServerConfig::default());

        let keepalive = GlobalRequest {
            name: KEEPALIVE_REQUEST.into(),
            want_reply: true,
            data: Vec::new(),
        };
        service.handle(&keepalive.to_bytes()).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(reply.payload, vec![MessageType::RequestSuccess as u8]);

        let mut data = BytesMut::new();
        data.put_u32(0);
        let forward = GlobalRequest {
            name: "tcpip-forward".into(),
            want_reply: true,
            data: data.to_vec(),
        };
        service.handle(&forward.to_bytes()).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(reply.payload, vec![MessageType::RequestFailure as u8]);

        let silent = GlobalRequest {
            name: "no-reply".into(),
            want_reply: false,
            data: Vec::new(),
        };
        service.handle(&silent.to_bytes()).await.unwrap();
        service.shutdown().await;
        drop(service);
        assert!(reader.read_packet().await.is_err());
    }
}
