//! Integration tests for SSH client-server communication.
//!
//! These tests run a real [`SshServer`] on a loopback socket and drive it
//! with [`SshClient`]:
//! - Key exchange and rekeying
//! - Authentication methods, attempt limits and the timeout
//! - Channels, flow control and global requests
//! - Shutdown of active sessions

use kestrel_platform::{DisconnectReason, KestrelError, KestrelResult};
use kestrel_proto::ssh::algorithm::AlgorithmRegistry;
use kestrel_proto::ssh::auth::{AuthDecision, AuthMethod, Authenticator, Credentials};
use kestrel_proto::ssh::channel::{ChannelHandle, SessionConsumer};
use kestrel_proto::ssh::client::{AuthReply, SshClient};
use kestrel_proto::ssh::config::SshServerConfig;
use kestrel_proto::ssh::connection::{
    ChannelClose, ChannelData, ChannelOpenFailureReason, ChannelRequestType, ChannelType,
    PtyRequest, EXTENDED_DATA_STDERR,
};
use kestrel_proto::ssh::hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeySet, PublicKey};
use kestrel_proto::ssh::message::MessageType;
use kestrel_proto::ssh::server::{ServerHandle, SessionHandler, SshServer};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Accepts `admin`/`secret`, `expired`/`old` (change required) and the
/// one registered user key.
struct TestAuthenticator {
    user_key: PublicKey,
}

#[async_trait::async_trait]
impl Authenticator for TestAuthenticator {
    async fn authenticate(&self, user: &str, credentials: Credentials<'_>) -> AuthDecision {
        match credentials {
            Credentials::Password {
                password,
                new_password: None,
            } => match (user, password) {
                ("admin", "secret") => AuthDecision::success(),
                ("expired", "old") => AuthDecision::password_expired("Password expired"),
                _ => AuthDecision::failure(),
            },
            Credentials::Password {
                password: "old",
                new_password: Some(_),
            } if user == "expired" => AuthDecision::success(),
            Credentials::PublicKey { public_key, .. } if *public_key == self.user_key => {
                AuthDecision::success()
            }
            _ => AuthDecision::failure(),
        }
    }
}

/// Echoes shell input; `exec` prints the command, a line on stderr and
/// exits with status 3. `repeat N` prints N bytes.
struct Echo;

#[async_trait::async_trait]
impl SessionConsumer for Echo {
    async fn shell(&mut self, _channel: &ChannelHandle, _pty: Option<&PtyRequest>) -> bool {
        true
    }

    async fn exec(&mut self, channel: &ChannelHandle, command: &str) -> bool {
        let output = match command.strip_prefix("repeat ") {
            Some(count) => match count.parse::<usize>() {
                Ok(count) => vec![b'x'; count],
                Err(_) => return false,
            },
            None => format!("Executed: {}", command).into_bytes(),
        };
        let channel = channel.clone();
        tokio::spawn(async move {
            channel.send_data(&output).await?;
            channel
                .send_extended_data(EXTENDED_DATA_STDERR, b"done\n")
                .await?;
            channel.send_exit_status(3).await?;
            channel.send_eof().await?;
            channel.close().await.map(|_| ())
        });
        true
    }

    async fn data(&mut self, channel: &ChannelHandle, data: &[u8]) -> KestrelResult<()> {
        channel.try_send_data(data).await
    }
}

struct TestHandler;

#[async_trait::async_trait]
impl SessionHandler for TestHandler {
    async fn session(&self, _user: &str) -> Option<Box<dyn SessionConsumer>> {
        Some(Box::new(Echo))
    }
}

struct TestServer {
    addr: String,
    handle: ServerHandle,
    user_key: Ed25519HostKey,
}

/// Installs a subscriber once; `RUST_LOG=kestrel_proto=debug` shows session events.
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server(config: SshServerConfig) -> TestServer {
    init_test_logging();
    let user_key = Ed25519HostKey::generate().unwrap();
    let server = SshServer::bind(
        "127.0.0.1:0",
        config,
        HostKeySet::new().with_key(Ed25519HostKey::generate().unwrap()),
        Arc::new(TestAuthenticator {
            user_key: PublicKey::from_blob(&user_key.public_key_blob()).unwrap(),
        }),
        Arc::new(TestHandler),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let handle = server.handle();
    tokio::spawn(async move { server.run().await });
    TestServer {
        addr,
        handle,
        user_key,
    }
}

async fn connect(server: &TestServer) -> SshClient {
    timeout(
        Duration::from_secs(5),
        SshClient::connect_tcp(&server.addr, &AlgorithmRegistry::default()),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed")
}

async fn login(server: &TestServer) -> SshClient {
    let mut client = connect(server).await;
    client.request_service("ssh-userauth").await.unwrap();
    assert_eq!(
        client.authenticate_password("admin", "secret").await.unwrap(),
        AuthReply::Success
    );
    client
}

fn assert_disconnected(result: KestrelResult<Vec<u8>>, expected: DisconnectReason) {
    match result {
        Err(KestrelError::Disconnected { reason, .. }) => assert_eq!(reason, expected),
        other => panic!("expected disconnect {:?}, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_kex_and_host_key() {
    let server = start_server(SshServerConfig::default()).await;
    let client = connect(&server).await;

    assert_eq!(client.session_id().len(), 32);
    assert!(client
        .server_version()
        .unwrap()
        .software()
        .starts_with("Kestrel_"));
    assert_eq!(
        client.suite().unwrap().host_key,
        HostKeyAlgorithm::SshEd25519
    );
    assert!(client.server_host_key().is_some());
}

#[tokio::test]
async fn test_password_login_and_exec() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;

    let output = timeout(Duration::from_secs(5), client.execute("uname"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout, b"Executed: uname");
    assert_eq!(output.stderr, b"done\n");
    assert_eq!(output.exit_status, Some(3));
}

#[tokio::test]
async fn test_large_output_respects_client_window() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;

    let output = timeout(Duration::from_secs(10), client.execute("repeat 3000000"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout.len(), 3_000_000);
}

#[tokio::test]
async fn test_none_lists_methods_and_banner_once() {
    let config = SshServerConfig::builder()
        .with_banner("Authorized use only\r\n")
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    match client.authenticate_none("admin").await.unwrap() {
        AuthReply::Failure {
            methods,
            partial_success,
        } => {
            assert!(methods.contains(&"password".to_string()));
            assert!(methods.contains(&"publickey".to_string()));
            assert!(!partial_success);
        }
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(matches!(
        client.authenticate_password("admin", "wrong").await.unwrap(),
        AuthReply::Failure { .. }
    ));
    assert_eq!(client.banners(), ["Authorized use only\r\n".to_string()]);
}

#[tokio::test]
async fn test_max_auth_attempts_disconnects() {
    let config = SshServerConfig::builder()
        .with_max_auth_attempts(3)
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    for _ in 0..2 {
        assert!(matches!(
            client.authenticate_password("admin", "wrong").await.unwrap(),
            AuthReply::Failure { .. }
        ));
    }
    match client.authenticate_password("admin", "wrong").await {
        Err(KestrelError::Disconnected { reason, .. }) => {
            assert_eq!(reason, DisconnectReason::NoMoreAuthMethodsAvailable)
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_auth_timeout_disconnects() {
    let config = SshServerConfig::builder()
        .with_auth_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    let result = timeout(Duration::from_secs(5), client.recv()).await.unwrap();
    assert_disconnected(result, DisconnectReason::ByApplication);
}

#[tokio::test]
async fn test_publickey_query_and_login() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    let stranger = Ed25519HostKey::generate().unwrap();
    assert!(client
        .query_publickey("admin", HostKeyAlgorithm::SshEd25519, &server.user_key)
        .await
        .unwrap());
    assert!(matches!(
        client
            .authenticate_publickey("admin", HostKeyAlgorithm::SshEd25519, &stranger)
            .await
            .unwrap(),
        AuthReply::Failure { .. }
    ));
    assert_eq!(
        client
            .authenticate_publickey("admin", HostKeyAlgorithm::SshEd25519, &server.user_key)
            .await
            .unwrap(),
        AuthReply::Success
    );
}

#[tokio::test]
async fn test_password_change_flow() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    assert_eq!(
        client.authenticate_password("expired", "old").await.unwrap(),
        AuthReply::PasswordChangeRequired("Password expired".to_string())
    );
    assert_eq!(
        client
            .change_password("expired", "old", "new")
            .await
            .unwrap(),
        AuthReply::Success
    );
}

#[tokio::test]
async fn test_disabled_method_is_refused() {
    let config = SshServerConfig::builder()
        .with_auth_methods(vec![AuthMethod::PublicKey])
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = connect(&server).await;
    client.request_service("ssh-userauth").await.unwrap();

    match client.authenticate_password("admin", "secret").await.unwrap() {
        AuthReply::Failure { methods, .. } => assert_eq!(methods, vec!["publickey".to_string()]),
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_service_disconnects() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = connect(&server).await;

    match client.request_service("ssh-foo").await {
        Err(KestrelError::Disconnected { reason, .. }) => {
            assert_eq!(reason, DisconnectReason::ServiceNotAvailable)
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_before_auth_is_refused() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = connect(&server).await;

    let result = client.request_service("ssh-connection").await;
    assert!(matches!(
        result,
        Err(KestrelError::Disconnected {
            reason: DisconnectReason::ServiceNotAvailable,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unimplemented_for_unknown_message() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;

    client.send(&[200, 1, 2, 3]).await.unwrap();
    // UNIMPLEMENTED is consumed by the client; the session stays usable.
    assert!(client.send_keepalive().await.unwrap());
}

#[tokio::test]
async fn test_global_requests() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;

    assert!(client.send_keepalive().await.unwrap());
    assert_eq!(
        client.global_request("tcpip-forward", true).await.unwrap(),
        Some(false)
    );
    assert_eq!(client.global_request("no-reply@example.com", false).await.unwrap(), None);
    assert!(client.send_keepalive().await.unwrap());
}

#[tokio::test]
async fn test_shell_echo_and_requests() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;
    let channel = client.open_session().await.unwrap();

    assert_eq!(
        client
            .channel_request(
                &channel,
                ChannelRequestType::Env {
                    name: "LANG".into(),
                    value: "C".into(),
                },
                true,
            )
            .await
            .unwrap(),
        Some(false)
    );
    assert_eq!(
        client
            .channel_request(&channel, ChannelRequestType::Shell, true)
            .await
            .unwrap(),
        Some(true)
    );
    assert_eq!(
        client
            .channel_request(&channel, ChannelRequestType::Shell, true)
            .await
            .unwrap(),
        Some(false)
    );

    client.send_data(&channel, b"hello").await.unwrap();
    let payload = client.recv().await.unwrap();
    let data = ChannelData::from_bytes(&payload).unwrap();
    assert_eq!(data.recipient_channel(), channel.local_id);
    assert_eq!(data.data(), b"hello");

    client.close_channel(&channel).await.unwrap();
    let payload = client.recv().await.unwrap();
    assert_eq!(payload[0], MessageType::ChannelClose as u8);
    assert_eq!(
        ChannelClose::from_bytes(&payload).unwrap().recipient_channel(),
        channel.local_id
    );
}

#[tokio::test]
async fn test_window_violation_closes_only_the_channel() {
    let config = SshServerConfig::builder()
        .with_channel_window(1024, 512)
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = login(&server).await;
    let channel = client.open_session().await.unwrap();
    assert_eq!(channel.remote_window, 1024);
    assert_eq!(channel.remote_max_packet, 512);
    client
        .channel_request(&channel, ChannelRequestType::Shell, true)
        .await
        .unwrap();

    client.send_data(&channel, &[0u8; 600]).await.unwrap();
    let payload = client.recv().await.unwrap();
    assert_eq!(payload[0], MessageType::ChannelClose as u8);

    assert!(client.send_keepalive().await.unwrap());
    let second = client.open_session().await.unwrap();
    assert_ne!(second.remote_id, channel.remote_id);
}

#[tokio::test]
async fn test_unknown_channel_type_rejected() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;

    let result = client
        .open_channel(ChannelType::Other {
            name: "x11".into(),
            data: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(result, Err(ChannelOpenFailureReason::UnknownChannelType));
}

#[tokio::test]
async fn test_channel_limit() {
    let config = SshServerConfig::builder()
        .with_max_channels(1)
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = login(&server).await;

    client.open_session().await.unwrap();
    let result = client.open_channel(ChannelType::Session).await.unwrap();
    assert_eq!(result, Err(ChannelOpenFailureReason::ResourceShortage));
}

#[tokio::test]
async fn test_rekey_keeps_session_usable() {
    let server = start_server(SshServerConfig::default()).await;
    let mut client = login(&server).await;
    let session_id = client.session_id().to_vec();

    client.rekey().await.unwrap();
    assert_eq!(client.session_id(), &session_id[..]);
    let output = client.execute("after-rekey").await.unwrap();
    assert_eq!(output.stdout, b"Executed: after-rekey");
}

#[tokio::test]
async fn test_server_initiated_rekey() {
    let config = SshServerConfig::builder()
        .with_rekey_bytes_limit(64 * 1024)
        .build()
        .unwrap();
    let server = start_server(config).await;
    let mut client = login(&server).await;

    let output = timeout(Duration::from_secs(10), client.execute("repeat 300000"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout.len(), 300_000);
    assert!(client.send_keepalive().await.unwrap());
}

#[tokio::test]
async fn test_shutdown_disconnects_sessions() {
    let server = start_server(SshServerConfig::default()).await;
    let mut first = login(&server).await;
    let mut second = connect(&server).await;
    assert!(first.send_keepalive().await.unwrap());
    second.request_service("ssh-userauth").await.unwrap();
    assert_eq!(server.handle.active_sessions().await, 2);

    assert_eq!(server.handle.shutdown().await, 2);
    assert_disconnected(first.recv().await, DisconnectReason::ByApplication);
    assert_disconnected(second.recv().await, DisconnectReason::ByApplication);

    timeout(Duration::from_secs(5), async {
        while server.handle.active_sessions().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
