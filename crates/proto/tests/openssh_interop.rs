//! OpenSSH interoperability tests.
//!
//! These tests need OpenSSH installed (and, for the client test, a running
//! sshd) and are marked `#[ignore]`. To run them:
//!
//! ```bash
//! cargo test --test openssh_interop -- --ignored --nocapture
//! ```

use kestrel_proto::ssh::algorithm::AlgorithmRegistry;
use kestrel_proto::ssh::auth::{AuthDecision, Authenticator, Credentials};
use kestrel_proto::ssh::channel::SessionConsumer;
use kestrel_proto::ssh::client::SshClient;
use kestrel_proto::ssh::config::SshServerConfig;
use kestrel_proto::ssh::hostkey::{Ed25519HostKey, HostKeySet};
use kestrel_proto::ssh::server::{SessionHandler, SshServer};
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

struct RejectAll;

#[async_trait::async_trait]
impl Authenticator for RejectAll {
    async fn authenticate(&self, _user: &str, _credentials: Credentials<'_>) -> AuthDecision {
        AuthDecision::failure()
    }
}

struct NoSessions;

#[async_trait::async_trait]
impl SessionHandler for NoSessions {
    async fn session(&self, _user: &str) -> Option<Box<dyn SessionConsumer>> {
        None
    }
}

/// The OpenSSH client completes key exchange with our server and is then
/// refused at authentication.
#[tokio::test]
#[ignore]
async fn test_openssh_client_against_server() -> Result<(), Box<dyn std::error::Error>> {
    let server = SshServer::bind(
        "127.0.0.1:0",
        SshServerConfig::default(),
        HostKeySet::new().with_key(Ed25519HostKey::generate()?),
        Arc::new(RejectAll),
        Arc::new(NoSessions),
    )
    .await?;
    let port = server.local_addr()?.port();
    let handle = server.handle();
    tokio::spawn(async move { server.run().await });

    let output = timeout(
        Duration::from_secs(20),
        Command::new("ssh")
            .args([
                "-v",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "PubkeyAuthentication=no",
                "-p",
                &port.to_string(),
                "tester@127.0.0.1",
                "true",
            ])
            .output(),
    )
    .await??;

    let stderr = String::from_utf8_lossy(&output.stderr);
    println!("{}", stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("SSH2_MSG_NEWKEYS received"));
    assert!(stderr.contains("Permission denied"));

    handle.shutdown().await;
    Ok(())
}

/// Our client completes key exchange with a local OpenSSH server.
#[tokio::test]
#[ignore]
async fn test_connect_to_openssh_localhost() -> Result<(), Box<dyn std::error::Error>> {
    let client = timeout(
        Duration::from_secs(10),
        SshClient::connect_tcp("127.0.0.1:22", &AlgorithmRegistry::default()),
    )
    .await??;

    println!("Server version: {:?}", client.server_version());
    println!("Negotiated: {}", client.suite().map(|s| s.to_string()).unwrap_or_default());
    assert!(client.server_host_key().is_some());
    assert_eq!(client.session_id().len(), 32);
    Ok(())
}
