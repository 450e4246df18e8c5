//! Structured logging for SSH sessions
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Every event carries the peer address so one connection can be followed
//! through a busy log.
//!
//! # Log Levels
//!
//! - **TRACE**: Per-packet events (see [`crate::ssh::packet`])
//! - **DEBUG**: Ignored/debug messages, channel requests, window updates
//! - **INFO**: Session start/end, negotiated algorithms, auth results
//! - **WARN**: Disconnects caused by errors, rejected channels
//!
//! # Example
//!
//! ```no_run
//! use kestrel_proto::ssh::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("kestrel_proto::ssh=debug")
//!     .init();
//!
//! logging::log_session_start("127.0.0.1:50022");
//! ```

use super::algorithm::AlgorithmSuite;
use kestrel_platform::DisconnectReason;
use tracing::{debug, info, warn};

/// Log a newly accepted connection.
pub fn log_session_start(peer_addr: &str) {
    info!(peer = peer_addr, "SSH session started");
}

/// Log the peer's identification line.
pub fn log_peer_version(peer_addr: &str, version: &str) {
    info!(peer = peer_addr, client_version = version, "Identification exchanged");
}

/// Log the algorithms selected by one negotiation.
pub fn log_algorithms_negotiated(peer_addr: &str, suite: &AlgorithmSuite) {
    info!(
        peer = peer_addr,
        kex = suite.kex.name(),
        host_key = suite.host_key.name(),
        cipher_c2s = suite.client_to_server.cipher.name(),
        cipher_s2c = suite.server_to_client.cipher.name(),
        mac_c2s = suite.client_to_server.mac.name(),
        mac_s2c = suite.server_to_client.mac.name(),
        compression_c2s = suite.client_to_server.compression.name(),
        compression_s2c = suite.server_to_client.compression.name(),
        "Algorithms negotiated"
    );
}

/// Log a completed key exchange.
///
/// # Arguments
///
/// * `session_id` - Session identifier (first exchange hash)
/// * `rekey` - Whether this exchange replaced existing keys
pub fn log_kex_complete(peer_addr: &str, session_id: &[u8], rekey: bool) {
    info!(
        peer = peer_addr,
        session_id = %hex::encode(session_id),
        rekey = rekey,
        "Key exchange complete"
    );
}

/// Log the start of a key re-exchange.
pub fn log_rekey_start(peer_addr: &str, initiator: &str) {
    info!(peer = peer_addr, initiator = initiator, "Rekey started");
}

/// Log that a wrongly guessed KEX packet will be dropped.
pub fn log_guess_discarded(peer_addr: &str) {
    debug!(peer = peer_addr, "Discarding wrongly guessed KEX packet");
}

/// Log one authentication attempt.
pub fn log_auth_attempt(peer_addr: &str, user: &str, method: &str, attempt: u32) {
    debug!(
        peer = peer_addr,
        user = user,
        method = method,
        attempt = attempt,
        "Authentication attempt"
    );
}

/// Log successful authentication.
pub fn log_auth_success(peer_addr: &str, user: &str, method: &str) {
    info!(peer = peer_addr, user = user, method = method, "Authentication succeeded");
}

/// Log a failed authentication attempt.
pub fn log_auth_failure(peer_addr: &str, user: &str, method: &str, attempts: u32, partial: bool) {
    info!(
        peer = peer_addr,
        user = user,
        method = method,
        attempts = attempts,
        partial_success = partial,
        "Authentication failed"
    );
}

/// Log an accepted channel.
pub fn log_channel_open(local_id: u32, remote_id: u32, channel_type: &str, window: u32) {
    info!(
        local_channel = local_id,
        remote_channel = remote_id,
        channel_type = channel_type,
        initial_window = window,
        "Channel opened"
    );
}

/// Log a refused channel open.
pub fn log_channel_rejected(channel_type: &str, reason: &str) {
    warn!(channel_type = channel_type, reason = reason, "Channel open rejected");
}

/// Log a channel request.
pub fn log_channel_request(local_id: u32, request: &str, want_reply: bool, accepted: bool) {
    debug!(
        local_channel = local_id,
        request = request,
        want_reply = want_reply,
        accepted = accepted,
        "Channel request"
    );
}

/// Log a channel removed from the table.
pub fn log_channel_closed(local_id: u32) {
    info!(local_channel = local_id, "Channel closed");
}

/// Log a disconnect, sent or received.
pub fn log_disconnect(peer_addr: &str, reason: DisconnectReason, description: &str, sent: bool) {
    let direction = if sent { "sent" } else { "received" };
    if sent && reason != DisconnectReason::ByApplication {
        warn!(
            peer = peer_addr,
            reason = %reason,
            description = description,
            direction = direction,
            "Disconnect"
        );
    } else {
        info!(
            peer = peer_addr,
            reason = %reason,
            description = description,
            direction = direction,
            "Disconnect"
        );
    }
}

/// Log the end of a session.
pub fn log_session_end(peer_addr: &str, duration_ms: u64) {
    info!(peer = peer_addr, duration_ms = duration_ms, "SSH session ended");
}
