//! Fuzz target for SSH message decoders.
//!
//! Every decoder that sees peer controlled payloads gets the same input.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_messages -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::auth::AuthRequest;
use kestrel_proto::ssh::connection::{
    ChannelData, ChannelOpen, ChannelRequest, ChannelWindowAdjust, GlobalRequest,
};
use kestrel_proto::ssh::hostkey::PublicKey;
use kestrel_proto::ssh::kex::KexInit;
use kestrel_proto::ssh::message::{Disconnect, ServiceRequest};
use kestrel_proto::ssh::version::Version;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = KexInit::from_bytes(data);
    let _ = AuthRequest::from_bytes(data);
    let _ = ChannelOpen::from_bytes(data);
    let _ = ChannelRequest::from_bytes(data);
    let _ = ChannelData::from_bytes(data);
    let _ = ChannelWindowAdjust::from_bytes(data);
    let _ = GlobalRequest::from_bytes(data);
    let _ = ServiceRequest::from_bytes(data);
    let _ = Disconnect::from_bytes(data);
    let _ = PublicKey::from_blob(data);
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = Version::parse(line);
    }
});
