//! Fuzz target for SSH packet parsing.
//!
//! Feeds random input to the plaintext packet parser and to the stream
//! reader. Neither may panic, loop forever or allocate past the packet
//! size limit.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::packet::{Packet, PacketReader, MAX_PACKET_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    rt.block_on(async {
        let mut reader = PacketReader::new(data, MAX_PACKET_SIZE);
        while reader.read_packet().await.is_ok() {}
    });
});
