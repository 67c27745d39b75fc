#![no_main]

use libfuzzer_sys::fuzz_target;
use sdb_wire::PacketKind;

mod utils;

fuzz_target!(|data: &[u8]| {
    let Ok(packets) = sdb_wire::decode_packet_bytes(utils::truncate(data)) else {
        return;
    };
    for packet in packets {
        if packet.kind() == PacketKind::Event {
            let _ = sdb_wire::parse_composite_event(packet.payload());
        }
        // Whatever decodes must encode back to the same frame.
        let encoded = packet.encode();
        let again = sdb_wire::decode_packet_bytes(&encoded).expect("re-decoding an encoded packet");
        assert_eq!(again, vec![packet]);
    }
});
