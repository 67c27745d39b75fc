#![no_main]

use libfuzzer_sys::fuzz_target;
use sdb_wire::protocol::{parse_id_list, parse_string};
use sdb_wire::{DebugInfo, FrameInfo, LocalsInfo, ProtocolVersion, Value, VersionInfo};

mod utils;

fuzz_target!(|data: &[u8]| {
    let data = utils::truncate(data);
    let _ = VersionInfo::parse(data);
    let _ = FrameInfo::parse_list(data);
    let _ = LocalsInfo::parse(data);
    let _ = Value::parse_list(data);
    let _ = parse_id_list(data);
    let _ = parse_string(data);
    for version in [ProtocolVersion::new(2, 10), ProtocolVersion::SUPPORTED] {
        if let Ok(info) = DebugInfo::parse(data, version) {
            for entry in &info.lines {
                let file = info.source_of(entry).unwrap_or("");
                let _ = info.il_offset_for_line(file, entry.line);
                let _ = info.line_for_il_offset(entry.il_offset);
            }
        }
    }
});
