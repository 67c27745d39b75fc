#![no_main]

use libfuzzer_sys::fuzz_target;

mod utils;

fuzz_target!(|data: &[u8]| {
    let Some(text) = utils::truncate_utf8(data) else {
        return;
    };
    if let Ok(config) = sdb_config::DebuggerConfig::from_toml_str(text) {
        let _ = config.validate();
    }
});
