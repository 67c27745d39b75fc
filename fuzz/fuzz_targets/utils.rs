use std::str;

pub const MAX_INPUT_SIZE: usize = 256 * 1024;

/// Caps `data` at `MAX_INPUT_SIZE`.
#[inline]
#[allow(dead_code)]
pub fn truncate(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_INPUT_SIZE)]
}

/// Returns a UTF-8 view of `data` truncated to `MAX_INPUT_SIZE`.
///
/// If the cut lands inside a multibyte codepoint, up to 3 bytes are trimmed.
#[inline]
#[allow(dead_code)]
pub fn truncate_utf8(data: &[u8]) -> Option<&str> {
    let cap = data.len().min(MAX_INPUT_SIZE);
    for trim in 0..=3 {
        if cap < trim {
            break;
        }
        let slice = &data[..cap - trim];
        if let Ok(text) = str::from_utf8(slice) {
            return Some(text);
        }
    }
    None
}
