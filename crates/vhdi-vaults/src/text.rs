//! UTF-16 name decoding

use encoding_rs::{UTF_16BE, UTF_16LE};

fn until_nul(decoded: &str) -> String {
    match decoded.find('\0') {
        Some(end) => decoded[..end].to_string(),
        None => decoded.to_string(),
    }
}

/// Decode UTF-16BE bytes up to the first NUL character
pub fn utf16be_until_nul(bytes: &[u8]) -> String {
    let (decoded, _) = UTF_16BE.decode_without_bom_handling(bytes);
    until_nul(&decoded)
}

/// Decode UTF-16LE bytes up to the first NUL character
pub fn utf16le_until_nul(bytes: &[u8]) -> String {
    let (decoded, _) = UTF_16LE.decode_without_bom_handling(bytes);
    until_nul(&decoded)
}
