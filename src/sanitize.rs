/// Sanitization and hashing helpers
///
/// Everything destined for a text column goes through strip_nul first:
/// Postgres TEXT cannot hold NUL bytes, and some historic sporks served
/// payloads containing them. The strip is counted so it stays visible.

use sha2::{Digest, Sha256};

use crate::metrics;

/// Strip NUL bytes from a string bound for a text column.
pub fn strip_nul(s: &str) -> String {
    if !s.contains('\0') {
        return s.to_string();
    }
    metrics::SANITIZER_NUL_STRIPS.inc();
    s.chars().filter(|c| *c != '\0').collect()
}

/// Strip NUL bytes in place inside every string value of a JSON tree.
pub fn strip_nul_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains('\0') {
                *s = strip_nul(s);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_nul_json(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                strip_nul_json(item);
            }
        }
        _ => {}
    }
}

/// Lowercase-hex sha256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// script_hash = sha256(script_bytes), stored lowercase hex, no prefix.
pub fn script_hash(script: &str) -> String {
    sha256_hex(script.as_bytes())
}

/// payload_hash = sha256 of the serialized payload bytes.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    sha256_hex(&bytes)
}

/// Serialized payload size, the value the inline/offload decision is made on.
pub fn payload_size(payload: &serde_json::Value) -> usize {
    serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0)
}

/// Normalize an address to lowercase hex without a 0x prefix.
pub fn normalize_address(addr: &str) -> String {
    let trimmed = addr.strip_prefix("0x").unwrap_or(addr);
    trimmed.to_ascii_lowercase()
}
