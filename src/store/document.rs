//! Document value codec
//!
//! Memory values and session data are arbitrary structured documents
//! (`serde_json::Value`) stored as canonical JSON bytes. Values above
//! [`COMPRESSION_THRESHOLD`] are zstd-compressed and flagged; values above
//! [`MAX_VALUE_BYTES`] are rejected outright.
//!
//! The checksum is always SHA-256 over the *uncompressed* canonical bytes,
//! so it is stable on both sides of the compression threshold and `set`/`get`
//! agree by construction. `size_bytes` is likewise the uncompressed length.

use crate::error::{BrainError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Values longer than this (encoded) are compressed before storage.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Hard cap on encoded value size. Exceeding it is a resource error.
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// A value prepared for storage.
#[derive(Debug)]
pub struct EncodedValue {
    /// Bytes to store in the `value` column (possibly compressed).
    pub bytes: Vec<u8>,
    pub is_compressed: bool,
    /// Uncompressed length of the canonical encoding.
    pub size_bytes: usize,
    /// SHA-256 hex of the uncompressed canonical encoding.
    pub checksum: String,
}

/// SHA-256 hex digest of arbitrary bytes (also used for code hashes).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Encode a document for storage.
pub fn encode(value: &Value) -> Result<EncodedValue> {
    let plain = serde_json::to_vec(value)?;
    if plain.len() > MAX_VALUE_BYTES {
        return Err(BrainError::Resource(format!(
            "value is {} bytes, limit is {MAX_VALUE_BYTES}",
            plain.len()
        )));
    }

    let checksum = sha256_hex(&plain);
    let size_bytes = plain.len();

    if plain.len() > COMPRESSION_THRESHOLD {
        let compressed = zstd::encode_all(plain.as_slice(), ZSTD_LEVEL)
            .map_err(|e| BrainError::Other(anyhow::anyhow!("compress value: {e}")))?;
        Ok(EncodedValue {
            bytes: compressed,
            is_compressed: true,
            size_bytes,
            checksum,
        })
    } else {
        Ok(EncodedValue {
            bytes: plain,
            is_compressed: false,
            size_bytes,
            checksum,
        })
    }
}

/// Decode stored bytes back into a document, verifying the checksum.
/// A mismatch is an integrity error; the caller must not alter the row.
pub fn decode(bytes: &[u8], is_compressed: bool, expected_checksum: &str) -> Result<Value> {
    let plain: Vec<u8> = if is_compressed {
        zstd::decode_all(bytes)
            .map_err(|e| BrainError::Integrity(format!("decompress value: {e}")))?
    } else {
        bytes.to_vec()
    };

    let actual = sha256_hex(&plain);
    if actual != expected_checksum {
        return Err(BrainError::Integrity(format!(
            "checksum mismatch: stored {expected_checksum}, computed {actual}"
        )));
    }

    Ok(serde_json::from_slice(&plain)?)
}

/// Flatten a document into whitespace-joined text for the FTS shadow.
/// Collects object keys and string/number scalars, depth-first.
pub fn search_text(value: &Value) -> String {
    let mut out = String::new();
    collect_text(value, &mut out);
    out
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(s);
        }
        Value::Number(n) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&n.to_string());
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(key);
                collect_text(item, out);
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}
