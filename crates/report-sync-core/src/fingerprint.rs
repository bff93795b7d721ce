//! Content fingerprints used for change detection and idempotence.
//!
//! A fingerprint is the hex SHA-256 of the title, the metadata serialized as
//! canonical JSON (keys sorted at every depth) and the normalized body. Two
//! documents that differ only in trailing whitespace, line endings or blank
//! line runs share a fingerprint; any other edit changes it.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::Metadata;

/// Separates the hashed fields so no field can bleed into the next.
const FIELD_SEPARATOR: u8 = 0x1f;

/// Compute the fingerprint of a document's publishable content.
pub fn fingerprint(title: &str, metadata: &Metadata, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(canonical_metadata(metadata).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(normalize_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize incidental whitespace in a document body.
///
/// CRLF becomes LF, trailing whitespace is stripped from every line, runs of
/// blank lines collapse into one, and leading/trailing blank lines are removed.
pub fn normalize_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut pending_blank = false;

    for line in body.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = line.trim_end();
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if pending_blank {
            out.push('\n');
            pending_blank = false;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }

    out
}

fn canonical_metadata(metadata: &Metadata) -> String {
    // Metadata is a BTreeMap, so top-level keys are already ordered.
    let mut out = String::from("{");
    for (i, (key, value)) in metadata.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_json_string(&mut out, key);
        out.push(':');
        write_canonical(&mut out, value);
    }
    out.push('}');
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_string()).to_string());
}
