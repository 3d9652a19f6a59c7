//! Canonical serialization used for every hash in the ledger.
//!
//! Values are rendered as compact JSON with object keys sorted at every
//! nesting level. Integers are written as plain decimal digits and floats in
//! their shortest round-trip form (`10.0`, `0.25`, `1e21`), so two nodes that
//! agree on field values always agree on bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Anything that has a canonical JSON form.
pub trait Canonical {
    fn canonical(&self) -> Value;
}

impl Canonical for Value {
    fn canonical(&self) -> Value {
        self.clone()
    }
}

pub fn encode<T: Canonical + ?Sized>(value: &T) -> Vec<u8> {
    encode_value(&value.canonical())
}

pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

/// SHA-256 of the canonical encoding, as lowercase hex.
pub fn hash<T: Canonical + ?Sized>(value: &T) -> String {
    hex::encode(Sha256::digest(encode(value)))
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_leaf(&Value::String(key.clone()), out);
                out.push(b':');
                write_value(item, out);
            }
            out.push(b'}');
        }
        leaf => write_leaf(leaf, out),
    }
}

// serde_json's Display for scalars is compact, escapes strings and formats
// floats through ryu.
fn write_leaf(leaf: &Value, out: &mut Vec<u8>) {
    out.extend_from_slice(leaf.to_string().as_bytes());
}
