//! Content hashing over canonical JSON.
//!
//! `serde_json::Value` keeps object keys in a `BTreeMap`, so serializing
//! through it yields sorted keys and compact separators. Every content hash
//! in the crate (catalog snapshot, plan hash, brief hash) goes through here.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` with sorted keys and no insignificant whitespace.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let tree = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&tree)?)
}

pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    format!("{digest:x}")
}

/// sha256 of the canonical JSON form of `value`.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let out = canonical_json(&json!({"b": 1, "a": {"d": 2, "c": 3}})).unwrap();
        assert_eq!(out, r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn field_order_does_not_change_hash() {
        #[derive(Serialize)]
        struct A {
            x: u32,
            y: u32,
        }
        #[derive(Serialize)]
        struct B {
            y: u32,
            x: u32,
        }
        assert_eq!(
            content_hash(&A { x: 1, y: 2 }).unwrap(),
            content_hash(&B { y: 2, x: 1 }).unwrap()
        );
    }
}
