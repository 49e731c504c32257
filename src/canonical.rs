//! Canonical serialization for signed objects.
//!
//! Every signature in the system is computed over the same canonical form:
//! compact JSON with object keys in sorted order and the signature-bearing
//! fields removed. Sign and verify sides MUST go through this module; a
//! second serializer would silently break signature verification.
//!
//! `serde_json`'s default `Map` is BTreeMap-backed, so key order is already
//! sorted; `to_string` emits no insignificant whitespace. What this module
//! adds is the signature-field exclusion and a single place where the rule
//! is stated.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// Canonical bytes of a full object (no fields excluded).
pub fn to_canonical_bytes<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
    let value =
        serde_json::to_value(obj).map_err(|e| Error::Canonicalization(e.to_string()))?;
    render(&value)
}

/// Canonical bytes with the named top-level fields removed.
///
/// This is the signed payload: `signable_bytes(&cert, &["signature"])`.
pub fn signable_bytes<T: Serialize>(obj: &T, exclude: &[&str]) -> Result<Vec<u8>> {
    let mut value =
        serde_json::to_value(obj).map_err(|e| Error::Canonicalization(e.to_string()))?;
    match value {
        Value::Object(ref mut map) => {
            for field in exclude {
                map.remove(*field);
            }
        }
        _ => {
            return Err(Error::Canonicalization(
                "signed objects must serialize to a JSON object".into(),
            ));
        }
    }
    render(&value)
}

fn render(value: &Value) -> Result<Vec<u8>> {
    // Floats have no canonical text form; signed objects must not carry them.
    if contains_float(value) {
        return Err(Error::Canonicalization(
            "non-integer number in canonical object".into(),
        ));
    }
    serde_json::to_vec(value).map_err(|e| Error::Canonicalization(e.to_string()))
}

fn contains_float(value: &Value) -> bool {
    match value {
        Value::Number(n) => !n.is_u64() && !n.is_i64(),
        Value::Array(items) => items.iter().any(contains_float),
        Value::Object(map) => map.values().any(contains_float),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Signed {
        zebra: u64,
        alpha: String,
        signature: String,
    }

    #[test]
    fn keys_are_sorted_and_compact() {
        let obj = Signed {
            zebra: 1,
            alpha: "a".into(),
            signature: "sig".into(),
        };
        let bytes = to_canonical_bytes(&obj).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":"a","signature":"sig","zebra":1}"#
        );
    }

    #[test]
    fn signature_field_is_excluded() {
        let obj = Signed {
            zebra: 1,
            alpha: "a".into(),
            signature: "sig".into(),
        };
        let bytes = signable_bytes(&obj, &["signature"]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":"a","zebra":1}"#
        );
    }

    #[test]
    fn signable_bytes_stable_across_signature_value() {
        let a = Signed {
            zebra: 9,
            alpha: "x".into(),
            signature: "one".into(),
        };
        let b = Signed {
            zebra: 9,
            alpha: "x".into(),
            signature: "two".into(),
        };
        assert_eq!(
            signable_bytes(&a, &["signature"]).unwrap(),
            signable_bytes(&b, &["signature"]).unwrap()
        );
    }

    #[test]
    fn floats_are_rejected() {
        #[derive(Serialize)]
        struct Bad {
            x: f64,
        }
        assert!(to_canonical_bytes(&Bad { x: 1.5 }).is_err());
    }

    #[test]
    fn non_object_rejected_for_signing() {
        assert!(signable_bytes(&vec![1u64, 2], &["signature"]).is_err());
    }
}
