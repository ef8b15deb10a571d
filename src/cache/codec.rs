//! Entry codec - versioned value envelope
//!
//! Every record is stored in the backend as one JSON blob:
//!
//! ```text
//! {"version": 5, "value": {"title": "hello"}}
//! ```
//!
//! Decoding is strict. A blob that is not valid JSON, carries unknown fields,
//! misses either field, or holds a negative version is a `CacheError::Decode`,
//! never treated as absence.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CacheError, Result};

/// Version reported for a key that has no record
pub const ABSENT_VERSION: i64 = -1;

/// On-backend representation of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub version: i64,
    pub value: Value,
}

impl Envelope {
    pub fn new(version: i64, value: Value) -> Self {
        Self { version, value }
    }
}

/// Result of a read: the stored version and value, or absence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned {
    /// Stored version, `ABSENT_VERSION` when the key has no record
    pub version: i64,
    /// Stored value, `None` when the key has no record
    pub value: Option<Value>,
}

impl Versioned {
    /// The "no record" result
    pub fn absent() -> Self {
        Self {
            version: ABSENT_VERSION,
            value: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.version == ABSENT_VERSION
    }

    /// Deserialize the stored value into a concrete type
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.value
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CacheError::Decode(format!("Value has unexpected shape: {e}")))
    }
}

impl From<Envelope> for Versioned {
    fn from(envelope: Envelope) -> Self {
        Self {
            version: envelope.version,
            value: Some(envelope.value),
        }
    }
}

/// Serialize a `(version, value)` pair into a backend blob
pub fn encode(version: i64, value: &Value) -> Result<Vec<u8>> {
    if version < 0 {
        return Err(CacheError::InvalidVersion(version));
    }

    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        version: i64,
        value: &'a Value,
    }

    serde_json::to_vec(&EnvelopeRef { version, value })
        .map_err(|e| CacheError::Encode(format!("Envelope serialization failed: {e}")))
}

/// Parse a backend blob back into its envelope
pub fn decode(blob: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(blob)
        .map_err(|e| CacheError::Decode(format!("Malformed envelope: {e}")))?;

    if envelope.version < 0 {
        return Err(CacheError::Decode(format!(
            "Envelope carries negative version {}",
            envelope.version
        )));
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let samples = [
            (0, json!(null)),
            (5, json!("x")),
            (42, json!({"title": "Shared Document", "tags": ["a", "b"], "n": 1.5})),
            (i64::MAX, json!([1, 2, {"nested": true}])),
        ];

        for (version, value) in samples {
            let blob = encode(version, &value).unwrap();
            let envelope = decode(&blob).unwrap();
            assert_eq!(envelope, Envelope::new(version, value));
        }
    }

    #[test]
    fn test_encode_rejects_negative_version() {
        assert_eq!(
            encode(-1, &json!("x")),
            Err(CacheError::InvalidVersion(-1))
        );
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = decode(b"not json at all").unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_decode_rejects_non_conforming_shapes() {
        for blob in [
            br#"{"version": 1}"#.as_slice(),
            br#"{"value": "x"}"#.as_slice(),
            br#"{"version": "1", "value": "x"}"#.as_slice(),
            br#"{"version": 1, "value": "x", "extra": 0}"#.as_slice(),
            br#"{"version": -3, "value": "x"}"#.as_slice(),
            br#"[1, "x"]"#.as_slice(),
        ] {
            assert!(decode(blob).unwrap_err().is_decode(), "accepted {:?}", blob);
        }
    }

    #[test]
    fn test_versioned_value_as() {
        let found = Versioned::from(Envelope::new(2, json!({"n": 7})));
        assert!(!found.is_absent());

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Counter {
            n: u32,
        }
        assert_eq!(found.value_as::<Counter>().unwrap(), Some(Counter { n: 7 }));
        assert!(found.value_as::<String>().unwrap_err().is_decode());

        let absent = Versioned::absent();
        assert!(absent.is_absent());
        assert_eq!(absent.value_as::<Counter>().unwrap(), None);
    }

    #[test]
    fn test_null_value_is_not_absence() {
        let blob = encode(3, &Value::Null).unwrap();
        let envelope = decode(&blob).unwrap();
        assert_eq!(envelope.version, 3);
        assert_eq!(envelope.value, Value::Null);
    }
}
