//! # Serializers
//!
//! Purpose: Convert typed values to and from the opaque payloads stored
//! under cache keys and as set / sorted-set members.
//!
//! ## Design Principles
//! 1. **Capability Contract**: Any type implementing `Serializer` can back a
//!    provider; nothing else in the crate depends on the payload format.
//! 2. **Null Is Not a Value**: Encoding a null (`None`, `()`) fails, as does
//!    decoding an empty payload.
//! 3. **Exact Bytes**: Set membership compares payload bytes, so a
//!    serializer must be deterministic for values meant to be found again.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Converts values to payloads and back.
pub trait Serializer: Send + Sync + 'static {
    /// Encodes `value`; fails with `CacheError::Encode` for null values.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>>;

    /// Decodes `payload`; fails with `CacheError::Decode` when it is empty,
    /// malformed, or does not describe a `T`.
    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> CacheResult<T>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let payload = serde_json::to_vec(value).map_err(|err| CacheError::Encode(err.to_string()))?;
        if payload == b"null" {
            return Err(CacheError::Encode("null value".to_string()));
        }
        Ok(payload)
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> CacheResult<T> {
        if payload.is_empty() {
            return Err(CacheError::Decode("empty payload".to_string()));
        }
        serde_json::from_slice(payload).map_err(|err| CacheError::Decode(err.to_string()))
    }
}

/// MessagePack marker for nil.
const MSGPACK_NIL: u8 = 0xc0;

/// Compact binary payloads via `rmp-serde`.
///
/// Structs are written as maps keyed by field name, so payloads survive
/// field reordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let payload =
            rmp_serde::to_vec_named(value).map_err(|err| CacheError::Encode(err.to_string()))?;
        if payload == [MSGPACK_NIL] {
            return Err(CacheError::Encode("null value".to_string()));
        }
        Ok(payload)
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> CacheResult<T> {
        if payload.is_empty() {
            return Err(CacheError::Decode("empty payload".to_string()));
        }
        rmp_serde::from_slice(payload).map_err(|err| CacheError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        id: u32,
        name: String,
    }

    fn joe() -> Vec<Person> {
        vec![Person {
            id: 13,
            name: "Joe".to_string(),
        }]
    }

    #[test]
    fn json_round_trip() {
        let payload = JsonSerializer.serialize(&joe()).unwrap();
        assert_eq!(payload, br#"[{"id":13,"name":"Joe"}]"#);
        let people: Vec<Person> = JsonSerializer.deserialize(&payload).unwrap();
        assert_eq!(people, joe());
    }

    #[test]
    fn msgpack_round_trip() {
        let payload = MessagePackSerializer.serialize(&joe()).unwrap();
        let people: Vec<Person> = MessagePackSerializer.deserialize(&payload).unwrap();
        assert_eq!(people, joe());
    }

    #[test]
    fn null_values_are_rejected() {
        let none: Option<Person> = None;
        assert!(matches!(JsonSerializer.serialize(&none), Err(CacheError::Encode(_))));
        assert!(matches!(MessagePackSerializer.serialize(&none), Err(CacheError::Encode(_))));
        assert!(matches!(JsonSerializer.serialize(&()), Err(CacheError::Encode(_))));
    }

    #[test]
    fn empty_and_malformed_payloads_fail_to_decode() {
        assert!(matches!(
            JsonSerializer.deserialize::<Person>(b""),
            Err(CacheError::Decode(_))
        ));
        assert!(matches!(
            MessagePackSerializer.deserialize::<Person>(b""),
            Err(CacheError::Decode(_))
        ));
        assert!(matches!(
            JsonSerializer.deserialize::<Person>(b"{\"id\":"),
            Err(CacheError::Decode(_))
        ));
        assert!(matches!(
            JsonSerializer.deserialize::<Person>(b"\"just a string\""),
            Err(CacheError::Decode(_))
        ));
    }

    #[test]
    fn strings_are_quoted_payloads() {
        assert_eq!(JsonSerializer.serialize("123").unwrap(), b"\"123\"");
        let value: String = JsonSerializer.deserialize(b"\"123\"").unwrap();
        assert_eq!(value, "123");
    }
}
