//! Canonical JSON codec
//!
//! `encode` is a total, deterministic function over every serde value that has
//! a canonical form:
//!
//! - object keys sorted bytewise, no insignificant whitespace
//! - integers in plain decimal, floats in shortest round-trip form, `-0.0` as `0.0`
//! - strings as UTF-8 with only the escapes JSON requires
//!
//! Values without a canonical form (non-finite floats, non-scalar map keys,
//! keys that collide once stringified) are rejected with a serialization
//! error instead of being coerced.

use crate::errors::{Result, VigilError};
use crate::hash::{Digest, HashAlgorithmId};
use serde::de::DeserializeOwned;
use serde::ser::{self, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Intermediate tree with a single canonical rendering
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    /// JSON null
    Null,
    /// JSON boolean
    Bool(bool),
    /// Negative integer
    Int(i64),
    /// Non-negative integer
    UInt(u64),
    /// Finite float
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered list
    Array(Vec<CanonicalValue>),
    /// Object with sorted keys
    Object(BTreeMap<String, CanonicalValue>),
}

/// Encode a value into canonical bytes
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let tree = to_canonical(value)?;
    let mut out = Vec::with_capacity(128);
    write_value(&tree, &mut out)?;
    Ok(out)
}

/// Encode a value into a canonical string
pub fn encode_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = encode(value)?;
    String::from_utf8(bytes).map_err(|e| VigilError::serialization(e.to_string()))
}

/// Decode canonical (or any valid JSON) bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| VigilError::serialization(e.to_string()))
}

/// Re-encode arbitrary JSON bytes into canonical form
pub fn canonicalize_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value = decode(bytes)?;
    encode(&value)
}

/// Encode and hash under a domain tag
pub fn canonical_digest<T: Serialize + ?Sized>(
    algorithm: HashAlgorithmId,
    tag: &[u8],
    value: &T,
) -> Result<Digest> {
    let bytes = encode(value)?;
    Ok(algorithm.hash_tagged(tag, &[&bytes]))
}

/// Build the canonical tree for a value
pub fn to_canonical<T: Serialize + ?Sized>(value: &T) -> Result<CanonicalValue> {
    value
        .serialize(CanonicalSerializer)
        .map_err(|e| VigilError::serialization(e.0))
}

fn write_value(value: &CanonicalValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        CanonicalValue::Null => out.extend_from_slice(b"null"),
        CanonicalValue::Bool(true) => out.extend_from_slice(b"true"),
        CanonicalValue::Bool(false) => out.extend_from_slice(b"false"),
        CanonicalValue::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
        CanonicalValue::UInt(v) => out.extend_from_slice(v.to_string().as_bytes()),
        CanonicalValue::Float(v) => {
            let normalized = if *v == 0.0 { 0.0 } else { *v };
            serde_json::to_writer(&mut *out, &normalized)?;
        }
        CanonicalValue::String(s) => serde_json::to_writer(&mut *out, s)?,
        CanonicalValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        CanonicalValue::Object(map) => {
            out.push(b'{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_value(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Error raised inside the serializer
#[derive(Debug)]
pub struct CodecError(String);

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CodecError {}

impl ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError(msg.to_string())
    }
}

type CodecResult<T> = std::result::Result<T, CodecError>;

fn float(v: f64) -> CodecResult<CanonicalValue> {
    if !v.is_finite() {
        return Err(CodecError(format!(
            "non-finite float {v} has no canonical encoding"
        )));
    }
    Ok(CanonicalValue::Float(v))
}

fn int128(v: i128) -> CodecResult<CanonicalValue> {
    if v >= 0 {
        u64::try_from(v)
            .map(CanonicalValue::UInt)
            .map_err(|_| CodecError(format!("integer {v} exceeds 64 bits")))
    } else {
        i64::try_from(v)
            .map(CanonicalValue::Int)
            .map_err(|_| CodecError(format!("integer {v} exceeds 64 bits")))
    }
}

fn tagged(variant: &str, value: CanonicalValue) -> CanonicalValue {
    let mut map = BTreeMap::new();
    map.insert(variant.to_owned(), value);
    CanonicalValue::Object(map)
}

struct CanonicalSerializer;

impl ser::Serializer for CanonicalSerializer {
    type Ok = CanonicalValue;
    type Error = CodecError;
    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = SeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = MapBuilder;

    fn serialize_bool(self, v: bool) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> CodecResult<CanonicalValue> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> CodecResult<CanonicalValue> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> CodecResult<CanonicalValue> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> CodecResult<CanonicalValue> {
        int128(i128::from(v))
    }

    fn serialize_i128(self, v: i128) -> CodecResult<CanonicalValue> {
        int128(v)
    }

    fn serialize_u8(self, v: u8) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::UInt(u64::from(v)))
    }

    fn serialize_u16(self, v: u16) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::UInt(u64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::UInt(u64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::UInt(v))
    }

    fn serialize_u128(self, v: u128) -> CodecResult<CanonicalValue> {
        u64::try_from(v)
            .map(CanonicalValue::UInt)
            .map_err(|_| CodecError(format!("integer {v} exceeds 64 bits")))
    }

    fn serialize_f32(self, v: f32) -> CodecResult<CanonicalValue> {
        float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> CodecResult<CanonicalValue> {
        float(v)
    }

    fn serialize_char(self, v: char) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::String(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::Array(
            v.iter().map(|b| CanonicalValue::UInt(u64::from(*b))).collect(),
        ))
    }

    fn serialize_none(self) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> CodecResult<CanonicalValue> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> CodecResult<CanonicalValue> {
        Ok(CanonicalValue::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> CodecResult<CanonicalValue> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> CodecResult<CanonicalValue> {
        Ok(tagged(variant, value.serialize(CanonicalSerializer)?))
    }

    fn serialize_seq(self, len: Option<usize>) -> CodecResult<SeqBuilder> {
        Ok(SeqBuilder {
            variant: None,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> CodecResult<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> CodecResult<SeqBuilder> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> CodecResult<SeqBuilder> {
        Ok(SeqBuilder {
            variant: Some(variant),
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> CodecResult<MapBuilder> {
        Ok(MapBuilder::new(None))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> CodecResult<MapBuilder> {
        Ok(MapBuilder::new(None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> CodecResult<MapBuilder> {
        Ok(MapBuilder::new(Some(variant)))
    }
}

struct SeqBuilder {
    variant: Option<&'static str>,
    items: Vec<CanonicalValue>,
}

impl SeqBuilder {
    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        self.items.push(value.serialize(CanonicalSerializer)?);
        Ok(())
    }

    fn finish(self) -> CanonicalValue {
        let array = CanonicalValue::Array(self.items);
        match self.variant {
            Some(variant) => tagged(variant, array),
            None => array,
        }
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        self.push(value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

struct MapBuilder {
    variant: Option<&'static str>,
    map: BTreeMap<String, CanonicalValue>,
    pending_key: Option<String>,
}

impl MapBuilder {
    fn new(variant: Option<&'static str>) -> Self {
        Self {
            variant,
            map: BTreeMap::new(),
            pending_key: None,
        }
    }

    fn insert(&mut self, key: String, value: CanonicalValue) -> CodecResult<()> {
        if self.map.contains_key(&key) {
            return Err(CodecError(format!(
                "duplicate key '{key}' has no canonical ordering"
            )));
        }
        self.map.insert(key, value);
        Ok(())
    }

    fn finish(self) -> CanonicalValue {
        let object = CanonicalValue::Object(self.map);
        match self.variant {
            Some(variant) => tagged(variant, object),
            None => object,
        }
    }
}

impl ser::SerializeMap for MapBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> CodecResult<()> {
        let key = match key.serialize(CanonicalSerializer)? {
            CanonicalValue::String(s) => s,
            CanonicalValue::Int(v) => v.to_string(),
            CanonicalValue::UInt(v) => v.to_string(),
            CanonicalValue::Bool(v) => v.to_string(),
            other => {
                return Err(CodecError(format!(
                    "map key {other:?} is not a scalar and has no canonical form"
                )))
            }
        };
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> CodecResult<()> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CodecError("map value without key".to_owned()))?;
        let value = value.serialize(CanonicalSerializer)?;
        self.insert(key, value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> CodecResult<()> {
        let value = value.serialize(CanonicalSerializer)?;
        self.insert(key.to_owned(), value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

impl ser::SerializeStructVariant for MapBuilder {
    type Ok = CanonicalValue;
    type Error = CodecError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> CodecResult<()> {
        let value = value.serialize(CanonicalSerializer)?;
        self.insert(key.to_owned(), value)
    }

    fn end(self) -> CodecResult<CanonicalValue> {
        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_keys_are_sorted_and_compact() {
        let bytes = encode(&json!({"b": 2, "a": {"d": [1, 2], "c": null}})).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":null,"d":[1,2]},"b":2}"#.to_vec());
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..32 {
            first.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            second.insert(format!("k{i}"), i);
        }
        assert_eq!(encode(&first).unwrap(), encode(&second).unwrap());
    }

    #[test]
    fn test_nan_is_rejected() {
        let err = encode(&vec![1.0, f64::NAN]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert!(encode(&f64::INFINITY).is_err());
    }

    #[test]
    fn test_negative_zero_normalized() {
        assert_eq!(encode(&-0.0f64).unwrap(), encode(&0.0f64).unwrap());
    }

    #[test]
    fn test_non_scalar_map_key_rejected() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], "x");
        assert!(encode(&map).is_err());
    }

    #[test]
    fn test_colliding_keys_rejected() {
        #[derive(serde::Serialize)]
        struct Pair {
            #[serde(flatten)]
            left: HashMap<String, u8>,
            #[serde(flatten)]
            right: HashMap<u8, u8>,
        }
        let pair = Pair {
            left: HashMap::from([("1".to_owned(), 1)]),
            right: HashMap::from([(1, 2)]),
        };
        assert!(encode(&pair).is_err());
    }

    #[test]
    fn test_unicode_is_not_escaped() {
        let bytes = encode(&json!({"name": "café"})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\"name\":\"café\"}");
    }

    #[test]
    fn test_canonicalize_bytes_is_idempotent() {
        let once = canonicalize_bytes(br#"{ "z" : 1, "a" : [ true ] }"#).unwrap();
        let twice = canonicalize_bytes(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, br#"{"a":[true],"z":1}"#.to_vec());
    }

    proptest::proptest! {
        #[test]
        fn prop_canonical_bytes_survive_a_json_round_trip(
            entries in proptest::collection::hash_map("[a-z\u{e9}]{0,6}", -1000i64..1000, 0..12),
            flag in proptest::bool::ANY,
        ) {
            let value = json!({ "entries": entries, "flag": flag });
            let once = encode(&value).unwrap();
            proptest::prop_assert_eq!(canonicalize_bytes(&once).unwrap(), once.clone());
            let sorted: BTreeMap<_, _> = entries.into_iter().collect();
            let reordered = encode(&json!({ "flag": flag, "entries": sorted })).unwrap();
            proptest::prop_assert_eq!(reordered, once);
        }
    }

    #[test]
    fn test_enum_encodings() {
        #[derive(serde::Serialize)]
        enum Shape {
            Dot,
            Line(u8, u8),
            Box { w: u8, h: u8 },
        }
        assert_eq!(encode_string(&Shape::Dot).unwrap(), "\"Dot\"");
        assert_eq!(encode_string(&Shape::Line(1, 2)).unwrap(), "{\"Line\":[1,2]}");
        assert_eq!(
            encode_string(&Shape::Box { w: 3, h: 4 }).unwrap(),
            "{\"Box\":{\"h\":4,\"w\":3}}"
        );
    }
}
