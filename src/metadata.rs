//! Ordered, copy-on-write metadata maps.
//!
//! [`Metadata`] maps string keys to variant arrays or nested metadata, in
//! insertion order. Assignment shares storage; the first mutation of a
//! shared instance clones the backing map, so aliases never observe writes.
//! Scalars are stored as single-element arrays behind typed accessors.
//! Serialization through a [`BinaryStream`] followed by deserialization is
//! identity.

use std::collections::HashMap;
use std::sync::Arc;

use crate::array::VariantArray;
use crate::error::{Error, Result};
use crate::stream::BinaryStream;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(VariantArray),
    Nested(Metadata),
}

#[derive(Debug, Clone, Default)]
struct MapInner {
    keys: Vec<String>,
    values: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    inner: Arc<MapInner>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.keys.is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.values.contains_key(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys.iter().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let inner = Arc::make_mut(&mut self.inner);
        if inner.values.insert(key.clone(), value).is_none() {
            inner.keys.push(key);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let inner = Arc::make_mut(&mut self.inner);
        let removed = inner.values.remove(key);
        if removed.is_some() {
            inner.keys.retain(|k| k != key);
        }
        removed
    }

    pub fn set_array(&mut self, key: impl Into<String>, array: VariantArray) {
        self.set(key, Value::Array(array));
    }

    pub fn set_nested(&mut self, key: impl Into<String>, nested: Metadata) {
        self.set(key, Value::Nested(nested));
    }

    pub fn set_u64(&mut self, key: impl Into<String>, value: u64) {
        self.set_array(key, VariantArray::from(vec![value]));
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) {
        self.set_array(key, VariantArray::from(vec![value]));
    }

    pub fn set_f64(&mut self, key: impl Into<String>, value: f64) {
        self.set_array(key, VariantArray::from(vec![value]));
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_array(key, VariantArray::String(vec![value.into()]));
    }

    pub fn set_u64s(&mut self, key: impl Into<String>, values: Vec<u64>) {
        self.set_array(key, VariantArray::from(values));
    }

    pub fn set_f64s(&mut self, key: impl Into<String>, values: Vec<f64>) {
        self.set_array(key, VariantArray::from(values));
    }

    pub fn set_strings(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.set_array(key, VariantArray::String(values));
    }

    pub fn get_array(&self, key: &str) -> Option<&VariantArray> {
        match self.get(key) {
            Some(Value::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn get_nested(&self, key: &str) -> Option<&Metadata> {
        match self.get(key) {
            Some(Value::Nested(m)) => Some(m),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_array(key)?.to_u64_vec()?.first().copied()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_array(key)?.get_f64(0)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get_array(key)? {
            VariantArray::String(v) => v.first().cloned(),
            _ => None,
        }
    }

    pub fn get_u64s(&self, key: &str) -> Option<Vec<u64>> {
        self.get_array(key)?.to_u64_vec()
    }

    pub fn get_f64s(&self, key: &str) -> Option<Vec<f64>> {
        self.get_array(key)?.to_f64_vec()
    }

    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        self.get_array(key)?.as_strings().map(<[String]>::to_vec)
    }

    /// Fetches a required entry, mapping absence to a semantic error.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key)
            .ok_or_else(|| Error::semantic(format!("metadata key '{key}' missing or not numeric")))
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.get_string(key)
            .ok_or_else(|| Error::semantic(format!("metadata key '{key}' missing or not a string")))
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        stream.append_u64(self.len() as u64);
        for key in &self.inner.keys {
            stream.append_str(key);
            match &self.inner.values[key] {
                Value::Array(a) => {
                    stream.append_u8(0);
                    a.to_stream(stream);
                }
                Value::Nested(m) => {
                    stream.append_u8(1);
                    m.to_stream(stream);
                }
            }
        }
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<Metadata> {
        let n = stream.consume_u64()?;
        let mut md = Metadata::new();
        for _ in 0..n {
            let key = stream.consume_str()?;
            let value = match stream.consume_u8()? {
                0 => Value::Array(VariantArray::from_stream(stream)?),
                1 => Value::Nested(Metadata::from_stream(stream)?),
                tag => return Err(Error::stream(format!("unknown metadata value tag {tag}"))),
            };
            md.set(key, value);
        }
        Ok(md)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut stream = BinaryStream::new();
        self.to_stream(&mut stream);
        stream.into_bytes()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Metadata> {
        let mut stream = BinaryStream::from_bytes(bytes);
        Metadata::from_stream(&mut stream)
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        self.inner.keys == other.inner.keys
            && self
                .inner
                .keys
                .iter()
                .all(|k| self.inner.values.get(k) == other.inner.values.get(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        let mut md = Metadata::new();
        md.set_string("name", "air_temperature");
        md.set_u64("number_of_time_steps", 365);
        md.set_f64s("bounds", vec![0.0, 360.0, -90.0, 90.0, 0.0, 0.0]);
        let mut atts = Metadata::new();
        atts.set_string("units", "K");
        atts.set_f64("_FillValue", 1.0e20);
        md.set_nested("attributes", atts);
        md
    }

    #[test]
    fn insertion_order_is_preserved() {
        let md = sample();
        let keys: Vec<&str> = md.keys().collect();
        assert_eq!(
            keys,
            vec!["name", "number_of_time_steps", "bounds", "attributes"]
        );
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut md = sample();
        md.set_u64("name", 1);
        assert_eq!(md.keys().next(), Some("name"));
        assert_eq!(md.get_u64("name"), Some(1));
        assert_eq!(md.len(), 4);
    }

    #[test]
    fn aliases_do_not_observe_writes() {
        let md = sample();
        let mut copy = md.clone();
        copy.set_u64("number_of_time_steps", 1);
        copy.remove("bounds");
        assert_eq!(md.get_u64("number_of_time_steps"), Some(365));
        assert!(md.has("bounds"));
        assert_eq!(copy.get_u64("number_of_time_steps"), Some(1));
    }

    #[test]
    fn stream_round_trip_is_identity() {
        let md = sample();
        let copy = Metadata::from_bytes(md.to_bytes()).unwrap();
        assert_eq!(md, copy);
    }

    #[test]
    fn nested_access() {
        let md = sample();
        let atts = md.get_nested("attributes").unwrap();
        assert_eq!(atts.get_string("units").as_deref(), Some("K"));
        assert_eq!(atts.get_f64("_FillValue"), Some(1.0e20));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut md = sample();
        assert!(md.remove("nope").is_none());
        assert_eq!(md.len(), 4);
    }
}
