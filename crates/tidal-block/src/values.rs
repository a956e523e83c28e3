//! Typed block values and the serializer seam
//!
//! Blocks either hold opaque bytes or typed values. The engine is generic
//! over the value type; everything a value must support is bundled into the
//! [`BlockValue`] trait so the bound reads the same at every seam.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tidal_common::error::{Error, Result};

/// Cheap, order-of-magnitude estimate of a value's in-memory footprint.
/// Used by the unroll bookkeeping; precision matters less than monotonicity.
pub trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

macro_rules! impl_estimate_size_fixed {
    ($($ty:ty),*) => {
        $(impl EstimateSize for $ty {
            fn estimated_size(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        })*
    };
}

impl_estimate_size_fixed!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, bool);

impl EstimateSize for String {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<String>() + self.len()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Vec<T>>() + self.iter().map(EstimateSize::estimated_size).sum::<usize>()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Option<T>>()
            + self.as_ref().map_or(0, EstimateSize::estimated_size)
    }
}

impl<A: EstimateSize, B: EstimateSize> EstimateSize for (A, B) {
    fn estimated_size(&self) -> usize {
        self.0.estimated_size() + self.1.estimated_size()
    }
}

impl EstimateSize for bytes::Bytes {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<bytes::Bytes>() + self.len()
    }
}

impl EstimateSize for serde_json::Value {
    fn estimated_size(&self) -> usize {
        // Rough: a JSON tree costs about its rendered length
        match self {
            serde_json::Value::String(s) => 32 + s.len(),
            serde_json::Value::Array(items) => {
                32 + items.iter().map(EstimateSize::estimated_size).sum::<usize>()
            }
            serde_json::Value::Object(map) => {
                32 + map
                    .iter()
                    .map(|(k, v)| k.len() + v.estimated_size())
                    .sum::<usize>()
            }
            _ => 32,
        }
    }
}

/// Everything the engine needs from a block's value type
pub trait BlockValue:
    Serialize + DeserializeOwned + EstimateSize + Clone + Send + Sync + 'static
{
}

impl<T> BlockValue for T where
    T: Serialize + DeserializeOwned + EstimateSize + Clone + Send + Sync + 'static
{
}

/// Converts between typed values and serialized bytes. The concrete
/// serialization library lives outside this subsystem; blocks only care that
/// the same serializer reads back what it wrote.
pub trait BlockSerializer<V>: Send + Sync {
    /// Serialize every value of the iterator into `out`
    fn serialize_stream(
        &self,
        values: &mut dyn Iterator<Item = V>,
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Serialize a single value into `out`
    fn serialize_one(&self, value: &V, out: &mut dyn Write) -> Result<()>;

    /// Read every value back from `reader`
    fn deserialize_all(&self, reader: &mut dyn Read) -> Result<Vec<V>>;
}

/// Default serializer: one JSON document per value, concatenated. Matches
/// how the rest of the engine serializes records.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<V: BlockValue> BlockSerializer<V> for JsonSerializer {
    fn serialize_stream(
        &self,
        values: &mut dyn Iterator<Item = V>,
        out: &mut dyn Write,
    ) -> Result<()> {
        for value in values {
            self.serialize_one(&value, out)?;
        }
        Ok(())
    }

    fn serialize_one(&self, value: &V, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(&mut *out, value)?;
        out.write_all(b"\n").map_err(Error::Io)?;
        Ok(())
    }

    fn deserialize_all(&self, reader: &mut dyn Read) -> Result<Vec<V>> {
        let stream = serde_json::Deserializer::from_reader(reader).into_iter::<V>();
        let mut values = Vec::new();
        for item in stream {
            values.push(item.map_err(|e| Error::Serialization(e.to_string()))?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_serializer_round_trips() {
        let serializer = JsonSerializer;
        let values: Vec<String> = vec!["a".into(), "b".into(), "c".into()];

        let mut buf = Vec::new();
        let mut iter = values.clone().into_iter();
        BlockSerializer::<String>::serialize_stream(&serializer, &mut iter, &mut buf).unwrap();

        let read: Vec<String> =
            BlockSerializer::<String>::deserialize_all(&serializer, &mut buf.as_slice()).unwrap();
        assert_eq!(read, values);
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let serializer = JsonSerializer;
        let mut bad: &[u8] = b"{not json";
        let result: Result<Vec<String>> =
            BlockSerializer::<String>::deserialize_all(&serializer, &mut bad);
        assert!(result.is_err());
    }

    #[test]
    fn size_estimates_scale_with_content() {
        let short = "x".to_string();
        let long = "x".repeat(1000);
        assert!(long.estimated_size() > short.estimated_size());

        let nested = vec![vec![1u64; 10]; 10];
        assert!(nested.estimated_size() >= 10 * 10 * 8);
    }
}
