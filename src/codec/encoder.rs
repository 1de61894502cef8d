use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// 记录编解码器：shuffle 写出与拉取两端必须使用同一实现
pub trait Encoder<T>: Send + Sync {
    /// 追加到 out 末尾（不带长度前缀，帧长度由 shuffle 层写入）
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// 基于 bincode 的通用编码器
pub struct BincodeEncoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeEncoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeEncoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeEncoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Encoder<T> for BincodeEncoder<T> {
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, value)?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::{compare_values, Value};
    use crate::error::EngineError;
    use std::cmp::Ordering;

    fn one_of_each() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Byte(-8),
            Value::Char('界'),
            Value::Short(i16::MIN),
            Value::Int(42),
            Value::Long(i64::MAX),
            Value::Float(-0.25),
            Value::Float(f32::NAN),
            Value::Double(1e300),
            Value::Double(f64::NAN),
            Value::Str("shuffle".into()),
            Value::pair(Value::Int(1), Value::Str("a".into())),
            Value::Array(vec![
                Value::pair(Value::Str("k".into()), Value::Double(1.5)),
                Value::pair(Value::Null, Value::Array(vec![Value::Char('x')])),
            ]),
            Value::Array(Vec::new()),
        ]
    }

    #[test]
    fn every_value_kind_survives_encoding() {
        let enc = BincodeEncoder::<Value>::new();
        for v in one_of_each() {
            let mut buf = Vec::new();
            enc.encode(&v, &mut buf).unwrap();
            let back = enc.decode(&buf).unwrap();
            assert_eq!(
                compare_values(&back, &v).unwrap(),
                Ordering::Equal,
                "{} changed after encoding",
                v.type_name()
            );
        }
    }

    #[test]
    fn bytes_survive_encoding_but_have_no_order() {
        let enc = BincodeEncoder::<Value>::new();
        let v = Value::Bytes(vec![0, 255, 7]);
        let mut buf = Vec::new();
        enc.encode(&v, &mut buf).unwrap();
        let back = enc.decode(&buf).unwrap();
        assert_eq!(back, v);
        assert!(matches!(
            compare_values(&back, &v),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn truncated_payload_is_decode_error() {
        let enc = BincodeEncoder::<(String, i64)>::new();
        let mut buf = Vec::new();
        enc.encode(&("hello".to_string(), 42), &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(enc.decode(&buf), Err(EngineError::Decode(_))));
    }
}
