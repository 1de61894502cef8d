use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// 动态类型值：shuffle key 的通用表示（含 pair / array 组合）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    /// 原始字节：可编码，但没有定义顺序
    Bytes(Vec<u8>),
    Pair(Box<Value>, Box<Value>),
    Array(Vec<Value>),
}

impl Value {
    pub fn pair(a: Value, b: Value) -> Self {
        Value::Pair(Box::new(a), Box::new(b))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Pair(..) => "pair",
            Value::Array(_) => "array",
        }
    }
}

/// 比较器：同类型值的全序；类型不同返回错误
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Result<Ordering> + Send + Sync>;

pub fn natural_order<T: Ord>() -> Comparator<T> {
    Arc::new(|a: &T, b: &T| Ok(a.cmp(b)))
}

pub fn value_order() -> Comparator<Value> {
    Arc::new(compare_values)
}

/// Value 全序
///
/// - Null 小于任何非 Null 值
/// - Pair 先比第一项，再比第二项
/// - Array 逐元素比较，公共前缀相同时短者在前
/// - 浮点按 total order（NaN 最大）
pub fn compare_values(v1: &Value, v2: &Value) -> Result<Ordering> {
    use Value::*;
    let ord = match (v1, v2) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Pair(a1, b1), Pair(a2, b2)) => match compare_values(a1, a2)? {
            Ordering::Equal => compare_values(b1, b2)?,
            o => o,
        },
        (Array(a), Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let o = compare_values(x, y)?;
                if o != Ordering::Equal {
                    return Ok(o);
                }
            }
            a.len().cmp(&b.len())
        }
        (Str(a), Str(b)) => a.cmp(b),
        (Int(a), Int(b)) => a.cmp(b),
        (Long(a), Long(b)) => a.cmp(b),
        (Short(a), Short(b)) => a.cmp(b),
        (Byte(a), Byte(b)) => a.cmp(b),
        (Char(a), Char(b)) => a.cmp(b),
        (Bool(a), Bool(b)) => a.cmp(b),
        (Float(a), Float(b)) => a.total_cmp(b),
        (Double(a), Double(b)) => a.total_cmp(b),
        (Bytes(_), Bytes(_)) => {
            return Err(EngineError::Unsupported(
                "ordering is not defined for bytes".to_string(),
            ))
        }
        (a, b) => {
            return Err(EngineError::TypeMismatch(format!(
                "only values of the same type can be sorted [{} than {}]",
                a.type_name(),
                b.type_name()
            )))
        }
    };
    Ok(ord)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Value> {
        vec![
            Value::Int(-3),
            Value::Int(7),
            Value::Double(f64::NAN),
            Value::Double(-0.5),
            Value::Str("a".into()),
            Value::Str("ab".into()),
            Value::pair(Value::Int(1), Value::Str("x".into())),
            Value::pair(Value::Int(1), Value::Str("y".into())),
            Value::Array(vec![Value::Long(1), Value::Long(2)]),
            Value::Array(vec![Value::Long(1)]),
            Value::Null,
        ]
    }

    #[test]
    fn antisymmetric_for_same_typed_values() {
        let vs = samples();
        for a in &vs {
            for b in &vs {
                let (Ok(x), Ok(y)) = (compare_values(a, b), compare_values(b, a)) else {
                    continue;
                };
                assert_eq!(x, y.reverse(), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn pairs_and_arrays_order_lexicographically() {
        let p1 = Value::pair(Value::Int(1), Value::Str("x".into()));
        let p2 = Value::pair(Value::Int(1), Value::Str("y".into()));
        assert_eq!(compare_values(&p1, &p2).unwrap(), Ordering::Less);

        let short = Value::Array(vec![Value::Long(1)]);
        let long = Value::Array(vec![Value::Long(1), Value::Long(0)]);
        assert_eq!(compare_values(&short, &long).unwrap(), Ordering::Less);
    }

    #[test]
    fn null_sorts_first() {
        assert_eq!(
            compare_values(&Value::Null, &Value::Int(0)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Str("z".into()), &Value::Null).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn different_types_raise() {
        let err = compare_values(&Value::Int(1), &Value::Long(1)).unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch(_)));

        let nested = compare_values(
            &Value::pair(Value::Int(1), Value::Int(2)),
            &Value::pair(Value::Int(1), Value::Str("2".into())),
        );
        assert!(matches!(nested, Err(EngineError::TypeMismatch(_))));
    }

    #[test]
    fn bytes_are_not_orderable() {
        let err = compare_values(&Value::Bytes(vec![1]), &Value::Bytes(vec![2])).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}
