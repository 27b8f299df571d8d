//! Element types, typed arrays, and the payload exchanged between pipeline stages

use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    Bytes,
    Complex64,
    Complex128,
}

impl ElementType {
    /// Canonical lowercase name, as written in endpoint configuration
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Bytes => "bytes",
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
        }
    }

    /// Datatype string used on the inference wire protocol
    pub fn wire_name(&self) -> Option<&'static str> {
        Some(match self {
            Self::Bool => "BOOL",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::UInt8 => "UINT8",
            Self::UInt16 => "UINT16",
            Self::UInt32 => "UINT32",
            Self::UInt64 => "UINT64",
            Self::Float16 => "FP16",
            Self::Float32 => "FP32",
            Self::Float64 => "FP64",
            Self::Bytes => "BYTES",
            Self::Complex64 | Self::Complex128 => return None,
        })
    }

    /// Size of one element in a raw little-endian buffer
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 | Self::Float16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Complex64 => Some(8),
            Self::Complex128 => Some(16),
            Self::Bytes => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized.trim_start_matches("np.").trim_start_matches("numpy.");
        Ok(match normalized {
            "bool" | "bool_" | "boolean" => Self::Bool,
            "int8" => Self::Int8,
            "int16" => Self::Int16,
            "int" | "int32" | "intc" => Self::Int32,
            "int64" | "long" => Self::Int64,
            "uint8" => Self::UInt8,
            "uint16" => Self::UInt16,
            "uint" | "uint32" | "uintc" => Self::UInt32,
            "uint64" | "ulong" => Self::UInt64,
            "float16" | "fp16" | "half" => Self::Float16,
            "float32" | "fp32" | "single" => Self::Float32,
            "float" | "float64" | "fp64" | "double" => Self::Float64,
            "bytes" | "str" | "string" | "object" => Self::Bytes,
            "complex64" => Self::Complex64,
            "complex" | "complex128" => Self::Complex128,
            _ => {
                return Err(Error::unsupported_type(format!(
                    "unknown element type '{}'",
                    s
                )))
            }
        })
    }
}

impl Serialize for ElementType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ElementType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A single numeric value prior to coercion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::UInt(u) => u != 0,
            Self::Float(f) => f != 0.0,
        }
    }

    /// Integer conversions wrap, float conversions truncate toward zero
    pub fn as_i64(&self) -> i64 {
        match *self {
            Self::Bool(b) => b as i64,
            Self::Int(i) => i,
            Self::UInt(u) => u as i64,
            Self::Float(f) => f as i64,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match *self {
            Self::Bool(b) => b as u64,
            Self::Int(i) => i as u64,
            Self::UInt(u) => u,
            Self::Float(f) => f as u64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => b as u8 as f64,
            Self::Int(i) => i as f64,
            Self::UInt(u) => u as f64,
            Self::Float(f) => f,
        }
    }

    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(Self::UInt(u))
                } else {
                    Ok(Self::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            // missing values
            Value::Null => Ok(Self::Float(f64::NAN)),
            other => Err(Error::invalid_payload(format!(
                "expected a number or boolean, found {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Flatten a (possibly nested) JSON array into row-major scalars and its shape
pub fn flatten_json(value: &Value) -> Result<(Vec<usize>, Vec<Scalar>)> {
    let mut values = Vec::new();
    let shape = flatten_into(value, &mut values)?;
    Ok((shape, values))
}

fn flatten_into(value: &Value, out: &mut Vec<Scalar>) -> Result<Vec<usize>> {
    let Value::Array(items) = value else {
        out.push(Scalar::from_json(value)?);
        return Ok(Vec::new());
    };

    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let shape = flatten_into(item, out)?;
        match &inner {
            None => inner = Some(shape),
            Some(expected) if *expected != shape => {
                return Err(Error::invalid_payload(format!(
                    "ragged array: expected inner shape {:?}, found {:?}",
                    expected, shape
                )));
            }
            Some(_) => {}
        }
    }

    let mut shape = vec![items.len()];
    shape.extend(inner.unwrap_or_default());
    Ok(shape)
}

/// A shaped array of one of the numeric element types the codec can carry
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(ArrayD<bool>),
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    UInt64(ArrayD<u64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

macro_rules! each_array {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            TensorData::Bool($arr) => $body,
            TensorData::Int8($arr) => $body,
            TensorData::UInt8($arr) => $body,
            TensorData::Int32($arr) => $body,
            TensorData::UInt32($arr) => $body,
            TensorData::Int64($arr) => $body,
            TensorData::UInt64($arr) => $body,
            TensorData::Float32($arr) => $body,
            TensorData::Float64($arr) => $body,
        }
    };
}

fn build<T>(
    shape: &[usize],
    values: &[Scalar],
    convert: impl Fn(&Scalar) -> T,
) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(shape), values.iter().map(convert).collect()).map_err(|e| {
        Error::invalid_payload(format!(
            "cannot shape {} values as {:?}: {}",
            values.len(),
            shape,
            e
        ))
    })
}

impl TensorData {
    /// Build an array of `element_type` from row-major scalars
    pub fn from_scalars(
        element_type: ElementType,
        shape: &[usize],
        values: &[Scalar],
    ) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(Error::invalid_payload(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }

        Ok(match element_type {
            ElementType::Bool => Self::Bool(build(shape, values, Scalar::as_bool)?),
            ElementType::Int8 => Self::Int8(build(shape, values, |s| s.as_i64() as i8)?),
            ElementType::UInt8 => Self::UInt8(build(shape, values, |s| s.as_u64() as u8)?),
            ElementType::Int32 => Self::Int32(build(shape, values, |s| s.as_i64() as i32)?),
            ElementType::UInt32 => Self::UInt32(build(shape, values, |s| s.as_u64() as u32)?),
            ElementType::Int64 => Self::Int64(build(shape, values, Scalar::as_i64)?),
            ElementType::UInt64 => Self::UInt64(build(shape, values, Scalar::as_u64)?),
            ElementType::Float32 => Self::Float32(build(shape, values, |s| s.as_f64() as f32)?),
            ElementType::Float64 => Self::Float64(build(shape, values, Scalar::as_f64)?),
            other => {
                return Err(Error::unsupported_type(format!(
                    "{} arrays are not supported",
                    other
                )))
            }
        })
    }

    /// Coerce a nested JSON array into an array of `element_type`
    pub fn from_json(element_type: ElementType, value: &Value) -> Result<Self> {
        let (shape, values) = flatten_json(value)?;
        Self::from_scalars(element_type, &shape, &values)
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Bool(_) => ElementType::Bool,
            Self::Int8(_) => ElementType::Int8,
            Self::UInt8(_) => ElementType::UInt8,
            Self::Int32(_) => ElementType::Int32,
            Self::UInt32(_) => ElementType::UInt32,
            Self::Int64(_) => ElementType::Int64,
            Self::UInt64(_) => ElementType::UInt64,
            Self::Float32(_) => ElementType::Float32,
            Self::Float64(_) => ElementType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_array!(self, arr => arr.shape())
    }

    pub fn len(&self) -> usize {
        each_array!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major scalars
    pub fn scalars(&self) -> Vec<Scalar> {
        match self {
            Self::Bool(a) => a.iter().map(|&v| Scalar::Bool(v)).collect(),
            Self::Int8(a) => a.iter().map(|&v| Scalar::Int(v as i64)).collect(),
            Self::UInt8(a) => a.iter().map(|&v| Scalar::UInt(v as u64)).collect(),
            Self::Int32(a) => a.iter().map(|&v| Scalar::Int(v as i64)).collect(),
            Self::UInt32(a) => a.iter().map(|&v| Scalar::UInt(v as u64)).collect(),
            Self::Int64(a) => a.iter().map(|&v| Scalar::Int(v)).collect(),
            Self::UInt64(a) => a.iter().map(|&v| Scalar::UInt(v)).collect(),
            Self::Float32(a) => a.iter().map(|&v| Scalar::Float(v as f64)).collect(),
            Self::Float64(a) => a.iter().map(|&v| Scalar::Float(v)).collect(),
        }
    }

    /// Convert to another element type, keeping the shape
    pub fn cast(&self, element_type: ElementType) -> Result<Self> {
        if element_type == self.element_type() {
            return Ok(self.clone());
        }
        Self::from_scalars(element_type, self.shape(), &self.scalars())
    }

    /// Nested JSON arrays in row-major order
    pub fn to_json(&self) -> Value {
        let flat: Vec<Value> = self
            .scalars()
            .into_iter()
            .map(|s| match s {
                Scalar::Bool(b) => Value::Bool(b),
                Scalar::Int(i) => Value::from(i),
                Scalar::UInt(u) => Value::from(u),
                Scalar::Float(f) => Value::from(f),
            })
            .collect();
        nest(&flat, self.shape())
    }
}

fn nest(flat: &[Value], shape: &[usize]) -> Value {
    match shape.split_first() {
        None => flat.first().cloned().unwrap_or(Value::Null),
        Some((&len, rest)) => {
            let stride: usize = rest.iter().product();
            Value::Array(
                (0..len)
                    .map(|i| nest(&flat[i * stride..(i + 1) * stride], rest))
                    .collect(),
            )
        }
    }
}

/// Data flowing between the preprocess, process and postprocess stages
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// No data
    #[default]
    Empty,
    /// Generic JSON as received from, or returned to, the HTTP front-end
    Json(Value),
    /// A single typed array
    Array(TensorData),
    /// Several typed arrays, in backend output order
    Arrays(Vec<TensorData>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// JSON rendering; arrays become nested lists
    pub fn to_json(&self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::Json(value) => value.clone(),
            Self::Array(data) => data.to_json(),
            Self::Arrays(items) => Value::Array(items.iter().map(TensorData::to_json).collect()),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            Self::Json(value) => value,
            other => other.to_json(),
        }
    }

    /// Coerce into a single array of `element_type`
    pub fn to_tensor(&self, element_type: ElementType) -> Result<TensorData> {
        match self {
            Self::Json(value) => TensorData::from_json(element_type, value),
            Self::Array(data) => data.cast(element_type),
            Self::Arrays(items) if items.len() == 1 => items[0].cast(element_type),
            Self::Arrays(items) => Err(Error::invalid_payload(format!(
                "expected a single array, found {}",
                items.len()
            ))),
            Self::Empty => Err(Error::invalid_payload("no data to convert")),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<TensorData> for Payload {
    fn from(data: TensorData) -> Self {
        Self::Array(data)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::Json(Value::deserialize(deserializer)?))
    }
}
