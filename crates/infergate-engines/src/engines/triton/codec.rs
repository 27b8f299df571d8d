//! Tensor encoding for the remote inference protocol

use super::proto::model_infer_request::{InferInputTensor, InferRequestedOutputTensor};
use super::proto::{InferTensorContents, ModelInferRequest, ModelInferResponse};
use infergate_core::{ElementType, Error, Payload, Result, Scalar, TensorData};
use tracing::debug;

/// Model version sent with every request
pub const MODEL_VERSION: &str = "1";

/// Most elements an output may hold per decoded value
const MAX_EXPANSION: usize = 64;

/// Elements an output may always hold, whatever its buffer size
const MAX_FILL: usize = 1 << 16;

/// Typed contents field carrying an element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentField {
    Bool,
    Int,
    Int64,
    Uint,
    Uint64,
    Fp32,
    Fp64,
}

impl ContentField {
    /// Field for `element_type`, if it can be sent
    pub fn for_element_type(element_type: ElementType) -> Option<Self> {
        match element_type {
            ElementType::Int8 | ElementType::Int32 => Some(Self::Int),
            ElementType::UInt8 | ElementType::UInt32 => Some(Self::Uint),
            ElementType::Int64 => Some(Self::Int64),
            ElementType::UInt64 => Some(Self::Uint64),
            ElementType::Bool => Some(Self::Bool),
            ElementType::Float32 => Some(Self::Fp32),
            ElementType::Float64 => Some(Self::Fp64),
            _ => None,
        }
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool_contents",
            Self::Int => "int_contents",
            Self::Int64 => "int64_contents",
            Self::Uint => "uint_contents",
            Self::Uint64 => "uint64_contents",
            Self::Fp32 => "fp32_contents",
            Self::Fp64 => "fp64_contents",
        }
    }
}

/// Build the input tensor for `data`
///
/// The element type is checked before any data is touched.
pub fn encode_input(
    name: &str,
    element_type: ElementType,
    shape: Option<&[i64]>,
    data: &Payload,
) -> Result<InferInputTensor> {
    let field = ContentField::for_element_type(element_type).ok_or_else(|| {
        Error::unsupported_type(format!(
            "cannot send {} tensors to the inference server",
            element_type
        ))
    })?;
    let datatype = element_type
        .wire_name()
        .ok_or_else(|| Error::unsupported_type(format!("{} has no wire datatype", element_type)))?;

    let tensor = data.to_tensor(element_type)?;
    let shape = match shape {
        Some(shape) => shape.to_vec(),
        None => tensor.shape().iter().map(|&dim| dim as i64).collect(),
    };

    let mut contents = InferTensorContents::default();
    match tensor {
        TensorData::Bool(a) => contents.bool_contents = a.iter().copied().collect(),
        TensorData::Int8(a) => contents.int_contents = a.iter().map(|&v| v as i32).collect(),
        TensorData::Int32(a) => contents.int_contents = a.iter().copied().collect(),
        TensorData::UInt8(a) => contents.uint_contents = a.iter().map(|&v| v as u32).collect(),
        TensorData::UInt32(a) => contents.uint_contents = a.iter().copied().collect(),
        TensorData::Int64(a) => contents.int64_contents = a.iter().copied().collect(),
        TensorData::UInt64(a) => contents.uint64_contents = a.iter().copied().collect(),
        TensorData::Float32(a) => contents.fp32_contents = a.iter().copied().collect(),
        TensorData::Float64(a) => contents.fp64_contents = a.iter().copied().collect(),
    }
    debug!("Encoded input '{}' as {} {:?} into {}", name, datatype, shape, field.field_name());

    Ok(InferInputTensor {
        name: name.to_string(),
        datatype: datatype.to_string(),
        shape,
        contents: Some(contents),
        ..Default::default()
    })
}

/// Build a single-input, single-output inference request
pub fn build_request(
    model_name: String,
    input: InferInputTensor,
    output_name: &str,
) -> ModelInferRequest {
    ModelInferRequest {
        model_name,
        model_version: MODEL_VERSION.to_string(),
        inputs: vec![input],
        outputs: vec![InferRequestedOutputTensor {
            name: output_name.to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Decode every output of a response as `element_type`
///
/// One output yields a bare array, several yield arrays in response order.
pub fn decode_response(
    response: &ModelInferResponse,
    element_type: ElementType,
) -> Result<Payload> {
    let mut arrays = Vec::with_capacity(response.outputs.len());

    for (index, output) in response.outputs.iter().enumerate() {
        let shape = output
            .shape
            .iter()
            .map(|&dim| {
                usize::try_from(dim).map_err(|_| {
                    Error::invalid_payload(format!(
                        "output '{}' has negative dimension {}",
                        output.name, dim
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let values = match (response.raw_output_contents.get(index), &output.contents) {
            (Some(raw), _) => decode_raw(raw, element_type)?,
            (None, Some(contents)) => decode_contents(contents, element_type)?,
            (None, None) => {
                return Err(Error::invalid_payload(format!(
                    "output '{}' carries no data",
                    output.name
                )))
            }
        };

        let size = element_count(&output.name, &shape, values.len())?;
        if values.len() != size {
            debug!(
                "Resizing output '{}' from {} values to shape {:?}",
                output.name,
                values.len(),
                shape
            );
        }
        arrays.push(TensorData::from_scalars(
            element_type,
            &shape,
            &resize(values, size),
        )?);
    }

    if arrays.len() == 1 {
        return Ok(Payload::Array(arrays.remove(0)));
    }
    Ok(Payload::Arrays(arrays))
}

/// Little-endian buffer of `data`'s elements
pub fn encode_raw(data: &TensorData) -> Vec<u8> {
    match data {
        TensorData::Bool(a) => a.iter().map(|&v| v as u8).collect(),
        TensorData::Int8(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::UInt8(a) => a.iter().copied().collect(),
        TensorData::Int32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::UInt32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Int64(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::UInt64(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Float32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Float64(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn decode_raw(raw: &[u8], element_type: ElementType) -> Result<Vec<Scalar>> {
    macro_rules! le {
        ($ty:ty, $wrap:expr) => {{
            const WIDTH: usize = std::mem::size_of::<$ty>();
            if raw.len() % WIDTH != 0 {
                return Err(Error::invalid_payload(format!(
                    "{} byte buffer is not a whole number of {} values",
                    raw.len(),
                    element_type
                )));
            }
            raw.chunks_exact(WIDTH)
                .map(|chunk| {
                    let mut bytes = [0u8; WIDTH];
                    bytes.copy_from_slice(chunk);
                    $wrap(<$ty>::from_le_bytes(bytes))
                })
                .collect()
        }};
    }

    Ok(match element_type {
        ElementType::Bool => raw.iter().map(|&b| Scalar::Bool(b != 0)).collect(),
        ElementType::Int8 => le!(i8, |v: i8| Scalar::Int(v as i64)),
        ElementType::UInt8 => raw.iter().map(|&b| Scalar::UInt(b as u64)).collect(),
        ElementType::Int32 => le!(i32, |v: i32| Scalar::Int(v as i64)),
        ElementType::UInt32 => le!(u32, |v: u32| Scalar::UInt(v as u64)),
        ElementType::Int64 => le!(i64, Scalar::Int),
        ElementType::UInt64 => le!(u64, Scalar::UInt),
        ElementType::Float32 => le!(f32, |v: f32| Scalar::Float(v as f64)),
        ElementType::Float64 => le!(f64, Scalar::Float),
        other => {
            return Err(Error::unsupported_type(format!(
                "cannot decode {} output buffers",
                other
            )))
        }
    })
}

fn decode_contents(
    contents: &InferTensorContents,
    element_type: ElementType,
) -> Result<Vec<Scalar>> {
    Ok(match element_type {
        ElementType::Bool => contents.bool_contents.iter().map(|&v| Scalar::Bool(v)).collect(),
        ElementType::Int8 | ElementType::Int32 => {
            contents.int_contents.iter().map(|&v| Scalar::Int(v as i64)).collect()
        }
        ElementType::UInt8 | ElementType::UInt32 => {
            contents.uint_contents.iter().map(|&v| Scalar::UInt(v as u64)).collect()
        }
        ElementType::Int64 => contents.int64_contents.iter().map(|&v| Scalar::Int(v)).collect(),
        ElementType::UInt64 => contents.uint64_contents.iter().map(|&v| Scalar::UInt(v)).collect(),
        ElementType::Float32 => {
            contents.fp32_contents.iter().map(|&v| Scalar::Float(v as f64)).collect()
        }
        ElementType::Float64 => contents.fp64_contents.iter().map(|&v| Scalar::Float(v)).collect(),
        other => {
            return Err(Error::unsupported_type(format!(
                "cannot decode {} output contents",
                other
            )))
        }
    })
}

/// Elements in `shape`, bounded by what `available` decoded values can fill
fn element_count(name: &str, shape: &[usize], available: usize) -> Result<usize> {
    let size = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| {
            Error::invalid_payload(format!("output '{}' shape {:?} overflows", name, shape))
        })?;

    let limit = available.saturating_mul(MAX_EXPANSION).max(MAX_FILL);
    if size > limit {
        return Err(Error::invalid_payload(format!(
            "output '{}' shape {:?} needs {} elements but only {} values were returned",
            name, shape, size, available
        )));
    }
    Ok(size)
}

/// Repeat or truncate `values` to exactly `len` items; no values means zeros
fn resize(values: Vec<Scalar>, len: usize) -> Vec<Scalar> {
    if values.len() == len {
        return values;
    }
    if values.is_empty() {
        return vec![Scalar::Int(0); len];
    }
    values.iter().cycle().take(len).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::triton::proto::model_infer_response::InferOutputTensor;
    use serde_json::json;

    const TABLE_TYPES: [ElementType; 9] = [
        ElementType::Bool,
        ElementType::Int8,
        ElementType::UInt8,
        ElementType::Int32,
        ElementType::UInt32,
        ElementType::Int64,
        ElementType::UInt64,
        ElementType::Float32,
        ElementType::Float64,
    ];

    fn output(name: &str, shape: &[i64]) -> InferOutputTensor {
        InferOutputTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            ..Default::default()
        }
    }

    /// What a server echoing the input back would return
    fn echo(input: &InferInputTensor, element_type: ElementType) -> ModelInferResponse {
        let contents = input.contents.as_ref().unwrap();
        let shape: Vec<usize> = input.shape.iter().map(|&d| d as usize).collect();
        let values = decode_contents(contents, element_type).unwrap();
        let tensor = TensorData::from_scalars(element_type, &shape, &values).unwrap();

        ModelInferResponse {
            outputs: vec![output("out", &input.shape)],
            raw_output_contents: vec![encode_raw(&tensor)],
            ..Default::default()
        }
    }

    #[test]
    fn test_content_field_table() {
        use ContentField::*;
        let expected = [Bool, Int, Uint, Int, Uint, Int64, Uint64, Fp32, Fp64];
        for (element_type, field) in TABLE_TYPES.iter().zip(expected) {
            assert_eq!(ContentField::for_element_type(*element_type), Some(field));
        }
        for element_type in [
            ElementType::Int16,
            ElementType::UInt16,
            ElementType::Float16,
            ElementType::Bytes,
        ] {
            assert_eq!(ContentField::for_element_type(element_type), None);
        }
    }

    #[test]
    fn test_float32_matrix_round_trip() {
        let data = Payload::Json(json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
        let input = encode_input("INPUT__0", ElementType::Float32, None, &data).unwrap();

        assert_eq!(input.datatype, "FP32");
        assert_eq!(input.shape, vec![2, 3]);
        assert_eq!(
            input.contents.as_ref().unwrap().fp32_contents,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );

        let decoded =
            decode_response(&echo(&input, ElementType::Float32), ElementType::Float32).unwrap();
        assert_eq!(decoded, Payload::Array(data.to_tensor(ElementType::Float32).unwrap()));
    }

    #[test]
    fn test_round_trip_every_table_type() {
        let data = Payload::Json(json!([[1, 0, 1], [0, 1, 1]]));
        for element_type in TABLE_TYPES {
            let original = data.to_tensor(element_type).unwrap();
            let input = encode_input("x", element_type, None, &data).unwrap();
            let decoded = decode_response(&echo(&input, element_type), element_type).unwrap();
            assert_eq!(decoded, Payload::Array(original), "{element_type}");
        }
    }

    #[test]
    fn test_configured_shape_wins() {
        let data = Payload::Json(json!([1, 2, 3, 4]));
        let input = encode_input("x", ElementType::Int64, Some(&[1, 4]), &data).unwrap();
        assert_eq!(input.shape, vec![1, 4]);
        assert_eq!(input.contents.unwrap().int64_contents, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let data = Payload::Json(json!([1, 2]));
        for element_type in [ElementType::Int16, ElementType::Float16, ElementType::Bytes] {
            assert!(matches!(
                encode_input("x", element_type, None, &data),
                Err(Error::UnsupportedType(_))
            ));
        }
    }

    #[test]
    fn test_multiple_outputs_keep_order() {
        let first = TensorData::from_json(ElementType::Int32, &json!([1, 2])).unwrap();
        let second = TensorData::from_json(ElementType::Int32, &json!([[3], [4], [5]])).unwrap();
        let response = ModelInferResponse {
            outputs: vec![output("a", &[2]), output("b", &[3, 1])],
            raw_output_contents: vec![encode_raw(&first), encode_raw(&second)],
            ..Default::default()
        };

        let decoded = decode_response(&response, ElementType::Int32).unwrap();
        assert_eq!(decoded, Payload::Arrays(vec![first, second]));
    }

    #[test]
    fn test_resize_repeats_and_truncates() {
        let raw = encode_raw(&TensorData::from_json(ElementType::Int32, &json!([1, 2])).unwrap());
        let response = ModelInferResponse {
            outputs: vec![output("a", &[2, 3])],
            raw_output_contents: vec![raw.clone()],
            ..Default::default()
        };
        let decoded = decode_response(&response, ElementType::Int32).unwrap();
        assert_eq!(decoded.to_json(), json!([[1, 2, 1], [2, 1, 2]]));

        let response = ModelInferResponse {
            outputs: vec![output("a", &[1])],
            raw_output_contents: vec![raw],
            ..Default::default()
        };
        assert_eq!(decode_response(&response, ElementType::Int32).unwrap().to_json(), json!([1]));

        let response = ModelInferResponse {
            outputs: vec![output("a", &[2])],
            raw_output_contents: vec![Vec::new()],
            ..Default::default()
        };
        let decoded = decode_response(&response, ElementType::Int32).unwrap();
        assert_eq!(decoded.to_json(), json!([0, 0]));
    }

    #[test]
    fn test_no_outputs_is_an_empty_sequence() {
        let decoded =
            decode_response(&ModelInferResponse::default(), ElementType::Float32).unwrap();
        assert_eq!(decoded, Payload::Arrays(Vec::new()));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let response = ModelInferResponse {
            outputs: vec![output("a", &[1 << 34])],
            raw_output_contents: vec![1.0f32.to_le_bytes().to_vec()],
            ..Default::default()
        };
        assert!(matches!(
            decode_response(&response, ElementType::Float32),
            Err(Error::InvalidPayload(_))
        ));

        let response = ModelInferResponse {
            outputs: vec![output("a", &[i64::MAX, i64::MAX])],
            raw_output_contents: vec![Vec::new()],
            ..Default::default()
        };
        assert!(matches!(
            decode_response(&response, ElementType::Int64),
            Err(Error::InvalidPayload(_))
        ));

        // zero fill and moderate repetition stay allowed
        let response = ModelInferResponse {
            outputs: vec![output("a", &[256, 256])],
            raw_output_contents: vec![Vec::new()],
            ..Default::default()
        };
        assert!(decode_response(&response, ElementType::UInt8).is_ok());
    }

    #[test]
    fn test_typed_contents_fallback() {
        let mut out = output("a", &[2]);
        out.contents = Some(InferTensorContents {
            fp64_contents: vec![0.25, 0.75],
            ..Default::default()
        });
        let response = ModelInferResponse {
            outputs: vec![out],
            ..Default::default()
        };
        assert_eq!(
            decode_response(&response, ElementType::Float64).unwrap().to_json(),
            json!([0.25, 0.75])
        );
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let response = ModelInferResponse {
            outputs: vec![output("a", &[1])],
            raw_output_contents: vec![vec![0, 0, 0]],
            ..Default::default()
        };
        assert!(matches!(
            decode_response(&response, ElementType::Float32),
            Err(Error::InvalidPayload(_))
        ));
    }
}
