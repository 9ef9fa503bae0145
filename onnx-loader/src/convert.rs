//! Conversion between generation tensors and `ort` values

use crate::error::{OnnxError, Result};
use half::f16;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor as OrtTensor, ValueType};
use ortgen_generation::tensor::TensorData;
use ortgen_generation::{DataType, Tensor};

/// Copies a tensor into an owned `ort` value.
pub fn to_value(tensor: &Tensor) -> Result<DynValue> {
    macro_rules! owned {
        ($array:expr) => {
            OrtTensor::from_array($array.as_standard_layout().into_owned())
                .map(|value| value.into_dyn())
                .map_err(|e| {
                    OnnxError::InvalidInput(format!(
                        "Failed to create {} tensor {:?}: {}",
                        tensor.dtype(),
                        tensor.dims(),
                        e
                    ))
                })
        };
    }

    match tensor.data() {
        TensorData::Float32(a) => owned!(a),
        TensorData::Float16(a) => owned!(a),
        TensorData::Int64(a) => owned!(a),
        TensorData::Int32(a) => owned!(a),
        TensorData::Int8(a) => owned!(a),
        TensorData::Uint8(a) => owned!(a),
        TensorData::Bool(a) => owned!(a),
    }
}

/// Element type of an `ort` tensor type, when the generation core handles it.
pub fn data_type(ty: TensorElementType) -> Option<DataType> {
    match ty {
        TensorElementType::Float32 => Some(DataType::Float32),
        TensorElementType::Float16 => Some(DataType::Float16),
        TensorElementType::Int64 => Some(DataType::Int64),
        TensorElementType::Int32 => Some(DataType::Int32),
        TensorElementType::Int8 => Some(DataType::Int8),
        TensorElementType::Uint8 => Some(DataType::Uint8),
        TensorElementType::Bool => Some(DataType::Bool),
        _ => None,
    }
}

/// Copies an output value back to host memory.
pub fn from_value(name: &str, value: &DynValue) -> Result<Tensor> {
    let ty = match value.dtype().clone() {
        ValueType::Tensor { ty, .. } => ty,
        other => {
            return Err(OnnxError::UnsupportedType(format!(
                "output {} is not a tensor ({:?})",
                name, other
            )))
        }
    };
    let dtype = data_type(ty).ok_or_else(|| {
        OnnxError::UnsupportedType(format!("output {} has element type {:?}", name, ty))
    })?;

    macro_rules! extract {
        ($t:ty) => {{
            let (shape, data) = value.try_extract_tensor::<$t>().map_err(|e| {
                OnnxError::InferenceFailed(format!("Failed to extract {}: {}", name, e))
            })?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            Tensor::from_shape_vec(&dims, data.to_vec())?
        }};
    }

    let tensor = match dtype {
        DataType::Float32 => extract!(f32),
        DataType::Float16 => extract!(f16),
        DataType::Int64 => extract!(i64),
        DataType::Int32 => extract!(i32),
        DataType::Int8 => extract!(i8),
        DataType::Uint8 => extract!(u8),
        DataType::Bool => extract!(bool),
    };
    Ok(tensor)
}
