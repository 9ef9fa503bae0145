//! Runtime-typed tensors exchanged with inference sessions
//!
//! A [`Tensor`] wraps an `ndarray::ArrayD` of one of the element types the
//! exported graphs use, plus a [`Location`] tag. Device-resident tensors must
//! be handed back to the session that produced them (see
//! [`InferenceSession::release`](crate::session::InferenceSession::release)).

use crate::error::{GenerationError, Result};
use half::f16;
use ndarray::{concatenate, ArrayD, ArrayView2, Axis, Ix2, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Named tensors fed to or returned from a session
pub type NamedTensors = HashMap<String, Tensor>;

/// Element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    Int64,
    Int32,
    Int8,
    Uint8,
    Bool,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// Where the tensor's buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Host,
    Device,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(ArrayD<f32>),
    Float16(ArrayD<f16>),
    Int64(ArrayD<i64>),
    Int32(ArrayD<i32>),
    Int8(ArrayD<i8>),
    Uint8(ArrayD<u8>),
    Bool(ArrayD<bool>),
}

/// Applies `$body` to the array inside any variant.
macro_rules! with_array {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            TensorData::Float32($arr) => $body,
            TensorData::Float16($arr) => $body,
            TensorData::Int64($arr) => $body,
            TensorData::Int32($arr) => $body,
            TensorData::Int8($arr) => $body,
            TensorData::Uint8($arr) => $body,
            TensorData::Bool($arr) => $body,
        }
    };
}

/// Like `with_array!`, but re-wraps the result in the same variant.
macro_rules! map_array {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            TensorData::Float32($arr) => TensorData::Float32($body),
            TensorData::Float16($arr) => TensorData::Float16($body),
            TensorData::Int64($arr) => TensorData::Int64($body),
            TensorData::Int32($arr) => TensorData::Int32($body),
            TensorData::Int8($arr) => TensorData::Int8($body),
            TensorData::Uint8($arr) => TensorData::Uint8($body),
            TensorData::Bool($arr) => TensorData::Bool($body),
        }
    };
}

/// Rust element types that map onto a [`DataType`]
pub trait Element: Clone + Send + Sync + 'static {
    const DTYPE: DataType;

    fn zero() -> Self;
    fn one() -> Self;
    fn wrap(array: ArrayD<Self>) -> TensorData;
    fn view(data: &TensorData) -> Option<&ArrayD<Self>>;
    fn view_mut(data: &mut TensorData) -> Option<&mut ArrayD<Self>>;
    fn unwrap(data: TensorData) -> std::result::Result<ArrayD<Self>, TensorData>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $zero:expr, $one:expr) => {
        impl Element for $ty {
            const DTYPE: DataType = DataType::$variant;

            fn zero() -> Self {
                $zero
            }

            fn one() -> Self {
                $one
            }

            fn wrap(array: ArrayD<Self>) -> TensorData {
                TensorData::$variant(array)
            }

            fn view(data: &TensorData) -> Option<&ArrayD<Self>> {
                match data {
                    TensorData::$variant(array) => Some(array),
                    _ => None,
                }
            }

            fn view_mut(data: &mut TensorData) -> Option<&mut ArrayD<Self>> {
                match data {
                    TensorData::$variant(array) => Some(array),
                    _ => None,
                }
            }

            fn unwrap(data: TensorData) -> std::result::Result<ArrayD<Self>, TensorData> {
                match data {
                    TensorData::$variant(array) => Ok(array),
                    other => Err(other),
                }
            }
        }
    };
}

impl_element!(f32, Float32, 0.0, 1.0);
impl_element!(f16, Float16, f16::ZERO, f16::ONE);
impl_element!(i64, Int64, 0, 1);
impl_element!(i32, Int32, 0, 1);
impl_element!(i8, Int8, 0, 1);
impl_element!(u8, Uint8, 0, 1);
impl_element!(bool, Bool, false, true);

/// Opaque n-dimensional tensor with a runtime element type
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    location: Location,
}

impl Tensor {
    pub fn new(data: TensorData) -> Self {
        Self {
            data,
            location: Location::Host,
        }
    }

    pub fn from_array<T: Element>(array: ArrayD<T>) -> Self {
        Self::new(T::wrap(array))
    }

    pub fn from_shape_vec<T: Element>(shape: &[usize], values: Vec<T>) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::from_array(array))
    }

    /// Builds a `[rows, len]` int64 tensor. Rows must share one length.
    pub fn from_rows(rows: &[Vec<i64>]) -> Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != width) {
            return Err(GenerationError::RaggedBatch {
                lengths: rows.iter().map(Vec::len).collect(),
            });
        }
        let flat: Vec<i64> = rows.iter().flatten().copied().collect();
        Self::from_shape_vec(&[rows.len(), width], flat)
    }

    pub fn full<T: Element>(shape: &[usize], value: T) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    pub fn zeros(dtype: DataType, shape: &[usize]) -> Self {
        match dtype {
            DataType::Float32 => Self::full(shape, f32::zero()),
            DataType::Float16 => Self::full(shape, f16::zero()),
            DataType::Int64 => Self::full(shape, i64::zero()),
            DataType::Int32 => Self::full(shape, i32::zero()),
            DataType::Int8 => Self::full(shape, i8::zero()),
            DataType::Uint8 => Self::full(shape, u8::zero()),
            DataType::Bool => Self::full(shape, bool::zero()),
        }
    }

    pub fn ones(dtype: DataType, shape: &[usize]) -> Self {
        match dtype {
            DataType::Float32 => Self::full(shape, f32::one()),
            DataType::Float16 => Self::full(shape, f16::one()),
            DataType::Int64 => Self::full(shape, i64::one()),
            DataType::Int32 => Self::full(shape, i32::one()),
            DataType::Int8 => Self::full(shape, i8::one()),
            DataType::Uint8 => Self::full(shape, u8::one()),
            DataType::Bool => Self::full(shape, bool::one()),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.dtype(), self.dims())
    }

    pub fn ones_like(&self) -> Self {
        Self::ones(self.dtype(), self.dims())
    }

    /// Single-element boolean tensor of shape `[1]`
    pub fn scalar_bool(value: bool) -> Self {
        Self::full(&[1], value)
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn dtype(&self) -> DataType {
        match &self.data {
            TensorData::Float32(_) => DataType::Float32,
            TensorData::Float16(_) => DataType::Float16,
            TensorData::Int64(_) => DataType::Int64,
            TensorData::Int32(_) => DataType::Int32,
            TensorData::Int8(_) => DataType::Int8,
            TensorData::Uint8(_) => DataType::Uint8,
            TensorData::Bool(_) => DataType::Bool,
        }
    }

    pub fn dims(&self) -> &[usize] {
        with_array!(&self.data, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.dims().len()
    }

    /// Size of dimension `axis`; negative values count from the end.
    pub fn dim(&self, axis: isize) -> Result<usize> {
        let dims = self.dims();
        let index = if axis < 0 {
            dims.len() as isize + axis
        } else {
            axis
        };
        usize::try_from(index)
            .ok()
            .and_then(|i| dims.get(i).copied())
            .ok_or_else(|| {
                GenerationError::ShapeMismatch(format!(
                    "axis {} out of range for shape {:?}",
                    axis, dims
                ))
            })
    }

    pub fn len(&self) -> usize {
        with_array!(&self.data, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn is_device(&self) -> bool {
        self.location == Location::Device
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn as_array<T: Element>(&self) -> Result<&ArrayD<T>> {
        T::view(&self.data).ok_or(GenerationError::DataType {
            expected: T::DTYPE,
            actual: self.dtype(),
        })
    }

    pub fn as_array_mut<T: Element>(&mut self) -> Result<&mut ArrayD<T>> {
        let actual = self.dtype();
        T::view_mut(&mut self.data).ok_or(GenerationError::DataType {
            expected: T::DTYPE,
            actual,
        })
    }

    pub fn into_array<T: Element>(self) -> Result<ArrayD<T>> {
        let actual = self.dtype();
        T::unwrap(self.data).map_err(|_| GenerationError::DataType {
            expected: T::DTYPE,
            actual,
        })
    }

    /// Reads a 2-D integer tensor (ids, masks) as one `Vec` per row.
    pub fn to_rows_i64(&self) -> Result<Vec<Vec<i64>>> {
        if self.ndim() != 2 {
            return Err(GenerationError::ShapeMismatch(format!(
                "expected a 2-D tensor, got shape {:?}",
                self.dims()
            )));
        }
        let rows = match &self.data {
            TensorData::Int64(a) => a
                .outer_iter()
                .map(|r| r.iter().copied().collect())
                .collect(),
            TensorData::Int32(a) => a
                .outer_iter()
                .map(|r| r.iter().map(|&v| v as i64).collect())
                .collect(),
            TensorData::Bool(a) => a
                .outer_iter()
                .map(|r| r.iter().map(|&v| v as i64).collect())
                .collect(),
            _ => {
                return Err(GenerationError::DataType {
                    expected: DataType::Int64,
                    actual: self.dtype(),
                })
            }
        };
        Ok(rows)
    }

    /// Copies floating point data to full precision.
    pub fn to_f32(&self) -> Result<ArrayD<f32>> {
        match &self.data {
            TensorData::Float32(a) => Ok(a.clone()),
            TensorData::Float16(a) => Ok(a.mapv(f32::from)),
            _ => Err(GenerationError::DataType {
                expected: DataType::Float32,
                actual: self.dtype(),
            }),
        }
    }

    /// Concatenates tensors of one element type along `axis`.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| {
            GenerationError::InvalidInput("cannot concatenate an empty tensor list".to_string())
        })?;
        let data = match &first.data {
            TensorData::Float32(_) => TensorData::Float32(concat_arrays::<f32>(tensors, axis)?),
            TensorData::Float16(_) => TensorData::Float16(concat_arrays::<f16>(tensors, axis)?),
            TensorData::Int64(_) => TensorData::Int64(concat_arrays::<i64>(tensors, axis)?),
            TensorData::Int32(_) => TensorData::Int32(concat_arrays::<i32>(tensors, axis)?),
            TensorData::Int8(_) => TensorData::Int8(concat_arrays::<i8>(tensors, axis)?),
            TensorData::Uint8(_) => TensorData::Uint8(concat_arrays::<u8>(tensors, axis)?),
            TensorData::Bool(_) => TensorData::Bool(concat_arrays::<bool>(tensors, axis)?),
        };
        Ok(Tensor::new(data))
    }

    /// Replicates the tensor `times` along the batch axis.
    pub fn repeat_batch(&self, times: usize) -> Result<Tensor> {
        let copies: Vec<&Tensor> = std::iter::repeat(self).take(times).collect();
        Tensor::concat(&copies, 0)
    }

    /// Keeps the elements from `start` onward along `axis`.
    pub fn slice_from(&self, axis: usize, start: usize) -> Result<Tensor> {
        if axis >= self.ndim() {
            return Err(GenerationError::ShapeMismatch(format!(
                "axis {} out of range for shape {:?}",
                axis,
                self.dims()
            )));
        }
        let start = start.min(self.dims()[axis]);
        let data = map_array!(&self.data, a => a.slice_axis(Axis(axis), Slice::from(start..)).to_owned());
        Ok(Tensor::new(data))
    }

    /// Keeps the last `count` elements along `axis`.
    pub fn slice_last(&self, axis: usize, count: usize) -> Result<Tensor> {
        let size = self.dim(axis as isize)?;
        self.slice_from(axis, size.saturating_sub(count))
    }

    /// Logits at the final sequence position, upcast to f32: `[batch, vocab]`.
    pub fn last_position_logits(&self) -> Result<ndarray::Array2<f32>> {
        let logits = self.to_f32()?;
        match logits.ndim() {
            2 => Ok(logits.into_dimensionality::<Ix2>()?),
            3 => {
                let seq_len = logits.shape()[1];
                if seq_len == 0 {
                    return Err(GenerationError::ShapeMismatch(
                        "logits have an empty sequence dimension".to_string(),
                    ));
                }
                let last = logits.index_axis(Axis(1), seq_len - 1).to_owned();
                Ok(last.into_dimensionality::<Ix2>()?)
            }
            _ => Err(GenerationError::ShapeMismatch(format!(
                "expected logits of rank 2 or 3, got shape {:?}",
                logits.shape()
            ))),
        }
    }

    /// 2-D f32 view, for feature rows such as `[tokens, hidden]`.
    pub fn view_2d_f32(&self) -> Result<ArrayView2<'_, f32>> {
        Ok(self.as_array::<f32>()?.view().into_dimensionality::<Ix2>()?)
    }
}

fn concat_arrays<T: Element>(tensors: &[&Tensor], axis: usize) -> Result<ArrayD<T>> {
    let views = tensors
        .iter()
        .map(|t| t.as_array::<T>().map(|a| a.view()))
        .collect::<Result<Vec<_>>>()?;
    Ok(concatenate(Axis(axis), &views)?)
}
