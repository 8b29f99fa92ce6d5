//! Dtype promotion policy for depth alignment and loss computations.
//!
//! Depth maps frequently arrive in `f16`/`bf16` when the network runs under
//! mixed precision. Sums over every pixel of a batch lose too much precision
//! in a half type, so reductions are always promoted to at least `f32`.
//! `f64` inputs are kept in `f64` end to end.

use candle_core::{DType, Result, Tensor};

/// Dtypes an input of a given storage dtype is promoted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Half types compute and reduce in `f32`; `f64` stays `f64`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self { compute, reduction }
    }

    /// Policy of the alignment solve: elementwise work at reduction width too.
    pub fn full_precision(storage: DType) -> Self {
        let reduction = Self::from_parameter_dtype(storage).reduction;
        Self {
            compute: reduction,
            reduction,
        }
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_compute(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }
}

pub(crate) fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
