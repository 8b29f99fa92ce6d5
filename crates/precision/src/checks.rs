//! Layout validation for depth maps and validity masks.
//!
//! Depth tensors follow the `(batch, height, width)` convention and may carry
//! a singleton channel axis, `(batch, 1, height, width)`, which is dropped
//! before any computation. Helpers return [`PrecisionError`] so call sites
//! can propagate mismatches without panicking.

use candle_core::{DType, Tensor};

use crate::{is_float, PrecisionError};

type Result<T> = std::result::Result<T, PrecisionError>;

/// Removes the optional singleton channel axis of a depth map or mask.
pub fn squeeze_channel(tensor: &Tensor, label: &'static str) -> Result<Tensor> {
    match tensor.dims() {
        [_, _, _] => Ok(tensor.clone()),
        [_, 1, _, _] => Ok(tensor.squeeze(1)?),
        dims => Err(PrecisionError::InvalidLayout {
            label,
            dims: dims.to_vec(),
        }),
    }
}

/// Ensures `tensor` is rank 3, the layout the alignment solve works on.
pub fn expect_batch_height_width(tensor: &Tensor, label: &'static str) -> Result<()> {
    if tensor.rank() == 3 {
        Ok(())
    } else {
        Err(PrecisionError::InvalidLayout {
            label,
            dims: tensor.dims().to_vec(),
        })
    }
}

/// Ensures two tensors have identical dimensions.
pub fn expect_same_shape(
    left: &Tensor,
    left_label: &'static str,
    right: &Tensor,
    right_label: &'static str,
) -> Result<()> {
    if left.dims() == right.dims() {
        Ok(())
    } else {
        Err(PrecisionError::ShapeMismatch {
            left_label,
            left: left.dims().to_vec(),
            right_label,
            right: right.dims().to_vec(),
        })
    }
}

/// Ensures a tensor holds floating point values.
pub fn expect_float(tensor: &Tensor, label: &'static str) -> Result<()> {
    let dtype = tensor.dtype();
    if is_float(dtype) {
        Ok(())
    } else {
        Err(PrecisionError::UnsupportedDType { label, dtype })
    }
}

/// Converts a validity mask into `0.0`/`1.0` values of `dtype`.
///
/// Any non-zero entry marks a valid pixel, so `u8` booleans, integer labels
/// and float masks are all accepted.
pub fn mask_to_weights(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let valid = match mask.dtype() {
        DType::U8 | DType::U32 | DType::I64 => mask.ne(0u32)?,
        other if is_float(other) => mask.ne(0f64)?,
        other => {
            return Err(PrecisionError::UnsupportedDType {
                label: "mask",
                dtype: other,
            })
        }
    };
    Ok(valid.to_dtype(dtype)?)
}

/// Counts the valid pixels of a mask with an integer reduction, so the count
/// stays exact past the 2^24 limit of an `f32` sum.
pub fn count_valid(mask: &Tensor) -> Result<usize> {
    let count = mask_to_weights(mask, DType::U32)?
        .sum_all()?
        .to_vec0::<u32>()?;
    Ok(count as usize)
}
