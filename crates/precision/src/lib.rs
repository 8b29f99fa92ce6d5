//! Numeric precision utilities shared by the depth training crates.
//!
//! [`policy::PrecisionPolicy`] decides which dtype a computation promotes to,
//! [`autocast`] holds the thread-local mixed precision context together with
//! the guard that overrides it for a scope, and [`checks`] validates the
//! `(batch, [1,] height, width)` layout of depth maps and masks.

use candle_core::DType;
use thiserror::Error;

pub mod autocast;
pub mod checks;
pub mod policy;

pub use autocast::{AutocastGuard, AutocastMode};
pub use policy::PrecisionPolicy;

/// Errors raised while validating tensors or configuring precision.
#[derive(Debug, Error)]
pub enum PrecisionError {
    /// The tensor rank does not follow the depth map layout.
    #[error("{label}: expected (batch, [1,] height, width), got shape {dims:?}")]
    InvalidLayout {
        label: &'static str,
        dims: Vec<usize>,
    },
    /// Two tensors that must line up pixel for pixel do not.
    #[error("{left_label} shape {left:?} does not match {right_label} shape {right:?}")]
    ShapeMismatch {
        left_label: &'static str,
        left: Vec<usize>,
        right_label: &'static str,
        right: Vec<usize>,
    },
    /// The dtype is not accepted at this point of the computation.
    #[error("{label}: unsupported dtype {dtype:?}")]
    UnsupportedDType { label: &'static str, dtype: DType },
    /// A backend failure propagated from candle.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

/// Returns true for the floating point dtypes candle can compute in.
pub fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}
