//! Monocular depth training utilities built on candle.
//!
//! * [`training::ScaleAndShiftInvariantLoss`] aligns each predicted depth map
//!   to its target with a masked least-squares scale and shift before taking
//!   the pooled masked L1 error.
//! * [`training::IterExponential`] maps an absolute iteration to a learning
//!   rate multiplier (linear warmup, then exponential decay).
//! * [`precision`] provides the autocast guard the loss uses to force full
//!   precision while solving.

pub use depth_training as training;
pub use depth_training::*;
pub use precision;

use candle_core::{Device, Tensor};

/// Convenience wrapper computing the loss value for host-side buffers.
///
/// `prediction`, `target` and `mask` are row-major `(batch, height, width)`
/// buffers; non-zero mask bytes mark valid pixels.
pub fn ssi_loss_from_slices(
    prediction: &[f32],
    target: &[f32],
    mask: &[u8],
    shape: (usize, usize, usize),
) -> Result<f32, TrainingError> {
    let device = Device::Cpu;
    let to_shape_error = |err: candle_core::Error| TrainingError::shape(err.to_string());
    let prediction = Tensor::from_slice(prediction, shape, &device).map_err(to_shape_error)?;
    let target = Tensor::from_slice(target, shape, &device).map_err(to_shape_error)?;
    let mask = Tensor::from_slice(mask, shape, &device).map_err(to_shape_error)?;
    let output = ScaleAndShiftInvariantLoss::new().compute(&prediction, &target, &mask)?;
    Ok(output.metrics.average_loss())
}
