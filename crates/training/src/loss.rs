use candle_core::{DType, Tensor};
use precision::{autocast, checks};

use crate::{alignment::compute_scale_and_shift, TrainingError};

/// Scale-and-shift-invariant loss for relative depth supervision.
///
/// Each predicted map is first aligned to its target with the per-sample
/// least-squares scale and shift from [`compute_scale_and_shift`], then the
/// mean absolute error is taken over all valid pixels of the batch at once.
///
/// The whole computation runs with autocast disabled, so half precision
/// predictions are promoted to `f32` before any reduction.
#[derive(Debug, Clone, Default)]
pub struct ScaleAndShiftInvariantLoss;

impl ScaleAndShiftInvariantLoss {
    pub const NAME: &'static str = "SSILoss";

    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Computes the loss for `(batch, [1,] height, width)` inputs.
    ///
    /// `target` and `mask` are treated as constants; gradients flow to
    /// `prediction` only. A batch without a single valid pixel yields a NaN
    /// loss (the mean over zero elements); check [`LossMetrics::is_finite`]
    /// and skip such steps.
    pub fn compute(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        mask: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        let prediction = checks::squeeze_channel(prediction, "prediction")?;
        let target = checks::squeeze_channel(target, "target")?;
        let mask = checks::squeeze_channel(mask, "mask")?;
        checks::expect_same_shape(&prediction, "prediction", &target, "target")?;
        checks::expect_same_shape(&prediction, "prediction", &mask, "mask")?;

        let _full_precision = autocast::full_precision();

        let prediction = autocast::cast_for_compute(&prediction).map_err(to_runtime_error)?;
        let target = autocast::cast_for_compute(&target).map_err(to_runtime_error)?;

        let alignment = compute_scale_and_shift(&prediction, &target, &mask)?;
        let aligned = alignment.apply(&prediction)?;
        let weights = checks::mask_to_weights(&mask, aligned.dtype())?;

        let loss =
            masked_mean_absolute_error(&aligned, &target, &weights).map_err(to_runtime_error)?;
        let valid_pixels = checks::count_valid(&mask)?;

        let average_loss = loss
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        let degenerate_samples = alignment.degenerate_samples()?;
        if degenerate_samples > 0 {
            log::debug!(
                "{}: {} of {} samples had no well-conditioned alignment",
                Self::NAME,
                degenerate_samples,
                alignment.batch_size()
            );
        }

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                valid_pixels,
                total_pixels: mask.elem_count(),
                batch_size: alignment.batch_size(),
                degenerate_samples,
            },
        })
    }
}

fn masked_mean_absolute_error(
    aligned: &Tensor,
    target: &Tensor,
    weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let target = target.to_dtype(aligned.dtype())?;
    let abs_error = (aligned - &target)?.abs()?;
    let error_sum = (abs_error * weights)?.sum_all()?;
    error_sum / weights.sum_all()?
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    valid_pixels: usize,
    total_pixels: usize,
    batch_size: usize,
    degenerate_samples: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn valid_pixels(&self) -> usize {
        self.valid_pixels
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Samples that fell back to zero scale and shift.
    pub fn degenerate_samples(&self) -> usize {
        self.degenerate_samples
    }

    pub fn valid_fraction(&self) -> f32 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.valid_pixels as f32 / self.total_pixels as f32
        }
    }

    /// False when the batch had no valid pixel or the alignment diverged.
    pub fn is_finite(&self) -> bool {
        self.average_loss.is_finite()
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
