//! Masked least-squares alignment of predicted depth to target depth.
//!
//! For every sample the solver fits `target ≈ scale · prediction + shift`
//! over the pixels selected by the validity mask by solving the 2×2 normal
//! equations
//!
//! ```text
//! | a00 a01 | |scale|   |b0|      a00 = Σ m·p²   a01 = Σ m·p   a11 = Σ m
//! | a01 a11 | |shift| = |b1|      b0  = Σ m·p·t  b1  = Σ m·t
//! ```
//!
//! in closed form. Samples whose system is not positive definite
//! (`a00·a11 − a01² <= 0`, e.g. an empty mask or a prediction that is constant
//! over the mask) receive `scale = shift = 0`.

use candle_core::{DType, Tensor};
use precision::{checks, PrecisionPolicy};

use crate::TrainingError;

/// Per-sample affine parameters produced by [`compute_scale_and_shift`].
#[derive(Debug, Clone)]
pub struct Alignment {
    scale: Tensor,
    shift: Tensor,
    /// `u8` flag per sample, 1 where the normal equations were solvable.
    solvable: Tensor,
}

impl Alignment {
    /// Rank-1 tensor of length `batch`.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Rank-1 tensor of length `batch`.
    pub fn shift(&self) -> &Tensor {
        &self.shift
    }

    pub fn batch_size(&self) -> usize {
        self.scale.elem_count()
    }

    /// Applies `scale · prediction + shift` sample by sample.
    pub fn apply(&self, prediction: &Tensor) -> Result<Tensor, TrainingError> {
        checks::expect_batch_height_width(prediction, "prediction")?;
        let batch = prediction.dims()[0];
        if batch != self.batch_size() {
            return Err(TrainingError::shape(format!(
                "alignment holds {} samples but prediction batch is {}",
                self.batch_size(),
                batch
            )));
        }
        broadcast_affine(prediction, &self.scale, &self.shift).map_err(to_runtime_error)
    }

    /// Number of samples whose system had `det <= 0` and fell back to the
    /// zero solution. A solvable fit that happens to be zero is not counted.
    pub fn degenerate_samples(&self) -> Result<usize, TrainingError> {
        let solvable = self
            .solvable
            .to_dtype(DType::U32)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_vec0::<u32>())
            .map_err(to_runtime_error)?;
        Ok(self.batch_size() - solvable as usize)
    }

    /// Copies scale and shift to the host as `f32`.
    pub fn to_vecs(&self) -> Result<(Vec<f32>, Vec<f32>), TrainingError> {
        let scale = self
            .scale
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        let shift = self
            .shift
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        Ok((scale, shift))
    }
}

/// Computes per-sample scale and shift aligning `prediction` to `target`.
///
/// `prediction` and `target` are `(batch, height, width)` float tensors and
/// `mask` has the same shape; any non-zero mask entry marks a valid pixel.
/// Sums and the solve run in at least `f32` whatever the input dtype, and the
/// returned tensors carry that dtype. The computation stays on the candle
/// graph, so gradients reach `prediction` when it is a variable.
pub fn compute_scale_and_shift(
    prediction: &Tensor,
    target: &Tensor,
    mask: &Tensor,
) -> Result<Alignment, TrainingError> {
    checks::expect_batch_height_width(prediction, "prediction")?;
    checks::expect_same_shape(prediction, "prediction", target, "target")?;
    checks::expect_same_shape(prediction, "prediction", mask, "mask")?;
    checks::expect_float(prediction, "prediction")?;
    checks::expect_float(target, "target")?;

    log::trace!(
        "alignment inputs: mask {:?} prediction {:?} target {:?}",
        mask.dims(),
        prediction.dims(),
        target.dims()
    );

    let policy = PrecisionPolicy::full_precision(prediction.dtype());
    let weights = checks::mask_to_weights(mask, policy.reduction())?;
    let (scale, shift, solvable) =
        solve_normal_equations(prediction, target, &weights, &policy).map_err(to_runtime_error)?;

    Ok(Alignment {
        scale,
        shift,
        solvable,
    })
}

fn solve_normal_equations(
    prediction: &Tensor,
    target: &Tensor,
    weights: &Tensor,
    policy: &PrecisionPolicy,
) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
    let prediction = policy.cast_for_reduction(prediction)?;
    let target = policy.cast_for_reduction(target)?;

    let weighted_prediction = (weights * &prediction)?;
    let a_00 = (&weighted_prediction * &prediction)?.sum((1, 2))?;
    let a_01 = weighted_prediction.sum((1, 2))?;
    let a_11 = weights.sum((1, 2))?;
    let b_0 = (&weighted_prediction * &target)?.sum((1, 2))?;
    let b_1 = (weights * &target)?.sum((1, 2))?;

    let det = ((&a_00 * &a_11)? - a_01.sqr()?)?;
    let valid = det.gt(0f64)?;

    // Invalid samples divide by one so neither the values nor the gradients of
    // the discarded branch ever hold inf/NaN.
    let safe_det = valid.where_cond(&det, &det.ones_like()?)?;
    let zeros = det.zeros_like()?;

    let scale_num = ((&a_11 * &b_0)? - (&a_01 * &b_1)?)?;
    let shift_num = ((&a_00 * &b_1)? - (&a_01 * &b_0)?)?;
    let scale = valid.where_cond(&(scale_num / &safe_det)?, &zeros)?;
    let shift = valid.where_cond(&(shift_num / &safe_det)?, &zeros)?;

    Ok((scale, shift, valid))
}

fn broadcast_affine(
    prediction: &Tensor,
    scale: &Tensor,
    shift: &Tensor,
) -> candle_core::Result<Tensor> {
    let batch = scale.elem_count();
    let prediction = if prediction.dtype() == scale.dtype() {
        prediction.clone()
    } else {
        prediction.to_dtype(scale.dtype())?
    };
    let scale = scale.reshape((batch, 1, 1))?;
    let shift = shift.reshape((batch, 1, 1))?;
    prediction.broadcast_mul(&scale)?.broadcast_add(&shift)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn assert_close(actual: f32, expected: f32, tol: f32) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}"
        );
    }

    fn full_mask(shape: (usize, usize, usize)) -> Tensor {
        Tensor::ones(shape, DType::U8, &Device::Cpu).unwrap()
    }

    #[test]
    fn recovers_affine_relation() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let target = prediction.affine(2.0, 5.0).unwrap();

        let alignment =
            compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_close(scale[0], 2.0, 1e-5);
        assert_close(shift[0], 5.0, 1e-5);
    }

    #[test]
    fn inverts_prediction_expressed_in_target_units() {
        // prediction = 2 · target + 5, so the fit maps it back with 1/2 and -5/2.
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let target = prediction.affine(0.5, -2.5).unwrap();

        let alignment =
            compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_close(scale[0], 0.5, 1e-5);
        assert_close(shift[0], -2.5, 1e-5);

        let aligned = alignment.apply(&prediction).unwrap();
        let diff = (aligned - &target).unwrap().abs().unwrap();
        let max = diff
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(max < 1e-5);
    }

    #[test]
    fn empty_mask_yields_exact_zero() {
        let device = Device::Cpu;
        let prediction =
            Tensor::new(&[[[1f32, 2.], [3., 4.]], [[1., 5.], [2., 8.]]], &device).unwrap();
        let target = prediction.affine(3.0, 1.0).unwrap();
        let mask = Tensor::new(&[[[0u8, 0], [0, 0]], [[1, 1], [1, 1]]], &device).unwrap();

        let alignment = compute_scale_and_shift(&prediction, &target, &mask).unwrap();
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_eq!(scale[0], 0.0);
        assert_eq!(shift[0], 0.0);
        assert_close(scale[1], 3.0, 1e-4);
        assert_close(shift[1], 1.0, 1e-4);
        assert_eq!(alignment.degenerate_samples().unwrap(), 1);
    }

    #[test]
    fn constant_prediction_over_mask_is_degenerate() {
        let device = Device::Cpu;
        // Only the masked pixels need to be constant.
        let prediction = Tensor::new(&[[[2.5f32, 2.5], [2.5, 9.0]]], &device).unwrap();
        let target = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let mask = Tensor::new(&[[[1u8, 1], [1, 0]]], &device).unwrap();

        let alignment = compute_scale_and_shift(&prediction, &target, &mask).unwrap();
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_eq!(scale, vec![0.0]);
        assert_eq!(shift, vec![0.0]);
        assert!(scale.iter().chain(shift.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn zero_fit_of_solvable_system_is_not_degenerate() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let target = Tensor::zeros((1, 2, 2), DType::F32, &device).unwrap();

        let alignment =
            compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_eq!(scale, vec![0.0]);
        assert_eq!(shift, vec![0.0]);
        assert_eq!(alignment.degenerate_samples().unwrap(), 0);
    }

    #[test]
    fn masked_pixels_do_not_influence_fit() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        // The last pixel is an outlier but masked out.
        let target = Tensor::new(&[[[3f32, 5.], [7., 1000.]]], &device).unwrap();
        let mask = Tensor::new(&[[[1u8, 1], [1, 0]]], &device).unwrap();

        let (scale, shift) = compute_scale_and_shift(&prediction, &target, &mask)
            .unwrap()
            .to_vecs()
            .unwrap();
        assert_close(scale[0], 2.0, 1e-4);
        assert_close(shift[0], 1.0, 1e-4);
    }

    #[test]
    fn half_precision_inputs_are_solved_in_f32() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let target = prediction.affine(2.0, 5.0).unwrap();

        let alignment =
            compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        assert_eq!(alignment.scale().dtype(), DType::F32);
        let (scale, shift) = alignment.to_vecs().unwrap();
        assert_close(scale[0], 2.0, 1e-3);
        assert_close(shift[0], 5.0, 1e-3);
    }

    #[test]
    fn f64_inputs_keep_f64() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f64, 2.], [3., 4.]]], &device).unwrap();
        let target = prediction.affine(-1.5, 0.25).unwrap();
        let alignment =
            compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        assert_eq!(alignment.shift().dtype(), DType::F64);
        let scale = alignment.scale().to_vec1::<f64>().unwrap();
        assert!((scale[0] + 1.5).abs() < 1e-12);
    }

    #[test]
    fn inputs_are_left_untouched() {
        let device = Device::Cpu;
        let prediction = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let target = Tensor::new(&[[[0f32, 1.], [1., 3.]]], &device).unwrap();
        let before = prediction.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        compute_scale_and_shift(&prediction, &target, &full_mask((1, 2, 2))).unwrap();
        let after = prediction.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn gradients_stay_finite_for_degenerate_samples() {
        let device = Device::Cpu;
        let initial =
            Tensor::new(&[[[1f32, 2.], [3., 4.]], [[7., 7.], [7., 7.]]], &device).unwrap();
        let prediction = Var::from_tensor(&initial).unwrap();
        let target =
            Tensor::new(&[[[2f32, 3.], [5., 4.]], [[1., 2.], [3., 4.]]], &device).unwrap();

        let alignment =
            compute_scale_and_shift(prediction.as_tensor(), &target, &full_mask((2, 2, 2)))
                .unwrap();
        assert_eq!(alignment.degenerate_samples().unwrap(), 1);
        let scale_sum = alignment.scale().sum_all().unwrap();
        let shift_sum = alignment.shift().sum_all().unwrap();
        let objective = (scale_sum + shift_sum).unwrap();
        let grads = objective.backward().unwrap();
        let grad = grads
            .get(prediction.as_tensor())
            .expect("gradient for prediction")
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad[4..].iter().all(|g| *g == 0.0));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let device = Device::Cpu;
        let prediction = Tensor::zeros((2, 4, 4), DType::F32, &device).unwrap();
        let target = Tensor::zeros((2, 4, 5), DType::F32, &device).unwrap();
        let err =
            compute_scale_and_shift(&prediction, &target, &full_mask((2, 4, 4))).unwrap_err();
        assert!(matches!(err, TrainingError::Shape(_)));

        let err = compute_scale_and_shift(&prediction, &prediction, &full_mask((1, 4, 4)))
            .unwrap_err();
        assert!(matches!(err, TrainingError::Shape(_)));
    }
}
