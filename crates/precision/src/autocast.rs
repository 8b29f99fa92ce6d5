//! Thread-local mixed precision context.
//!
//! Training code enables autocast around the forward pass so activations are
//! produced in `bf16`/`f16`. Numerically sensitive sections (the depth
//! alignment solve) open a [`full_precision`] scope instead. The previous
//! mode is restored when the returned [`AutocastGuard`] is dropped, which
//! also happens while unwinding or when `?` leaves the scope early.

use std::{cell::Cell, marker::PhantomData};

use candle_core::{DType, Result, Tensor};

use crate::{is_float, policy::cast_tensor, PrecisionError, PrecisionPolicy};

/// Ambient precision mode for float computations on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutocastMode {
    /// Tensors are computed at least at the width given by [`PrecisionPolicy`].
    #[default]
    Disabled,
    /// Float tensors are cast to the given reduced dtype before computing.
    Enabled(DType),
}

impl AutocastMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AutocastMode::Enabled(_))
    }
}

thread_local! {
    static MODE: Cell<AutocastMode> = const { Cell::new(AutocastMode::Disabled) };
}

/// Restores the previous autocast mode on drop.
///
/// Guards are tied to the thread that created them and must be dropped in
/// reverse order of creation.
#[must_use = "the autocast mode is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AutocastGuard {
    previous: AutocastMode,
    _thread_bound: PhantomData<*const ()>,
}

impl AutocastGuard {
    /// Mode that will be reinstated when this guard is dropped.
    pub fn previous(&self) -> AutocastMode {
        self.previous
    }
}

impl Drop for AutocastGuard {
    fn drop(&mut self) {
        MODE.with(|mode| mode.set(self.previous));
    }
}

/// Returns the mode active on the current thread.
pub fn current() -> AutocastMode {
    MODE.with(Cell::get)
}

/// Switches the current thread to `mode` until the guard is dropped.
pub fn enter(mode: AutocastMode) -> AutocastGuard {
    let previous = MODE.with(|cell| cell.replace(mode));
    log::trace!("autocast {:?} -> {:?}", previous, mode);
    AutocastGuard {
        previous,
        _thread_bound: PhantomData,
    }
}

/// Enables autocast to a float dtype for the guard's lifetime.
pub fn enable(dtype: DType) -> std::result::Result<AutocastGuard, PrecisionError> {
    if !is_float(dtype) {
        return Err(PrecisionError::UnsupportedDType {
            label: "autocast",
            dtype,
        });
    }
    Ok(enter(AutocastMode::Enabled(dtype)))
}

/// Disables autocast for the guard's lifetime.
pub fn full_precision() -> AutocastGuard {
    enter(AutocastMode::Disabled)
}

/// Casts a float tensor to the dtype the ambient mode computes in.
///
/// Non-float tensors (masks, indices) are returned unchanged.
pub fn cast_for_compute(tensor: &Tensor) -> Result<Tensor> {
    let dtype = tensor.dtype();
    if !is_float(dtype) {
        return Ok(tensor.clone());
    }
    match current() {
        AutocastMode::Enabled(target) => cast_tensor(tensor, target),
        AutocastMode::Disabled => {
            PrecisionPolicy::from_parameter_dtype(dtype).cast_for_compute(tensor)
        }
    }
}
