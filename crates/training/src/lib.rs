//! Depth training utilities: masked scale/shift alignment, the
//! scale-and-shift-invariant loss built on it, and the iteration-exponential
//! learning rate schedule.

pub mod alignment;
pub mod config;
pub mod loss;
pub mod scheduler;

pub use alignment::{compute_scale_and_shift, Alignment};
pub use config::{Precision, TrainingConfig, TrainingError};
pub use loss::{LossMetrics, LossOutput, ScaleAndShiftInvariantLoss};
pub use scheduler::{
    schedule_rows, IterExponential, LrMultiplier, ScheduleRow, ScheduledLearningRate,
};
