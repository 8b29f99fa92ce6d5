use std::fmt;

use serde::Serialize;

use crate::{config, TrainingConfig, TrainingError};

/// Maps an absolute optimizer step to a learning rate multiplier.
///
/// Implementations are pure: the caller passes the iteration index on every
/// call instead of advancing an internal counter.
pub trait LrMultiplier: Send + Sync + fmt::Debug {
    fn multiplier(&self, n_iter: usize) -> f64;
}

/// Linear warmup followed by exponential decay towards `final_ratio`.
///
/// ```text
/// n < warmup            n / warmup
/// n >= total            final_ratio
/// otherwise             final_ratio ^ ((n - warmup) / (total - warmup))
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterExponential {
    total_length: usize,
    effective_length: usize,
    final_ratio: f64,
    warmup_steps: usize,
}

impl IterExponential {
    pub fn new(
        total_iter_length: usize,
        final_ratio: f64,
        warmup_steps: usize,
    ) -> Result<Self, TrainingError> {
        if !(final_ratio > 0.0 && final_ratio.is_finite()) {
            return Err(TrainingError::initialization(format!(
                "scheduler final_ratio must be finite and > 0 (got {})",
                final_ratio
            )));
        }
        if warmup_steps >= total_iter_length {
            return Err(TrainingError::initialization(format!(
                "scheduler warmup_steps ({}) must be smaller than total_iter_length ({})",
                warmup_steps, total_iter_length
            )));
        }

        Ok(Self {
            total_length: total_iter_length,
            effective_length: total_iter_length - warmup_steps,
            final_ratio,
            warmup_steps,
        })
    }

    pub fn without_warmup(
        total_iter_length: usize,
        final_ratio: f64,
    ) -> Result<Self, TrainingError> {
        Self::new(total_iter_length, final_ratio, 0)
    }

    pub fn from_config(cfg: &config::SchedulerConfig) -> Result<Self, TrainingError> {
        Self::new(cfg.total_iter_length, cfg.final_ratio, cfg.warmup_steps)
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn effective_length(&self) -> usize {
        self.effective_length
    }

    pub fn final_ratio(&self) -> f64 {
        self.final_ratio
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn multiplier(&self, n_iter: usize) -> f64 {
        if n_iter < self.warmup_steps {
            n_iter as f64 / self.warmup_steps as f64
        } else if n_iter >= self.total_length {
            self.final_ratio
        } else {
            let actual_iter = (n_iter - self.warmup_steps) as f64;
            let progress = actual_iter / self.effective_length as f64;
            (progress * self.final_ratio.ln()).exp()
        }
    }
}

impl LrMultiplier for IterExponential {
    fn multiplier(&self, n_iter: usize) -> f64 {
        IterExponential::multiplier(self, n_iter)
    }
}

/// Base learning rate combined with a multiplier schedule.
#[derive(Debug)]
pub struct ScheduledLearningRate {
    base_lr: f64,
    schedule: Box<dyn LrMultiplier>,
}

impl ScheduledLearningRate {
    pub fn new(base_lr: f64, schedule: Box<dyn LrMultiplier>) -> Result<Self, TrainingError> {
        if !(base_lr > 0.0 && base_lr.is_finite()) {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Self { base_lr, schedule })
    }

    pub fn from_training_config(cfg: &TrainingConfig) -> Result<Self, TrainingError> {
        log::debug!(
            "iteration-exponential schedule: total={} warmup={} final_ratio={}",
            cfg.scheduler.total_iter_length,
            cfg.scheduler.warmup_steps,
            cfg.scheduler.final_ratio
        );
        Self::new(cfg.optimizer.learning_rate, cfg.scheduler.build()?)
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn multiplier(&self, n_iter: usize) -> f64 {
        self.schedule.multiplier(n_iter)
    }

    pub fn learning_rate(&self, n_iter: usize) -> f64 {
        self.base_lr * self.schedule.multiplier(n_iter)
    }

    /// Samples steps `0, every, 2 * every, ...` up to and including `last_step`.
    pub fn rows(&self, last_step: usize, every: usize) -> Result<Vec<ScheduleRow>, TrainingError> {
        if every == 0 {
            return Err(TrainingError::validation(vec![
                "schedule sampling interval must be greater than 0".to_string()
            ]));
        }
        Ok((0..=last_step)
            .step_by(every)
            .map(|step| ScheduleRow {
                step,
                multiplier: self.multiplier(step),
                learning_rate: self.learning_rate(step),
            })
            .collect())
    }
}

/// Learning rate at one sampled step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleRow {
    pub step: usize,
    pub multiplier: f64,
    pub learning_rate: f64,
}

/// Rows for a config's schedule; `last_step` defaults to `total_iter_length`.
pub fn schedule_rows(
    cfg: &TrainingConfig,
    last_step: Option<usize>,
    every: usize,
) -> Result<Vec<ScheduleRow>, TrainingError> {
    let schedule = ScheduledLearningRate::from_training_config(cfg)?;
    schedule.rows(last_step.unwrap_or(cfg.scheduler.total_iter_length), every)
}
