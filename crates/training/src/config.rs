use candle_core::DType;
use precision::{AutocastMode, PrecisionError};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::{fmt, fs, path::Path};

use crate::scheduler::{IterExponential, LrMultiplier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.validate()?;
        log::debug!("loaded training config from {}", path.display());

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if !(self.optimizer.learning_rate > 0.0 && self.optimizer.learning_rate.is_finite()) {
            errors.push(
                "optimizer.learning_rate must be a finite value greater than 0".to_string(),
            );
        }

        if self.scheduler.total_iter_length == 0 {
            errors.push("scheduler.total_iter_length must be greater than 0".to_string());
        }

        if !(self.scheduler.final_ratio > 0.0 && self.scheduler.final_ratio.is_finite()) {
            errors.push("scheduler.final_ratio must be a finite value greater than 0".to_string());
        }

        if self.scheduler.warmup_steps >= self.scheduler.total_iter_length {
            errors.push(
                "scheduler.warmup_steps must be smaller than scheduler.total_iter_length"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Applies `key.path=value` overrides on top of a loaded config and
    /// validates the result.
    pub fn with_overrides<'a, I>(self, overrides: I) -> Result<Self, TrainingError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut value = serde_json::to_value(&self).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
        })?;

        for (path, raw) in overrides {
            assign_at_path(&mut value, path, parse_override_value(raw))?;
        }

        let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
            TrainingError::ConfigFormat(format!("failed to apply overrides: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
        }
    }
}

/// Parameters of the iteration-exponential learning rate multiplier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    pub total_iter_length: usize,
    pub final_ratio: f64,
    #[serde(default)]
    pub warmup_steps: usize,
}

impl SchedulerConfig {
    pub fn build(&self) -> Result<Box<dyn LrMultiplier>, TrainingError> {
        Ok(Box::new(IterExponential::from_config(self)?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub precision: Precision,
}

impl RuntimeConfig {
    pub fn autocast_mode(&self) -> AutocastMode {
        self.precision.autocast_mode()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    #[default]
    Bf16,
    Mixed,
}

impl Precision {
    /// Autocast mode the training loop should run its forward pass under.
    pub fn autocast_mode(self) -> AutocastMode {
        match self {
            Precision::Fp32 => AutocastMode::Disabled,
            Precision::Fp16 => AutocastMode::Enabled(DType::F16),
            Precision::Bf16 | Precision::Mixed => AutocastMode::Enabled(DType::BF16),
        }
    }
}

fn default_learning_rate() -> f64 {
    3e-5
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = trimmed.parse::<u64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "override path '{}' contains an empty segment",
            path
        )]));
    }

    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => {
            return Err(TrainingError::validation(vec![
                "override path must not be empty".to_string()
            ]))
        }
    };

    let mut current = root;
    for segment in parents {
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::validation(vec![format!(
                "override path segment '{}' points into a non-object value",
                segment
            )])
        })?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::validation(vec![format!(
            "override path '{}' does not end in an object field",
            path
        )])
    })?;
    map.insert(last.to_string(), new_value);
    Ok(())
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Shape(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => write!(f, "initialization failed: {}", msg),
            TrainingError::Shape(msg) => write!(f, "shape mismatch: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "computation failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Shape(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<PrecisionError> for TrainingError {
    fn from(value: PrecisionError) -> Self {
        match value {
            PrecisionError::Backend(err) => TrainingError::Runtime(err.to_string()),
            other => TrainingError::Shape(other.to_string()),
        }
    }
}
