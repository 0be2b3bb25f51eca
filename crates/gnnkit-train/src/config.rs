//! Predictor configuration.
//!
//! Every struct deserializes with missing fields filled from [`Default`], so a
//! driver can load them from JSON (or any serde format) with only the keys it
//! wants to override:
//!
//! ```rust,ignore
//! let config: PredictorConfig = serde_json::from_str(r#"{
//!     "loss_fun": "mae",
//!     "optim": { "lr": 0.01 },
//!     "target_nan_mask": "ignore"
//! }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nan_mask::TargetNanMask;

/// Optimizer settings (default: lr 1e-3, no weight decay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub lr: f64,
    pub weight_decay: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.0,
        }
    }
}

impl OptimConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

/// Direction in which the monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    #[default]
    Min,
    Max,
}

/// Reduce-on-plateau settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau (default: 0.5).
    pub factor: f64,
    /// Epochs without improvement tolerated before reducing (default: 10).
    pub patience: usize,
    /// Learning-rate floor (default: 1e-4).
    pub min_lr: f64,
    pub mode: PlateauMode,
    /// Relative improvement required to reset patience (default: 1e-4).
    pub threshold: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 10,
            min_lr: 1e-4,
            mode: PlateauMode::Min,
            threshold: 1e-4,
        }
    }
}

impl PlateauConfig {
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn with_mode(mut self, mode: PlateauMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        if self.min_lr < 0.0 || self.threshold < 0.0 {
            return Err(Error::InvalidConfig(
                "min_lr and threshold must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Whether the scheduler steps per epoch or per optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Epoch,
    Step,
}

/// How the plateau scheduler is bound to the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Metric key read by the scheduler (default: `loss/val`).
    pub monitor: String,
    pub interval: Interval,
    /// Step the scheduler every `frequency` intervals (default: 1).
    pub frequency: usize,
    /// Fail when `monitor` is missing instead of skipping the step (default: true).
    pub strict: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            monitor: "loss/val".into(),
            interval: Interval::Epoch,
            frequency: 1,
            strict: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_monitor(mut self, monitor: impl Into<String>) -> Self {
        self.monitor = monitor.into();
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Metric stem tracked by the epoch summary: `loss/val` -> `loss`.
    pub fn monitor_stem(&self) -> &str {
        self.monitor.split('/').next().unwrap_or(&self.monitor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequency == 0 {
            return Err(Error::InvalidConfig("scheduler frequency must be >= 1".into()));
        }
        if self.monitor.is_empty() {
            return Err(Error::InvalidConfig("scheduler monitor must not be empty".into()));
        }
        Ok(())
    }
}

/// Everything the predictor needs besides the model and the metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Registry name of the loss (default: `mse`).
    pub loss_fun: String,
    pub optim: OptimConfig,
    pub lr_reduce_on_plateau: PlateauConfig,
    pub scheduler: SchedulerConfig,
    pub target_nan_mask: TargetNanMask,
    /// Metric names shown on the progress bar, without the phase suffix.
    pub metrics_on_progress_bar: Vec<String>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            loss_fun: "mse".into(),
            optim: OptimConfig::default(),
            lr_reduce_on_plateau: PlateauConfig::default(),
            scheduler: SchedulerConfig::default(),
            target_nan_mask: TargetNanMask::Keep,
            metrics_on_progress_bar: Vec::new(),
        }
    }
}

impl PredictorConfig {
    pub fn with_loss_fun(mut self, loss_fun: impl Into<String>) -> Self {
        self.loss_fun = loss_fun.into();
        self
    }

    pub fn with_optim(mut self, optim: OptimConfig) -> Self {
        self.optim = optim;
        self
    }

    pub fn with_lr_reduce_on_plateau(mut self, plateau: PlateauConfig) -> Self {
        self.lr_reduce_on_plateau = plateau;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_target_nan_mask(mut self, mask: TargetNanMask) -> Self {
        self.target_nan_mask = mask;
        self
    }

    pub fn with_metrics_on_progress_bar(mut self, names: Vec<String>) -> Self {
        self.metrics_on_progress_bar = names;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.optim.lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.optim.lr
            )));
        }
        self.lr_reduce_on_plateau.validate()?;
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = PredictorConfig::default();
        assert_eq!(c.loss_fun, "mse");
        assert_eq!(c.optim.lr, 1e-3);
        assert_eq!(c.optim.weight_decay, 0.0);
        assert_eq!(c.lr_reduce_on_plateau.factor, 0.5);
        assert_eq!(c.lr_reduce_on_plateau.patience, 10);
        assert_eq!(c.lr_reduce_on_plateau.min_lr, 1e-4);
        assert_eq!(c.scheduler.monitor, "loss/val");
        assert_eq!(c.scheduler.interval, Interval::Epoch);
        assert_eq!(c.scheduler.frequency, 1);
        assert!(c.scheduler.strict);
        assert_eq!(c.target_nan_mask, TargetNanMask::Keep);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let c: PredictorConfig = serde_json::from_str(
            r#"{"loss_fun": "mae", "optim": {"lr": 0.01}, "target_nan_mask": "ignore",
                "scheduler": {"interval": "step", "strict": false}}"#,
        )
        .unwrap();
        assert_eq!(c.loss_fun, "mae");
        assert_eq!(c.optim.lr, 0.01);
        assert_eq!(c.optim.weight_decay, 0.0);
        assert_eq!(c.target_nan_mask, TargetNanMask::Ignore);
        assert_eq!(c.scheduler.interval, Interval::Step);
        assert_eq!(c.scheduler.monitor, "loss/val");
        assert!(!c.scheduler.strict);
    }

    #[test]
    fn test_invalid_values() {
        let bad_mask = serde_json::from_str::<PredictorConfig>(r#"{"target_nan_mask": "drop"}"#);
        assert!(bad_mask.is_err());

        let c = PredictorConfig::default().with_scheduler(SchedulerConfig::default().with_frequency(0));
        assert!(c.validate().is_err());

        let c = PredictorConfig::default()
            .with_lr_reduce_on_plateau(PlateauConfig::default().with_factor(1.0));
        assert!(c.validate().is_err());

        let c = PredictorConfig::default().with_optim(OptimConfig::default().with_lr(0.0));
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_monitor_stem() {
        assert_eq!(SchedulerConfig::default().monitor_stem(), "loss");
        assert_eq!(SchedulerConfig::default().with_monitor("mae").monitor_stem(), "mae");
    }
}
