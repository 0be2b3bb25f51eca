//! Learning-rate reduction on a metric plateau.

use tracing::debug;

use crate::config::{PlateauConfig, PlateauMode};
use crate::error::Result;

/// Minimum change for a reduction to take effect.
const LR_EPS: f64 = 1e-8;

/// Multiplies the learning rate by `factor` once the monitored metric has not
/// improved for more than `patience` consecutive steps.
///
/// Improvement is relative: in `min` mode a value counts as better when it is
/// below `best * (1 - threshold)`, in `max` mode when it is above
/// `best * (1 + threshold)`. A NaN metric never improves.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: PlateauConfig, initial_lr: f64) -> Result<Self> {
        config.validate()?;
        let best = match config.mode {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        };
        Ok(Self {
            config,
            lr: initial_lr,
            best,
            num_bad_epochs: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn is_better(&self, metric: f64) -> bool {
        let rel = self.config.threshold;
        match self.config.mode {
            PlateauMode::Min => metric < self.best * (1.0 - rel),
            PlateauMode::Max => metric > self.best * (1.0 + rel),
        }
    }

    /// Feed one metric value. Returns the new learning rate when it was reduced.
    pub fn step(&mut self, metric: f64) -> Option<f64> {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs <= self.config.patience {
            return None;
        }
        self.num_bad_epochs = 0;

        let new_lr = (self.lr * self.config.factor).max(self.config.min_lr);
        if self.lr - new_lr <= LR_EPS {
            debug!(lr = self.lr, "learning rate already at floor");
            return None;
        }
        self.lr = new_lr;
        Some(new_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(patience: usize) -> ReduceLrOnPlateau {
        let config = PlateauConfig::default().with_patience(patience).with_min_lr(0.1);
        ReduceLrOnPlateau::new(config, 1.0).unwrap()
    }

    #[test]
    fn test_reduces_after_patience() {
        let mut s = scheduler(2);
        assert_eq!(s.step(1.0), None);
        assert_eq!(s.step(1.0), None);
        assert_eq!(s.step(1.0), None);
        assert_eq!(s.num_bad_epochs(), 2);
        assert_eq!(s.step(1.0), Some(0.5));
        assert_eq!(s.num_bad_epochs(), 0);
        assert_eq!(s.lr(), 0.5);
    }

    #[test]
    fn test_improvement_resets_patience() {
        let mut s = scheduler(1);
        s.step(1.0);
        s.step(1.0);
        assert_eq!(s.num_bad_epochs(), 1);
        assert_eq!(s.step(0.5), None);
        assert_eq!(s.num_bad_epochs(), 0);
        // within the relative threshold: not an improvement
        s.step(0.49999);
        assert_eq!(s.num_bad_epochs(), 1);
    }

    #[test]
    fn test_respects_floor() {
        let mut s = scheduler(0);
        s.step(1.0);
        let mut last = s.lr();
        for _ in 0..10 {
            if let Some(lr) = s.step(1.0) {
                last = lr;
            }
        }
        assert_eq!(last, 0.1);
        assert_eq!(s.lr(), 0.1);
    }

    #[test]
    fn test_max_mode_and_nan() {
        let config = PlateauConfig::default()
            .with_patience(0)
            .with_mode(PlateauMode::Max);
        let mut s = ReduceLrOnPlateau::new(config, 1.0).unwrap();
        assert_eq!(s.step(0.1), None);
        assert_eq!(s.step(0.2), None);
        assert_eq!(s.step(f64::NAN), Some(0.5));
        assert_eq!(s.best(), 0.2);
    }

    #[test]
    fn test_invalid_factor() {
        let config = PlateauConfig::default().with_factor(1.5);
        assert!(ReduceLrOnPlateau::new(config, 1.0).is_err());
    }
}
