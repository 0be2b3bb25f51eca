//! Per-phase epoch results and best-epoch tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Execution context an epoch result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Val,
    Test,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Val, Phase::Test];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
        }
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| Error::UnknownName {
                kind: "phase",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything recorded for one phase at the end of one epoch.
#[derive(Debug, Clone)]
pub struct EpochResults {
    pub targets: Tensor,
    pub predictions: Tensor,
    pub loss: f64,
    /// Metric values keyed `{metric}/{phase}`, including `loss/{phase}`.
    pub metrics: BTreeMap<String, f64>,
    /// Key of the monitored metric in `metrics`.
    pub monitored_metric: String,
    pub monitored: f64,
    pub n_epochs: usize,
}

/// Tracks the latest and the best result of every phase.
///
/// A phase's best result is replaced only by a strictly better monitored
/// value; ties keep the earlier epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    monitor: String,
    monitor_greater: bool,
    metrics_on_progress_bar: Vec<String>,
    summaries: BTreeMap<Phase, EpochResults>,
    best_summaries: BTreeMap<Phase, EpochResults>,
    latest_is_best: BTreeMap<Phase, bool>,
}

impl EpochSummary {
    /// `monitor` is the metric stem (e.g. `loss`); the tracked key for a
    /// phase is `{monitor}/{phase}`.
    pub fn new(
        monitor: impl Into<String>,
        monitor_greater: bool,
        metrics_on_progress_bar: Vec<String>,
    ) -> Self {
        Self {
            monitor: monitor.into(),
            monitor_greater,
            metrics_on_progress_bar,
            summaries: BTreeMap::new(),
            best_summaries: BTreeMap::new(),
            latest_is_best: BTreeMap::new(),
        }
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn monitor_greater(&self) -> bool {
        self.monitor_greater
    }

    /// Record a phase's epoch result. Returns whether it became the phase's best.
    ///
    /// `loss/{phase}` is added to `metrics` before storing. Fails with
    /// [`Error::MetricNotFound`] if the monitored key is absent, leaving the
    /// tracker unchanged.
    pub fn set_results(
        &mut self,
        phase: Phase,
        targets: Tensor,
        predictions: Tensor,
        loss: f64,
        mut metrics: BTreeMap<String, f64>,
        n_epochs: usize,
    ) -> Result<bool> {
        metrics.insert(format!("loss/{phase}"), loss);
        let monitored_metric = format!("{}/{phase}", self.monitor);
        let monitored = *metrics
            .get(&monitored_metric)
            .ok_or_else(|| Error::MetricNotFound(monitored_metric.clone()))?;

        let results = EpochResults {
            targets,
            predictions,
            loss,
            metrics,
            monitored_metric,
            monitored,
            n_epochs,
        };

        let is_best = self.improves(phase, monitored);
        if is_best {
            self.best_summaries.insert(phase, results.clone());
        }
        self.summaries.insert(phase, results);
        self.latest_is_best.insert(phase, is_best);
        Ok(is_best)
    }

    /// Whether the latest result of `phase` is its best so far.
    pub fn is_best(&self, phase: Phase) -> Result<bool> {
        self.latest_is_best
            .get(&phase)
            .copied()
            .ok_or_else(|| Error::PhaseNotFound(phase.name().to_string()))
    }

    fn improves(&self, phase: Phase, monitored: f64) -> bool {
        match self.best_summaries.get(&phase) {
            None => true,
            Some(best) if self.monitor_greater => monitored > best.monitored,
            Some(best) => monitored < best.monitored,
        }
    }

    pub fn get_results(&self, phase: Phase) -> Result<&EpochResults> {
        self.summaries
            .get(&phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.name().to_string()))
    }

    pub fn get_best_results(&self, phase: Phase) -> Result<&EpochResults> {
        self.best_summaries
            .get(&phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.name().to_string()))
    }

    /// The configured progress-bar metrics of `phase`, keyed `{metric}/{phase}`.
    pub fn get_results_on_progress_bar(&self, phase: Phase) -> Result<BTreeMap<String, f64>> {
        let results = self.get_results(phase)?;
        self.metrics_on_progress_bar
            .iter()
            .map(|name| -> Result<(String, f64)> {
                let key = format!("{name}/{phase}");
                let value = *results
                    .metrics
                    .get(&key)
                    .ok_or_else(|| Error::MetricNotFound(key.clone()))?;
                Ok((key, value))
            })
            .collect()
    }

    /// Serializable report of every phase's latest and best metrics.
    ///
    /// ```json
    /// {
    ///   "metric_summaries": { "val": { "loss/val": 0.3, "n_epochs": 1 } },
    ///   "best_epoch_metric_summaries": { "val": { "loss/val": 0.3, "n_epochs": 1 } }
    /// }
    /// ```
    ///
    /// Non-finite values are written as `null`.
    pub fn get_dict_summary(&self) -> Value {
        json!({
            "metric_summaries": phase_map(&self.summaries),
            "best_epoch_metric_summaries": phase_map(&self.best_summaries),
        })
    }
}

fn phase_map(results: &BTreeMap<Phase, EpochResults>) -> Value {
    let mut out = Map::new();
    for (phase, r) in results {
        let mut entry: Map<String, Value> = r
            .metrics
            .iter()
            .map(|(k, &v)| (k.clone(), Value::from(v)))
            .collect();
        entry.insert("n_epochs".into(), Value::from(r.n_epochs));
        out.insert(phase.name().to_string(), Value::Object(entry));
    }
    Value::Object(out)
}
