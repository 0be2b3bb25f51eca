//! Training orchestration.
//!
//! [`Predictor`] wires a model, a loss, metrics, an AdamW optimizer and a
//! plateau scheduler together. The surrounding loop drives it through three
//! entry points:
//!
//! ```text
//! for epoch in 0.. {
//!     for batch in train { predictor.on_batch(Phase::Train, batch)?; }
//!     predictor.on_phase_end(Phase::Train)?;
//!     for batch in val { predictor.on_batch(Phase::Val, batch)?; }
//!     predictor.on_phase_end(Phase::Val)?;       // writes metrics.json
//!     predictor.on_epoch_end()?;                 // scheduler, epoch counter
//! }
//! ```
//!
//! Only one phase can be open at a time. Training batches step the optimizer
//! immediately; validation and test batches are buffered and scored once at
//! phase end.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::config::{Interval, PlateauMode, PredictorConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::loss::{scalar, Loss, LossFn};
use crate::metrics::Metrics;
use crate::nan_mask::TargetNanMask;
use crate::scheduler::ReduceLrOnPlateau;
use crate::summary::{EpochSummary, Phase};

/// File name of the report written under the logger directory.
pub const REPORT_FILE: &str = "metrics.json";

/// Variable-name suffixes of non-trainable buffers (batch-norm statistics).
const BUFFER_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

/// Metric stems logged for every phase besides the registered metrics.
const BUILTIN_STEMS: [&str; 3] = ["loss", "mean_pred", "std_pred"];

/// A trainable network.
pub trait Model {
    /// Everything a forward pass needs besides the parameters.
    type Input;

    fn forward_t(&self, input: &Self::Input, train: bool) -> Result<Tensor>;
}

/// Construction of a [`Model`] from its configuration.
///
/// Parameters must be created through `vb`; the predictor optimizes exactly
/// the variables registered there.
pub trait BuildModel: Model + Sized {
    type Config;

    fn build(config: &Self::Config, vb: VarBuilder) -> Result<Self>;
}

/// One mini-batch: model inputs plus labels.
#[derive(Debug, Clone)]
pub struct Batch<I> {
    pub features: I,
    pub labels: Tensor,
}

impl<I> Batch<I> {
    pub fn new(features: I, labels: Tensor) -> Self {
        Self { features, labels }
    }
}

/// Result of one [`Predictor::on_batch`] call.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Detached predictions.
    pub preds: Tensor,
    pub targets: Tensor,
    /// Training loss before the optimizer step; `None` outside training.
    pub loss: Option<f64>,
    /// Per-step metric logs (training only).
    pub logs: BTreeMap<String, f64>,
}

/// Sink for metric logs.
pub trait ExperimentLogger {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()>;

    /// Directory where reports are written.
    fn log_dir(&self) -> &Path;
}

/// Logger emitting every metric as a `tracing` event.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    log_dir: PathBuf,
}

impl TracingLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }
}

impl ExperimentLogger for TracingLogger {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
        for (name, value) in metrics {
            info!(step, metric = %name, value, "metric");
        }
        Ok(())
    }

    fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Position of the predictor in the batch/phase lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    InPhase(Phase),
}

/// Granularity of [`Predictor::summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    /// One row per top-level module.
    Top,
    /// One row per parameter.
    Full,
}

impl FromStr for SummaryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "top" | "1" => Ok(SummaryMode::Top),
            "full" | "2" => Ok(SummaryMode::Full),
            _ => Err(Error::InvalidConfig(format!(
                "summary mode must be \"top\" (1) or \"full\" (2), got {s:?}"
            ))),
        }
    }
}

impl TryFrom<u8> for SummaryMode {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            1 => Ok(SummaryMode::Top),
            2 => Ok(SummaryMode::Full),
            _ => Err(Error::InvalidConfig(format!(
                "summary mode must be 1 (top) or 2 (full), got {level}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub name: String,
    pub n_params: usize,
}

/// Parameter counts of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub mode: SummaryMode,
    pub rows: Vec<SummaryRow>,
    pub total_params: usize,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0)
            .max(4);
        writeln!(f, "    | {:<width$} | Params", "Name")?;
        writeln!(f, "{}", "-".repeat(width + 16))?;
        for (i, row) in self.rows.iter().enumerate() {
            writeln!(f, "{i:<3} | {:<width$} | {}", row.name, row.n_params)?;
        }
        writeln!(f, "{}", "-".repeat(width + 16))?;
        write!(f, "Total params: {}", self.total_params)
    }
}

/// Training-loop wrapper around a model.
pub struct Predictor<M: Model> {
    model: M,
    varmap: VarMap,
    /// Trainable variables by name, sorted.
    params: Vec<(String, Var)>,
    loss_fun: LossFn,
    metrics: Metrics,
    target_nan_mask: TargetNanMask,
    optimizer: AdamW,
    scheduler: ReduceLrOnPlateau,
    scheduler_config: SchedulerConfig,
    epoch_summary: EpochSummary,
    logger: Box<dyn ExperimentLogger>,
    state: Lifecycle,
    preds_buffer: Vec<Tensor>,
    targets_buffer: Vec<Tensor>,
    callback_metrics: BTreeMap<String, f64>,
    current_epoch: usize,
    global_step: usize,
}

impl<M: BuildModel> Predictor<M> {
    /// Build the model from `model_config` and set up optimization.
    ///
    /// The loss is looked up from `config.loss_fun`; use
    /// [`with_loss`](Self::with_loss) for the hybrid loss or a custom one.
    pub fn new(
        model_config: &M::Config,
        config: PredictorConfig,
        metrics: Metrics,
        logger: Box<dyn ExperimentLogger>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let loss_fun: LossFn = config.loss_fun.parse()?;

        let stem = config.scheduler.monitor_stem();
        let logged = BUILTIN_STEMS.contains(&stem)
            || stem == loss_fun.name()
            || metrics.contains_key(stem);
        if !logged {
            return Err(Error::InvalidConfig(format!(
                "monitor {:?} names no logged metric",
                config.scheduler.monitor
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = M::build(model_config, vb)?;
        let params = trainable_params(&varmap)?;

        let adam_params = ParamsAdamW {
            lr: config.optim.lr,
            weight_decay: config.optim.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(params.iter().map(|(_, v)| v.clone()).collect(), adam_params)?;
        let scheduler =
            ReduceLrOnPlateau::new(config.lr_reduce_on_plateau.clone(), config.optim.lr)?;

        let epoch_summary = EpochSummary::new(
            config.scheduler.monitor_stem(),
            config.lr_reduce_on_plateau.mode == PlateauMode::Max,
            config.metrics_on_progress_bar.clone(),
        );

        let predictor = Self {
            model,
            varmap,
            params,
            loss_fun,
            metrics,
            target_nan_mask: config.target_nan_mask,
            optimizer,
            scheduler,
            scheduler_config: config.scheduler,
            epoch_summary,
            logger,
            state: Lifecycle::Idle,
            preds_buffer: Vec::new(),
            targets_buffer: Vec::new(),
            callback_metrics: BTreeMap::new(),
            current_epoch: 0,
            global_step: 0,
        };
        info!(
            n_params = predictor.n_params(),
            loss = predictor.loss_fun.name(),
            lr = predictor.learning_rate(),
            "predictor ready"
        );
        Ok(predictor)
    }
}

impl<M: Model> Predictor<M> {
    /// Replace the loss chosen by name in the config.
    pub fn with_loss(mut self, loss: impl Into<LossFn>) -> Self {
        self.loss_fun = loss.into();
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn loss_fun(&self) -> &LossFn {
        &self.loss_fun
    }

    pub fn epoch_summary(&self) -> &EpochSummary {
        &self.epoch_summary
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Number of trainable scalars; batch-norm running statistics are excluded.
    pub fn n_params(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Run one batch of `phase`.
    ///
    /// Opens `phase` if no phase is open. Fails with [`Error::InvalidState`]
    /// if another phase is open. A step-interval scheduler whose strict
    /// monitor is missing fails with [`Error::MetricNotFound`] before the
    /// optimizer step; the batch is then neither applied nor buffered.
    pub fn on_batch(&mut self, phase: Phase, batch: Batch<M::Input>) -> Result<StepOutput> {
        if let Lifecycle::InPhase(open) = self.state {
            if open != phase {
                return Err(Error::InvalidState(format!(
                    "batch for phase {phase} while phase {open} is open"
                )));
            }
        }

        let Batch { features, labels } = batch;
        let train = phase == Phase::Train;
        let preds = self.model.forward_t(&features, train)?;

        let (loss, logs) = if train {
            let loss = self.compute_loss(&preds, &labels)?;
            let logs = self.get_metrics_logs(&preds.detach(), &labels, phase, Some(&loss))?;

            // A strict monitor failure must leave weights, counters and buffers untouched.
            let monitored = if self.scheduler_config.interval == Interval::Step
                && (self.global_step + 1) % self.scheduler_config.frequency == 0
            {
                Some(self.monitored_value(&logs)?)
            } else {
                None
            };

            self.optimizer.backward_step(&loss)?;
            self.global_step += 1;
            self.logger.log_metrics(&logs, self.global_step)?;
            self.callback_metrics
                .extend(logs.iter().map(|(k, v)| (k.clone(), *v)));

            if let Some(value) = monitored {
                self.step_scheduler(value);
            }
            (Some(scalar(&loss)?), logs)
        } else {
            (None, BTreeMap::new())
        };

        let preds = preds.detach();
        self.preds_buffer.push(preds.clone());
        self.targets_buffer.push(labels.clone());
        self.state = Lifecycle::InPhase(phase);

        Ok(StepOutput {
            preds,
            targets: labels,
            loss,
            logs,
        })
    }

    /// Close `phase`: score every buffered batch, record the result in the
    /// epoch summary and log it.
    ///
    /// Validation logs also carry `lr` and `n_epochs`. Validation and test
    /// phases write the summary report to `{log_dir}/metrics.json`.
    pub fn on_phase_end(&mut self, phase: Phase) -> Result<BTreeMap<String, f64>> {
        if self.state != Lifecycle::InPhase(phase) {
            return Err(Error::InvalidState(format!(
                "cannot end phase {phase} in state {:?}",
                self.state
            )));
        }
        // The phase stays open with its buffers until its results are recorded.
        let preds = Tensor::cat(&self.preds_buffer, 0)?;
        let targets = Tensor::cat(&self.targets_buffer, 0)?;

        let loss = self.compute_loss(&preds, &targets)?;
        let logs = self.get_metrics_logs(&preds, &targets, phase, Some(&loss))?;
        let loss = scalar(&loss)?;

        let is_best = self.epoch_summary.set_results(
            phase,
            targets,
            preds,
            loss,
            logs,
            self.current_epoch,
        )?;
        self.preds_buffer.clear();
        self.targets_buffer.clear();
        self.state = Lifecycle::Idle;
        let mut logs = self.epoch_summary.get_results(phase)?.metrics.clone();
        if phase == Phase::Val {
            logs.insert("lr".into(), self.learning_rate());
            logs.insert("n_epochs".into(), self.current_epoch as f64);
        }
        info!(%phase, epoch = self.current_epoch, loss, is_best, "phase complete");

        self.logger.log_metrics(&logs, self.current_epoch)?;
        self.callback_metrics
            .extend(logs.iter().map(|(k, v)| (k.clone(), *v)));

        if matches!(phase, Phase::Val | Phase::Test) {
            self.write_report()?;
        }
        Ok(logs)
    }

    /// Finish the epoch: step an epoch-interval scheduler and advance the
    /// epoch counter. No phase may be open.
    pub fn on_epoch_end(&mut self) -> Result<()> {
        if let Lifecycle::InPhase(open) = self.state {
            return Err(Error::InvalidState(format!(
                "phase {open} still open at epoch end"
            )));
        }
        if self.scheduler_config.interval == Interval::Epoch
            && (self.current_epoch + 1) % self.scheduler_config.frequency == 0
        {
            let value = self.monitored_value(&BTreeMap::new())?;
            self.step_scheduler(value);
        }
        self.current_epoch += 1;
        Ok(())
    }

    /// Current value of the scheduler monitor, preferring `pending` logs over
    /// earlier ones. `Ok(None)` means a lenient scheduler skips this step.
    fn monitored_value(&self, pending: &BTreeMap<String, f64>) -> Result<Option<f64>> {
        let monitor = &self.scheduler_config.monitor;
        match pending.get(monitor).or_else(|| self.callback_metrics.get(monitor)) {
            Some(&value) => Ok(Some(value)),
            None if self.scheduler_config.strict => Err(Error::MetricNotFound(monitor.clone())),
            None => {
                warn!(monitor = %monitor, "scheduler monitor unavailable, skipping step");
                Ok(None)
            }
        }
    }

    fn step_scheduler(&mut self, value: Option<f64>) {
        let Some(value) = value else {
            return;
        };
        if let Some(lr) = self.scheduler.step(value) {
            self.optimizer.set_learning_rate(lr);
            info!(lr, monitor = %self.scheduler_config.monitor, value, "reduced learning rate");
        }
    }

    /// Loss after the NaN target policy. Must reduce to a scalar.
    pub fn compute_loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (preds, targets) = self.target_nan_mask.apply(preds, targets)?;
        let loss = self.loss_fun.forward(&preds, &targets)?;
        if loss.rank() != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} must reduce to a scalar, got shape {:?}",
                self.loss_fun.name(),
                loss.dims()
            )));
        }
        Ok(loss)
    }

    /// Loss, prediction statistics and every metric, keyed `{name}/{phase}`.
    ///
    /// The loss is computed when not given. Metrics see the raw tensors, NaN
    /// targets included; a failing metric is logged and recorded as NaN.
    pub fn get_metrics_logs(
        &self,
        preds: &Tensor,
        targets: &Tensor,
        phase: Phase,
        loss: Option<&Tensor>,
    ) -> Result<BTreeMap<String, f64>> {
        let loss = match loss {
            Some(loss) => scalar(loss)?,
            None => scalar(&self.compute_loss(preds, targets)?)?,
        };

        let mut logs = BTreeMap::new();
        logs.insert(format!("{}/{phase}", self.loss_fun.name()), loss);
        logs.insert(format!("mean_pred/{phase}"), scalar(&preds.mean_all()?)?);
        logs.insert(format!("std_pred/{phase}"), unbiased_std(preds)?);

        for (name, metric) in &self.metrics {
            let value = match metric.compute(preds, targets) {
                Ok(value) => value,
                Err(e) => {
                    warn!(metric = %name, %phase, error = %e, "metric failed, recording NaN");
                    f64::NAN
                }
            };
            logs.insert(format!("{name}/{phase}"), value);
        }
        Ok(logs)
    }

    /// `loss/val` plus the configured progress-bar metrics of the last
    /// validation phase.
    pub fn progress_bar_metrics(&self) -> Result<BTreeMap<String, f64>> {
        let mut bar = self.epoch_summary.get_results_on_progress_bar(Phase::Val)?;
        bar.insert(
            "loss/val".into(),
            self.epoch_summary.get_results(Phase::Val)?.loss,
        );
        Ok(bar)
    }

    /// Parameter counts grouped per `mode`.
    pub fn summarize(&self, mode: SummaryMode) -> Result<ModelSummary> {
        let mut grouped: BTreeMap<String, usize> = BTreeMap::new();
        for (name, var) in &self.params {
            let key = match mode {
                SummaryMode::Top => name.split('.').next().unwrap_or(name),
                SummaryMode::Full => name.as_str(),
            };
            *grouped.entry(key.to_string()).or_default() += var.elem_count();
        }

        let rows: Vec<SummaryRow> = grouped
            .into_iter()
            .map(|(name, n_params)| SummaryRow { name, n_params })
            .collect();
        let total_params = rows.iter().map(|r| r.n_params).sum();
        Ok(ModelSummary {
            mode,
            rows,
            total_params,
        })
    }

    fn write_report(&self) -> Result<PathBuf> {
        let dir = self.logger.log_dir();
        fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);

        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, &self.epoch_summary.get_dict_summary())?;
        writer.flush()?;

        debug!(path = %path.display(), "wrote metrics report");
        Ok(path)
    }
}

/// Every variable in `varmap` except batch-norm running statistics.
fn trainable_params(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| Error::InvalidState("parameter store lock poisoned".into()))?;
    let mut params: Vec<(String, Var)> = vars
        .iter()
        .filter(|(name, _)| !BUFFER_SUFFIXES.iter().any(|s| name.ends_with(s)))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

/// Sample standard deviation over all elements; NaN for fewer than two.
fn unbiased_std(t: &Tensor) -> Result<f64> {
    let n = t.elem_count();
    if n < 2 {
        return Ok(f64::NAN);
    }
    let t = t.to_dtype(DType::F64)?;
    let centered = t.broadcast_sub(&t.mean_all()?)?;
    let ss = scalar(&centered.sqr()?.sum_all()?)?;
    Ok((ss / (n - 1) as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::mae;
    use candle_nn::{linear, Linear, Module};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Regressor {
        head: Linear,
    }

    impl Model for Regressor {
        type Input = Tensor;

        fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(self.head.forward(input)?)
        }
    }

    impl BuildModel for Regressor {
        type Config = usize;

        fn build(in_dim: &usize, vb: VarBuilder) -> Result<Self> {
            Ok(Self {
                head: linear(*in_dim, 1, vb.pp("head"))?,
            })
        }
    }

    type Records = Rc<RefCell<Vec<(BTreeMap<String, f64>, usize)>>>;

    struct RecordingLogger {
        dir: PathBuf,
        records: Records,
    }

    impl ExperimentLogger for RecordingLogger {
        fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
            self.records.borrow_mut().push((metrics.clone(), step));
            Ok(())
        }

        fn log_dir(&self) -> &Path {
            &self.dir
        }
    }

    fn data(device: &Device) -> (Tensor, Tensor) {
        let x = Tensor::new(
            &[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, -1.0], [-1.0, 0.5], [0.5, 2.0]],
            device,
        )
        .unwrap();
        // y = x0 - 2 x1
        let y = Tensor::new(&[[1f32], [-2.0], [-1.0], [4.0], [-2.0], [-3.5]], device).unwrap();
        (x, y)
    }

    fn predictor(
        config: PredictorConfig,
        metrics: Metrics,
        dir: &Path,
    ) -> (Predictor<Regressor>, Records) {
        let records = Records::default();
        let logger = RecordingLogger {
            dir: dir.to_path_buf(),
            records: records.clone(),
        };
        let p = Predictor::new(&2, config, metrics, Box::new(logger), &Device::Cpu).unwrap();
        (p, records)
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let config = PredictorConfig::default()
            .with_optim(crate::config::OptimConfig::default().with_lr(0.05));
        let (mut p, _) = predictor(config, Metrics::new(), dir.path());
        let (x, y) = data(&Device::Cpu);

        let first = p
            .on_batch(Phase::Train, Batch::new(x.clone(), y.clone()))
            .unwrap()
            .loss
            .unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = p
                .on_batch(Phase::Train, Batch::new(x.clone(), y.clone()))
                .unwrap()
                .loss
                .unwrap();
        }
        assert!(last < first, "loss went from {first} to {last}");
        assert_eq!(p.global_step(), 201);

        let logs = p.on_phase_end(Phase::Train).unwrap();
        assert!(logs.contains_key("MSELoss/train"));
        assert!(logs.contains_key("loss/train"));
        assert!(logs.contains_key("mean_pred/train"));
        assert!(logs.contains_key("std_pred/train"));
        let train = p.epoch_summary().get_results(Phase::Train).unwrap();
        assert_eq!(train.predictions.dims(), &[6 * 201, 1]);
    }

    #[test]
    fn test_lifecycle_misuse() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = predictor(PredictorConfig::default(), Metrics::new(), dir.path());
        let (x, y) = data(&Device::Cpu);

        assert!(matches!(p.on_phase_end(Phase::Val), Err(Error::InvalidState(_))));
        p.on_batch(Phase::Train, Batch::new(x.clone(), y.clone())).unwrap();
        assert_eq!(p.state(), Lifecycle::InPhase(Phase::Train));

        let err = p.on_batch(Phase::Val, Batch::new(x.clone(), y.clone()));
        assert!(matches!(err, Err(Error::InvalidState(_))));
        assert!(matches!(p.on_epoch_end(), Err(Error::InvalidState(_))));
        assert!(matches!(p.on_phase_end(Phase::Test), Err(Error::InvalidState(_))));

        p.on_phase_end(Phase::Train).unwrap();
        assert_eq!(p.state(), Lifecycle::Idle);
    }

    #[test]
    fn test_val_phase_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = Metrics::new();
        metrics.insert("mae".into(), Box::new(mae));
        let config = PredictorConfig::default().with_metrics_on_progress_bar(vec!["mae".into()]);
        let (mut p, records) = predictor(config, metrics, dir.path());
        let (x, y) = data(&Device::Cpu);

        let out = p.on_batch(Phase::Val, Batch::new(x.clone(), y.clone())).unwrap();
        assert!(out.loss.is_none());
        assert_eq!(p.global_step(), 0);

        let logs = p.on_phase_end(Phase::Val).unwrap();
        assert_eq!(logs["lr"], 1e-3);
        assert_eq!(logs["n_epochs"], 0.0);
        assert!(logs.contains_key("mae/val"));
        assert_eq!(records.borrow().len(), 1);

        let bar = p.progress_bar_metrics().unwrap();
        assert_eq!(bar.len(), 2);
        assert_eq!(bar["loss/val"], logs["loss/val"]);

        let text = fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap();
        let report: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(report["metric_summaries"]["val"]["n_epochs"], 0);
        assert!(report["best_epoch_metric_summaries"]["val"]["mae/val"].is_number());

        p.on_epoch_end().unwrap();
        assert_eq!(p.current_epoch(), 1);
    }

    #[test]
    fn test_failing_metric_becomes_nan() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = Metrics::new();
        metrics.insert(
            "broken".into(),
            Box::new(|_: &Tensor, _: &Tensor| -> Result<f64> {
                Err(Error::InvalidState("boom".into()))
            }),
        );
        let (mut p, _) = predictor(PredictorConfig::default(), metrics, dir.path());
        let (x, y) = data(&Device::Cpu);

        let out = p.on_batch(Phase::Train, Batch::new(x, y)).unwrap();
        assert!(out.logs["broken/train"].is_nan());
        assert!(out.loss.unwrap().is_finite());
    }

    #[test]
    fn test_nan_targets_only_affect_loss_under_policy() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let (x, _) = data(&device);
        let y = Tensor::new(&[[1f32], [f32::NAN], [-1.0], [4.0], [-2.0], [-3.5]], &device).unwrap();

        let (keep, _) = predictor(PredictorConfig::default(), Metrics::new(), dir.path());
        let preds = keep.model().forward_t(&x, false).unwrap();
        assert!(scalar(&keep.compute_loss(&preds, &y).unwrap()).unwrap().is_nan());

        let mut metrics = Metrics::new();
        metrics.insert("mae".into(), Box::new(mae));
        let config = PredictorConfig::default().with_target_nan_mask(TargetNanMask::Ignore);
        let (ignore, _) = predictor(config, metrics, dir.path());
        let preds = ignore.model().forward_t(&x, false).unwrap();
        let logs = ignore.get_metrics_logs(&preds, &y, Phase::Val, None).unwrap();
        assert!(logs["MSELoss/val"].is_finite());
        // metrics see the raw targets
        assert!(logs["mae/val"].is_nan());
    }

    #[test]
    fn test_plateau_reduces_lr_at_epoch_end() {
        let dir = tempfile::tempdir().unwrap();
        let plateau = crate::config::PlateauConfig::default().with_patience(0);
        let config = PredictorConfig::default().with_lr_reduce_on_plateau(plateau);
        let (mut p, _) = predictor(config, Metrics::new(), dir.path());
        let (x, y) = data(&Device::Cpu);

        // weights never change, so the validation loss is flat
        for _ in 0..2 {
            p.on_batch(Phase::Val, Batch::new(x.clone(), y.clone())).unwrap();
            p.on_phase_end(Phase::Val).unwrap();
            p.on_epoch_end().unwrap();
        }
        assert!((p.learning_rate() - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_missing_monitor_strictness() {
        let dir = tempfile::tempdir().unwrap();
        let (x, y) = data(&Device::Cpu);

        let (mut strict, _) = predictor(PredictorConfig::default(), Metrics::new(), dir.path());
        strict.on_batch(Phase::Train, Batch::new(x.clone(), y.clone())).unwrap();
        strict.on_phase_end(Phase::Train).unwrap();
        assert!(matches!(
            strict.on_epoch_end(),
            Err(Error::MetricNotFound(ref m)) if m == "loss/val"
        ));

        let config = PredictorConfig::default()
            .with_scheduler(SchedulerConfig::default().with_strict(false));
        let (mut lenient, _) = predictor(config, Metrics::new(), dir.path());
        lenient.on_batch(Phase::Train, Batch::new(x, y)).unwrap();
        lenient.on_phase_end(Phase::Train).unwrap();
        lenient.on_epoch_end().unwrap();
        assert_eq!(lenient.current_epoch(), 1);
    }

    fn constant(_: &Tensor, _: &Tensor) -> Result<f64> {
        Ok(1.0)
    }

    fn head_weight(p: &Predictor<Regressor>) -> Vec<Vec<f32>> {
        p.varmap().data().lock().unwrap()["head.weight"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap()
    }

    #[test]
    fn test_step_interval_respects_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = Metrics::new();
        metrics.insert("flat".into(), Box::new(constant));
        let config = PredictorConfig::default()
            .with_lr_reduce_on_plateau(crate::config::PlateauConfig::default().with_patience(0))
            .with_scheduler(
                SchedulerConfig::default()
                    .with_monitor("flat/train")
                    .with_interval(Interval::Step)
                    .with_frequency(2),
            );
        let (mut p, _) = predictor(config, metrics, dir.path());
        let (x, y) = data(&Device::Cpu);

        // steps 1..3: the scheduler sees the flat metric once (at step 2) and
        // records it as the best value
        for _ in 0..3 {
            p.on_batch(Phase::Train, Batch::new(x.clone(), y.clone())).unwrap();
        }
        assert_eq!(p.learning_rate(), 1e-3);

        // step 4: second observation, no improvement, patience 0
        p.on_batch(Phase::Train, Batch::new(x.clone(), y.clone())).unwrap();
        assert!((p.learning_rate() - 5e-4).abs() < 1e-12);
        assert_eq!(p.global_step(), 4);
    }

    #[test]
    fn test_strict_step_monitor_failure_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = PredictorConfig::default()
            .with_scheduler(SchedulerConfig::default().with_interval(Interval::Step));
        let (mut p, records) = predictor(config, Metrics::new(), dir.path());
        let (x, y) = data(&Device::Cpu);
        let before = head_weight(&p);

        let err = p.on_batch(Phase::Train, Batch::new(x.clone(), y.clone()));
        assert!(matches!(err, Err(Error::MetricNotFound(ref m)) if m == "loss/val"));
        assert_eq!(p.global_step(), 0);
        assert_eq!(p.state(), Lifecycle::Idle);
        assert_eq!(head_weight(&p), before);
        assert!(records.borrow().is_empty());

        // nothing was buffered: a validation phase sees exactly its own batch
        p.on_batch(Phase::Val, Batch::new(x, y)).unwrap();
        p.on_phase_end(Phase::Val).unwrap();
        let val = p.epoch_summary().get_results(Phase::Val).unwrap();
        assert_eq!(val.predictions.dims(), &[6, 1]);

        // once loss/val is known the step-interval scheduler runs
        let (x, y) = data(&Device::Cpu);
        p.on_batch(Phase::Train, Batch::new(x, y)).unwrap();
        assert_eq!(p.global_step(), 1);
    }

    #[test]
    fn test_monitor_must_name_a_logged_metric() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = SchedulerConfig::default().with_monitor("pearsonr/val");

        let logger = TracingLogger::new(dir.path());
        let config = PredictorConfig::default().with_scheduler(scheduler.clone());
        let err =
            Predictor::<Regressor>::new(&2, config, Metrics::new(), Box::new(logger), &Device::Cpu);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));

        let mut metrics = Metrics::new();
        metrics.insert("pearsonr".into(), Box::new(crate::metrics::pearsonr));
        let config = PredictorConfig::default().with_scheduler(scheduler);
        predictor(config, metrics, dir.path());

        for monitor in ["MSELoss/val", "std_pred/val"] {
            let config = PredictorConfig::default()
                .with_scheduler(SchedulerConfig::default().with_monitor(monitor));
            predictor(config, Metrics::new(), dir.path());
        }
    }

    struct Unreduced;

    impl Loss for Unreduced {
        fn forward(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
            Ok((preds - targets)?.abs()?)
        }

        fn name(&self) -> &str {
            "Unreduced"
        }
    }

    #[test]
    fn test_failed_phase_end_keeps_phase_open() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = predictor(PredictorConfig::default(), Metrics::new(), dir.path());
        let mut p = p.with_loss(LossFn::custom(Unreduced));
        let (x, y) = data(&Device::Cpu);

        p.on_batch(Phase::Val, Batch::new(x.clone(), y.clone())).unwrap();
        p.on_batch(Phase::Val, Batch::new(x, y)).unwrap();
        assert!(matches!(p.on_phase_end(Phase::Val), Err(Error::InvalidConfig(_))));
        assert_eq!(p.state(), Lifecycle::InPhase(Phase::Val));
        assert!(p.epoch_summary().get_results(Phase::Val).is_err());

        let mut p = p.with_loss(crate::loss::StandardLoss::Mse);
        p.on_phase_end(Phase::Val).unwrap();
        assert_eq!(p.state(), Lifecycle::Idle);
        let val = p.epoch_summary().get_results(Phase::Val).unwrap();
        assert_eq!(val.predictions.dims(), &[12, 1]);
    }

    #[test]
    fn test_weight_decay_reaches_optimizer() {
        // Zero inputs give the weight a zero gradient, so only decoupled decay
        // moves it: w <- w * (1 - lr * weight_decay).
        let device = Device::Cpu;
        let x = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let y = Tensor::ones((4, 1), DType::F32, &device).unwrap();

        for (weight_decay, expected) in [(0.0, 1.0f32), (0.5, 0.95)] {
            let dir = tempfile::tempdir().unwrap();
            let optim = crate::config::OptimConfig::default()
                .with_lr(0.1)
                .with_weight_decay(weight_decay);
            let config = PredictorConfig::default().with_optim(optim);
            let (mut p, _) = predictor(config, Metrics::new(), dir.path());
            p.varmap().data().lock().unwrap()["head.weight"]
                .set(&Tensor::ones((1, 2), DType::F32, &device).unwrap())
                .unwrap();

            p.on_batch(Phase::Train, Batch::new(x.clone(), y.clone())).unwrap();
            for w in head_weight(&p).concat() {
                assert!((w - expected).abs() < 1e-6, "decay {weight_decay}: {w}");
            }
        }
    }

    #[test]
    fn test_n_params_skips_running_statistics() {
        struct Normalized {
            head: Linear,
            _norm: candle_nn::BatchNorm,
        }

        impl Model for Normalized {
            type Input = Tensor;

            fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
                Ok(self.head.forward(input)?)
            }
        }

        impl BuildModel for Normalized {
            type Config = ();

            fn build(_: &(), vb: VarBuilder) -> Result<Self> {
                Ok(Self {
                    head: linear(2, 1, vb.pp("head"))?,
                    _norm: candle_nn::batch_norm(
                        4,
                        candle_nn::BatchNormConfig::default(),
                        vb.pp("bn"),
                    )?,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let logger = TracingLogger::new(dir.path());
        let p = Predictor::<Normalized>::new(
            &(),
            PredictorConfig::default(),
            Metrics::new(),
            Box::new(logger),
            &Device::Cpu,
        )
        .unwrap();

        // head: 2 + 1, bn weight and bias: 4 + 4
        assert_eq!(p.n_params(), 11);
        assert_eq!(p.varmap().all_vars().len(), 6);
        let full = p.summarize(SummaryMode::Full).unwrap();
        assert!(full.rows.iter().all(|r| !r.name.contains("running")));
        assert_eq!(full.total_params, 11);
    }

    #[test]
    fn test_unknown_loss_name() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TracingLogger::new(dir.path());
        let config = PredictorConfig::default().with_loss_fun("huber");
        let err =
            Predictor::<Regressor>::new(&2, config, Metrics::new(), Box::new(logger), &Device::Cpu);
        assert!(matches!(err, Err(Error::UnknownName { kind: "loss", .. })));
    }

    #[test]
    fn test_summarize_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = predictor(PredictorConfig::default(), Metrics::new(), dir.path());

        let top = p.summarize(SummaryMode::Top).unwrap();
        assert_eq!(top.rows, vec![SummaryRow { name: "head".into(), n_params: 3 }]);
        assert_eq!(top.total_params, p.n_params());

        let full = p.summarize("2".parse().unwrap()).unwrap();
        assert_eq!(full.rows.len(), 2);
        assert_eq!(full.total_params, 3);
        assert!(full.to_string().contains("head.weight"));

        assert!(matches!("3".parse::<SummaryMode>(), Err(Error::InvalidConfig(_))));
        assert!(SummaryMode::try_from(0u8).is_err());
        assert_eq!(SummaryMode::try_from(1u8).unwrap(), SummaryMode::Top);
    }
}
