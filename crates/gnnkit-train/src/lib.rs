//! Losses, epoch bookkeeping and the training loop for gnnkit models.
//!
//! # Modules
//!
//! - [`loss`]: named standard losses and the hybrid bracket CE/regression loss
//! - [`nan_mask`]: NaN target policy applied before the loss
//! - [`metrics`]: metric trait and built-in metrics
//! - [`summary`]: per-phase epoch results and best-epoch tracking
//! - [`scheduler`]: reduce-on-plateau learning-rate control
//! - [`config`]: serde-loadable predictor configuration
//! - [`predictor`]: the orchestrator tying all of the above to a model
//!
//! # Example
//!
//! ```rust,ignore
//! use gnnkit_train::{Batch, Phase, Predictor, PredictorConfig, TracingLogger};
//!
//! let mut predictor = Predictor::<MyModel>::new(
//!     &model_config,
//!     PredictorConfig::default().with_loss_fun("mae"),
//!     Metrics::new(),
//!     Box::new(TracingLogger::new("runs/exp0")),
//!     &Device::Cpu,
//! )?;
//!
//! for batch in train_batches {
//!     predictor.on_batch(Phase::Train, batch)?;
//! }
//! predictor.on_phase_end(Phase::Train)?;
//! predictor.on_epoch_end()?;
//! ```

pub mod config;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod nan_mask;
pub mod predictor;
pub mod scheduler;
pub mod summary;

pub use config::{Interval, OptimConfig, PlateauConfig, PlateauMode, PredictorConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use loss::{HybridCeLoss, Loss, LossFn, Reduction, RegressionLoss, StandardLoss};
pub use metrics::{Metric, Metrics};
pub use nan_mask::TargetNanMask;
pub use predictor::{
    Batch, BuildModel, ExperimentLogger, Lifecycle, Model, ModelSummary, Predictor, StepOutput,
    SummaryMode, SummaryRow, TracingLogger, REPORT_FILE,
};
pub use scheduler::ReduceLrOnPlateau;
pub use summary::{EpochResults, EpochSummary, Phase};
