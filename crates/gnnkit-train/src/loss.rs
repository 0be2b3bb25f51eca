//! Loss functions.
//!
//! Two families live here:
//!
//! - [`StandardLoss`]: the small set of losses selectable by name
//!   (`mse`, `bce`, `l1`/`mae`, `cosine`)
//! - [`HybridCeLoss`]: a classification loss over discretized target
//!   brackets mixed with a regression loss on the expected bracket value
//!
//! [`LossFn`] unifies them with any user-supplied [`Loss`].

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A differentiable loss over predictions and targets.
pub trait Loss {
    /// Compute the loss. Reducing losses return a rank-0 tensor.
    fn forward(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Name used as the metric key prefix, e.g. `MSELoss`.
    fn name(&self) -> &str;
}

/// How per-element losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Keep one value per sample.
    None,
    #[default]
    Mean,
    Sum,
}

impl Reduction {
    pub fn reduce(&self, t: Tensor) -> Result<Tensor> {
        Ok(match self {
            Reduction::None => t,
            Reduction::Mean => t.mean_all()?,
            Reduction::Sum => t.sum_all()?,
        })
    }
}

impl FromStr for Reduction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Reduction::None),
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            _ => Err(Error::UnknownName {
                kind: "reduction",
                name: s.to_string(),
            }),
        }
    }
}

/// Losses selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardLoss {
    Mse,
    Bce,
    L1,
    CosineEmbedding,
}

impl StandardLoss {
    /// Registry keys, `mae` being an alias of `l1`.
    pub const NAMES: [&'static str; 5] = ["mse", "bce", "l1", "mae", "cosine"];
}

impl FromStr for StandardLoss {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mse" => Ok(StandardLoss::Mse),
            "bce" => Ok(StandardLoss::Bce),
            "l1" | "mae" => Ok(StandardLoss::L1),
            "cosine" => Ok(StandardLoss::CosineEmbedding),
            _ => Err(Error::UnknownName {
                kind: "loss",
                name: s.to_string(),
            }),
        }
    }
}

impl Loss for StandardLoss {
    fn forward(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        match self {
            StandardLoss::Mse => Ok(candle_nn::loss::mse(preds, targets)?),
            StandardLoss::L1 => Ok((preds - targets)?.abs()?.mean_all()?),
            StandardLoss::Bce => {
                // log is clamped at -100 so saturated probabilities stay finite
                let log_p = preds.log()?.maximum(-100f64)?;
                let log_1mp = preds.affine(-1.0, 1.0)?.log()?.maximum(-100f64)?;
                let pos = (targets * log_p)?;
                let neg = (targets.affine(-1.0, 1.0)? * log_1mp)?;
                Ok((pos + neg)?.mean_all()?.neg()?)
            }
            StandardLoss::CosineEmbedding => {
                let (p, t) = if preds.rank() == 1 {
                    (preds.unsqueeze(0)?, targets.unsqueeze(0)?)
                } else {
                    (preds.clone(), targets.clone())
                };
                let dot = (&p * &t)?.sum(D::Minus1)?;
                let norms = (p.sqr()?.sum(D::Minus1)? * t.sqr()?.sum(D::Minus1)?)?;
                let cos = (dot / (norms + 1e-12)?.sqrt()?)?;
                Ok(cos.affine(-1.0, 1.0)?.mean_all()?)
            }
        }
    }

    fn name(&self) -> &str {
        match self {
            StandardLoss::Mse => "MSELoss",
            StandardLoss::Bce => "BCELoss",
            StandardLoss::L1 => "L1Loss",
            StandardLoss::CosineEmbedding => "CosineEmbeddingLoss",
        }
    }
}

/// Error metric of the regression half of [`HybridCeLoss`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionLoss {
    Mae,
    Mse,
}

impl RegressionLoss {
    fn elementwise(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let diff = (input - target)?;
        Ok(match self {
            RegressionLoss::Mae => diff.abs()?,
            RegressionLoss::Mse => diff.sqr()?,
        })
    }
}

impl FromStr for RegressionLoss {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mae" => Ok(RegressionLoss::Mae),
            "mse" => Ok(RegressionLoss::Mse),
            _ => Err(Error::InvalidConfig(format!(
                "regression loss must be \"mae\" or \"mse\", got {s:?}"
            ))),
        }
    }
}

/// Cross-entropy over target brackets mixed with a regression loss on the
/// expected bracket value.
///
/// ```text
/// loss = α · CE(input, target) + (1 − α) · R(input · brackets, argmax(target))
/// ```
///
/// `input` is read as unnormalized class scores `(N, C)`; the cross-entropy
/// applies a log-softmax over classes and accepts soft targets. With
/// [`Reduction::Mean`] both halves are averaged over the batch.
#[derive(Debug, Clone)]
pub struct HybridCeLoss {
    brackets: Tensor,
    regression_loss: RegressionLoss,
    alpha: f64,
    weight: Option<Tensor>,
    reduction: Reduction,
}

impl HybridCeLoss {
    /// Build the loss.
    ///
    /// Fails when `regression_loss` is not `mae`/`mse`, when `alpha` lies
    /// outside `[0, 1]`, or when `weight` does not hold one entry per bracket.
    pub fn new(
        brackets: &[f64],
        regression_loss: &str,
        alpha: f64,
        weight: Option<&[f64]>,
        reduction: Reduction,
        device: &Device,
    ) -> Result<Self> {
        let regression_loss: RegressionLoss = regression_loss.parse()?;
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidConfig(format!(
                "alpha must be in [0, 1], got {alpha}"
            )));
        }
        if brackets.is_empty() {
            return Err(Error::InvalidConfig("brackets must not be empty".into()));
        }
        let weight = match weight {
            Some(w) if w.len() != brackets.len() => {
                return Err(Error::InvalidConfig(format!(
                    "expected {} class weights, got {}",
                    brackets.len(),
                    w.len()
                )))
            }
            Some(w) => Some(Tensor::from_slice(w, w.len(), device)?),
            None => None,
        };

        Ok(Self {
            brackets: Tensor::from_slice(brackets, brackets.len(), device)?,
            regression_loss,
            alpha,
            weight,
            reduction,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn num_classes(&self) -> usize {
        self.brackets.elem_count()
    }

    /// Weighted soft-target cross-entropy per sample, `(N,)`.
    fn cross_entropy(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let log_p = candle_nn::ops::log_softmax(input, D::Minus1)?;
        let mut per_class = (target * log_p)?;
        if let Some(w) = &self.weight {
            per_class = per_class.broadcast_mul(&w.to_dtype(input.dtype())?)?;
        }
        Ok(per_class.sum(D::Minus1)?.neg()?)
    }

    /// Expected bracket value and target bracket index, both `(N,)`.
    fn regression_terms(&self, input: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
        let brackets = self.brackets.to_dtype(input.dtype())?;
        let regression_input = input.broadcast_mul(&brackets)?.sum(D::Minus1)?;
        let regression_target = target.argmax(D::Minus1)?.to_dtype(input.dtype())?;
        Ok((regression_input, regression_target))
    }
}

impl Loss for HybridCeLoss {
    fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let classes = input.dim(D::Minus1)?;
        if classes != self.num_classes() {
            return Err(Error::Nn(gnnkit_nn::Error::DimensionMismatch {
                expected: self.num_classes(),
                got: classes,
            }));
        }

        let (regression_input, regression_target) = self.regression_terms(input, target)?;
        let regression = self
            .reduction
            .reduce(self.regression_loss.elementwise(&regression_input, &regression_target)?)?;
        let classification = self.reduction.reduce(self.cross_entropy(input, target)?)?;

        Ok(((classification * self.alpha)? + (regression * (1.0 - self.alpha))?)?)
    }

    fn name(&self) -> &str {
        "HybridCELoss"
    }
}

/// Loss used by the predictor.
pub enum LossFn {
    Standard(StandardLoss),
    Hybrid(HybridCeLoss),
    Custom(Box<dyn Loss>),
}

impl LossFn {
    pub fn custom(loss: impl Loss + 'static) -> Self {
        LossFn::Custom(Box::new(loss))
    }
}

impl FromStr for LossFn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(LossFn::Standard(s.parse()?))
    }
}

impl From<StandardLoss> for LossFn {
    fn from(loss: StandardLoss) -> Self {
        LossFn::Standard(loss)
    }
}

impl From<HybridCeLoss> for LossFn {
    fn from(loss: HybridCeLoss) -> Self {
        LossFn::Hybrid(loss)
    }
}

impl Loss for LossFn {
    fn forward(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        match self {
            LossFn::Standard(l) => l.forward(preds, targets),
            LossFn::Hybrid(l) => l.forward(preds, targets),
            LossFn::Custom(l) => l.forward(preds, targets),
        }
    }

    fn name(&self) -> &str {
        match self {
            LossFn::Standard(l) => l.name(),
            LossFn::Hybrid(l) => l.name(),
            LossFn::Custom(l) => l.name(),
        }
    }
}

impl fmt::Debug for LossFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LossFn").field(&self.name()).finish()
    }
}

/// Read a rank-0 tensor as `f64`.
pub(crate) fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
