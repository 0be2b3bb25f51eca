//! Neighborhood aggregators and degree scalers (Principal Neighbourhood Aggregation).
//!
//! A single aggregator loses information: `mean` cannot count, `sum` cannot
//! normalize, `max` ignores everything but the extreme. PNA (Corso et al.,
//! 2020) combines several reducers and rescales them by node degree.
//!
//! # Aggregators
//!
//! Every aggregator reduces a mailbox `h` of shape `(B, K, F)`, B nodes each
//! with K neighbor messages of F features, over the neighbor axis to `(B, F)`.
//!
//! | Name | Formula |
//! |------|---------|
//! | mean | E\[h\] |
//! | sum | Σ h |
//! | max / min | elementwise extreme |
//! | var | relu(E\[h²\] − E\[h\]²) |
//! | std | sqrt(var + ε) |
//! | momentN | sign(m)·(\|m\| + ε)^(1/N), m = E\[(h − E\[h\])^N\] |
//!
//! # Scalers
//!
//! | Name | Factor |
//! |------|--------|
//! | identity | 1 |
//! | amplification | log(D+1) / avg_log |
//! | attenuation | avg_log / log(D+1) |
//!
//! where `avg_log` is the training-set mean of `log(D+1)`.
//!
//! # Reference
//!
//! Corso et al., "Principal Neighbourhood Aggregation for Graph Nets",
//! NeurIPS 2020.

use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::Graph;

/// Stabilizer added before square and fractional roots.
pub const EPS: f64 = 1e-5;

pub fn aggregate_mean(h: &Tensor) -> Result<Tensor> {
    Ok(h.mean(1)?)
}

pub fn aggregate_sum(h: &Tensor) -> Result<Tensor> {
    Ok(h.sum(1)?)
}

pub fn aggregate_max(h: &Tensor) -> Result<Tensor> {
    Ok(h.max(1)?)
}

pub fn aggregate_min(h: &Tensor) -> Result<Tensor> {
    Ok(h.min(1)?)
}

/// Variance over the neighbor axis, clamped at zero.
///
/// `E[h²] − E[h]²` can come out slightly negative in floating point.
pub fn aggregate_var(h: &Tensor) -> Result<Tensor> {
    let mean_squares = h.sqr()?.mean(D::Minus2)?;
    let mean = h.mean(D::Minus2)?;
    Ok((mean_squares - mean.sqr()?)?.relu()?)
}

/// Standard deviation `sqrt(var + EPS)`; the bias keeps the gradient finite at zero variance.
pub fn aggregate_std(h: &Tensor) -> Result<Tensor> {
    Ok((aggregate_var(h)? + EPS)?.sqrt()?)
}

/// Signed n-th root of the n-th centered moment.
///
/// The root is taken of `|m| + EPS` and the sign restored afterwards, so
/// negative odd moments stay real and keep their sign.
pub fn aggregate_moment(h: &Tensor, n: usize) -> Result<Tensor> {
    if n == 0 {
        return Err(Error::InvalidConfig("moment order must be >= 1".into()));
    }
    let centered = h.broadcast_sub(&h.mean_keepdim(1)?)?;
    let mut power = centered.clone();
    for _ in 1..n {
        power = (&power * &centered)?;
    }
    let moment = power.mean(1)?;

    let zeros = moment.zeros_like()?;
    let sign = (moment.gt(&zeros)?.to_dtype(moment.dtype())?
        - moment.lt(&zeros)?.to_dtype(moment.dtype())?)?;
    let rooted = (moment.abs()? + EPS)?.powf(1.0 / n as f64)?;
    Ok((sign * rooted)?)
}

pub fn aggregate_moment_3(h: &Tensor) -> Result<Tensor> {
    aggregate_moment(h, 3)
}

pub fn aggregate_moment_4(h: &Tensor) -> Result<Tensor> {
    aggregate_moment(h, 4)
}

pub fn aggregate_moment_5(h: &Tensor) -> Result<Tensor> {
    aggregate_moment(h, 5)
}

/// Degree statistics of the training set consumed by the scalers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageDegree {
    /// Mean of `ln(D + 1)` over every node of the training graphs.
    pub log: f64,
}

impl AverageDegree {
    pub fn new(log: f64) -> Self {
        Self { log }
    }

    /// Average `ln(D + 1)` over all nodes of all graphs.
    pub fn from_graphs<'a>(graphs: impl IntoIterator<Item = &'a Graph>) -> Result<Self> {
        let mut total = 0.0;
        let mut count = 0usize;
        for g in graphs {
            for &d in g.in_degrees() {
                total += (d as f64 + 1.0).ln();
                count += 1;
            }
        }
        if count == 0 {
            return Err(Error::InvalidConfig(
                "cannot average degrees over an empty training set".into(),
            ));
        }
        Ok(Self {
            log: total / count as f64,
        })
    }
}

pub fn scale_identity(h: &Tensor) -> Result<Tensor> {
    Ok(h.clone())
}

/// Multiply by `ln(D+1) / avg.log`: nodes above the average degree are amplified.
pub fn scale_amplification(h: &Tensor, degree: f64, avg: &AverageDegree) -> Result<Tensor> {
    Ok((h * Scaler::Amplification.factor(degree, avg))?)
}

/// Multiply by `avg.log / ln(D+1)`: nodes above the average degree are dampened.
///
/// Undefined for `degree == 0`; callers skip isolated nodes.
pub fn scale_attenuation(h: &Tensor, degree: f64, avg: &AverageDegree) -> Result<Tensor> {
    Ok((h * Scaler::Attenuation.factor(degree, avg))?)
}

/// Neighborhood reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Aggregator {
    Mean,
    Sum,
    Max,
    Min,
    Std,
    Var,
    Moment3,
    Moment4,
    Moment5,
}

impl Aggregator {
    pub const ALL: [Aggregator; 9] = [
        Aggregator::Mean,
        Aggregator::Sum,
        Aggregator::Max,
        Aggregator::Min,
        Aggregator::Std,
        Aggregator::Var,
        Aggregator::Moment3,
        Aggregator::Moment4,
        Aggregator::Moment5,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Aggregator::Mean => "mean",
            Aggregator::Sum => "sum",
            Aggregator::Max => "max",
            Aggregator::Min => "min",
            Aggregator::Std => "std",
            Aggregator::Var => "var",
            Aggregator::Moment3 => "moment3",
            Aggregator::Moment4 => "moment4",
            Aggregator::Moment5 => "moment5",
        }
    }

    /// Reduce a `(B, K, F)` mailbox to `(B, F)`.
    pub fn apply(&self, h: &Tensor) -> Result<Tensor> {
        match self {
            Aggregator::Mean => aggregate_mean(h),
            Aggregator::Sum => aggregate_sum(h),
            Aggregator::Max => aggregate_max(h),
            Aggregator::Min => aggregate_min(h),
            Aggregator::Std => aggregate_std(h),
            Aggregator::Var => aggregate_var(h),
            Aggregator::Moment3 => aggregate_moment_3(h),
            Aggregator::Moment4 => aggregate_moment_4(h),
            Aggregator::Moment5 => aggregate_moment_5(h),
        }
    }
}

impl FromStr for Aggregator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Aggregator::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| Error::UnknownName {
                kind: "aggregator",
                name: s.to_string(),
            })
    }
}

impl TryFrom<String> for Aggregator {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Aggregator> for String {
    fn from(a: Aggregator) -> Self {
        a.name().to_string()
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Degree-dependent rescaling of aggregated features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scaler {
    Identity,
    Amplification,
    Attenuation,
}

impl Scaler {
    pub const ALL: [Scaler; 3] = [Scaler::Identity, Scaler::Amplification, Scaler::Attenuation];

    pub fn name(&self) -> &'static str {
        match self {
            Scaler::Identity => "identity",
            Scaler::Amplification => "amplification",
            Scaler::Attenuation => "attenuation",
        }
    }

    /// Multiplier applied to a node of degree `degree`.
    pub fn factor(&self, degree: f64, avg: &AverageDegree) -> f64 {
        let log_d = (degree + 1.0).ln();
        match self {
            Scaler::Identity => 1.0,
            Scaler::Amplification => log_d / avg.log,
            Scaler::Attenuation => avg.log / log_d,
        }
    }

    pub fn apply(&self, h: &Tensor, degree: f64, avg: &AverageDegree) -> Result<Tensor> {
        match self {
            Scaler::Identity => scale_identity(h),
            Scaler::Amplification => scale_amplification(h, degree, avg),
            Scaler::Attenuation => scale_attenuation(h, degree, avg),
        }
    }
}

impl FromStr for Scaler {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Scaler::ALL
            .iter()
            .copied()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| Error::UnknownName {
                kind: "scaler",
                name: s.to_string(),
            })
    }
}

impl TryFrom<String> for Scaler {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Scaler> for String {
    fn from(s: Scaler) -> Self {
        s.name().to_string()
    }
}

impl fmt::Display for Scaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
