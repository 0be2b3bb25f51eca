//! Evaluation metrics.
//!
//! A metric is anything that maps `(predictions, targets)` to a scalar.
//! Closures qualify through the blanket impl, so custom metrics need no
//! wrapper type:
//!
//! ```rust,ignore
//! let mut metrics = Metrics::new();
//! metrics.insert("mae".into(), Box::new(gnnkit_train::metrics::mae));
//! metrics.insert("max_err".into(), Box::new(|p: &Tensor, t: &Tensor| {
//!     Ok((p - t)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? as f64)
//! }));
//! ```

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};

use crate::error::{Error, Result};
use crate::loss::scalar;

/// Scalar evaluation metric.
pub trait Metric {
    fn compute(&self, preds: &Tensor, targets: &Tensor) -> Result<f64>;
}

impl<F> Metric for F
where
    F: Fn(&Tensor, &Tensor) -> Result<f64>,
{
    fn compute(&self, preds: &Tensor, targets: &Tensor) -> Result<f64> {
        self(preds, targets)
    }
}

/// Named metrics, evaluated in name order.
pub type Metrics = BTreeMap<String, Box<dyn Metric>>;

/// Mean absolute error.
pub fn mae(preds: &Tensor, targets: &Tensor) -> Result<f64> {
    scalar(&(preds - targets)?.abs()?.mean_all()?)
}

/// Mean squared error.
pub fn mse(preds: &Tensor, targets: &Tensor) -> Result<f64> {
    scalar(&(preds - targets)?.sqr()?.mean_all()?)
}

/// Pearson correlation over all elements. NaN when either side is constant.
pub fn pearsonr(preds: &Tensor, targets: &Tensor) -> Result<f64> {
    let x = preds.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let y = targets.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    if x.len() != y.len() {
        return Err(Error::Nn(gnnkit_nn::Error::DimensionMismatch {
            expected: y.len(),
            got: x.len(),
        }));
    }
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(&y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    Ok(sxy / (sxx * syy).sqrt())
}

/// Fraction of correct predictions.
///
/// Multi-column inputs compare arg-max classes; single-column inputs compare
/// `pred >= 0.5` against `target >= 0.5`.
pub fn accuracy(preds: &Tensor, targets: &Tensor) -> Result<f64> {
    let multiclass = preds.rank() == 2 && preds.dim(1)? > 1;
    let hits = if multiclass {
        let predicted = preds.argmax(D::Minus1)?;
        let actual = if targets.rank() == 2 {
            targets.argmax(D::Minus1)?
        } else {
            targets.to_dtype(DType::U32)?
        };
        predicted.eq(&actual)?
    } else {
        preds.ge(0.5)?.eq(&targets.ge(0.5)?)?
    };
    scalar(&hits.to_dtype(DType::F64)?.mean_all()?)
}

/// Look up a built-in metric by name: `mae`, `mse`, `pearsonr`, `accuracy`.
pub fn builtin(name: &str) -> Result<Box<dyn Metric>> {
    let metric: Box<dyn Metric> = match name {
        "mae" => Box::new(mae),
        "mse" => Box::new(mse),
        "pearsonr" => Box::new(pearsonr),
        "accuracy" => Box::new(accuracy),
        _ => {
            return Err(Error::UnknownName {
                kind: "metric",
                name: name.to_string(),
            })
        }
    };
    Ok(metric)
}
