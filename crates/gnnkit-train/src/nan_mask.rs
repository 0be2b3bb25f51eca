//! NaN handling for regression targets.
//!
//! The policy is applied to the primary loss only. Metrics always receive the
//! raw predictions and targets.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to do with NaN entries of the target tensor before computing the loss.
///
/// Deserializes from `null` ([`Keep`](TargetNanMask::Keep)), a number
/// ([`Fill`](TargetNanMask::Fill)) or the string `"ignore"`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<MaskRepr>", into = "Option<MaskRepr>")]
pub enum TargetNanMask {
    /// Leave targets untouched.
    #[default]
    Keep,
    /// Replace NaN targets with a constant.
    Fill(f64),
    /// Drop every position whose target is NaN, from both tensors.
    Ignore,
}

impl TargetNanMask {
    /// Apply the policy, returning the tensors the loss should see.
    ///
    /// [`Ignore`](TargetNanMask::Ignore) flattens both tensors; they must
    /// hold the same number of elements.
    pub fn apply(&self, preds: &Tensor, targets: &Tensor) -> Result<(Tensor, Tensor)> {
        match *self {
            TargetNanMask::Keep => Ok((preds.clone(), targets.clone())),
            TargetNanMask::Fill(value) => {
                let nans = targets.ne(targets)?;
                let fill = (targets.zeros_like()? + value)?;
                Ok((preds.clone(), nans.where_cond(&fill, targets)?))
            }
            TargetNanMask::Ignore => {
                let preds = preds.flatten_all()?;
                let targets = targets.flatten_all()?;
                if preds.elem_count() != targets.elem_count() {
                    return Err(Error::Nn(gnnkit_nn::Error::DimensionMismatch {
                        expected: targets.elem_count(),
                        got: preds.elem_count(),
                    }));
                }
                let nans = targets.ne(&targets)?.to_vec1::<u8>()?;
                let keep: Vec<u32> = nans
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &nan)| (nan == 0).then_some(i as u32))
                    .collect();
                let n = keep.len();
                let keep = Tensor::from_vec(keep, n, targets.device())?;
                Ok((preds.index_select(&keep, 0)?, targets.index_select(&keep, 0)?))
            }
        }
    }
}

impl FromStr for TargetNanMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "null" => Ok(TargetNanMask::Keep),
            "ignore" => Ok(TargetNanMask::Ignore),
            _ => match s.parse::<f64>() {
                Ok(v) if !v.is_nan() => Ok(TargetNanMask::Fill(v)),
                _ => Err(Error::InvalidConfig(format!(
                    "target_nan_mask must be none, a number or \"ignore\", got {s:?}"
                ))),
            },
        }
    }
}

impl fmt::Display for TargetNanMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetNanMask::Keep => f.write_str("none"),
            TargetNanMask::Fill(v) => write!(f, "{v}"),
            TargetNanMask::Ignore => f.write_str("ignore"),
        }
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaskRepr {
    Value(f64),
    Name(String),
}

impl TryFrom<Option<MaskRepr>> for TargetNanMask {
    type Error = Error;

    fn try_from(repr: Option<MaskRepr>) -> Result<Self> {
        match repr {
            None => Ok(TargetNanMask::Keep),
            Some(MaskRepr::Value(v)) if !v.is_nan() => Ok(TargetNanMask::Fill(v)),
            Some(MaskRepr::Value(v)) => Err(Error::InvalidConfig(format!(
                "target_nan_mask fill value must not be NaN, got {v}"
            ))),
            Some(MaskRepr::Name(name)) => name.parse(),
        }
    }
}

impl From<TargetNanMask> for Option<MaskRepr> {
    fn from(mask: TargetNanMask) -> Self {
        match mask {
            TargetNanMask::Keep => None,
            TargetNanMask::Fill(v) => Some(MaskRepr::Value(v)),
            TargetNanMask::Ignore => Some(MaskRepr::Name("ignore".into())),
        }
    }
}
