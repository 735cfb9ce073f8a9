use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossReduction {
    Mean,
    None,
}

/// Cross entropy loss for logits and integer class targets.
///
/// - logits: (B, T, V)
/// - targets: (B, T) with class indices in [0, V) or ignore_index
/// - ignore_index: targets equal to this value are ignored in reduction/averaging
/// - reduction:
///   - Mean: returns scalar (); 0.0 when every target is ignored
///   - None: returns per-position loss with shape (B, T), 0.0 at ignored positions
pub fn cross_entropy_loss(
    logits: &Tensor,
    targets: &Tensor,
    ignore_index: i64,
    reduction: LossReduction,
) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let (tb, tt) = targets.dims2()?;
    if (tb, tt) != (b, t) {
        return Err(Error::shape_mismatch("cross_entropy targets", &[b, t], targets.dims()).into());
    }
    // Cast logits to f32 for stable math
    let logits = logits.to_dtype(DType::F32)?;
    let n = b * t;
    let logits2d = logits.reshape((n, v))?;
    let targets = targets.to_dtype(DType::I64)?.reshape(n)?;

    // valid mask = targets != ignore_index
    let ignore_t = Tensor::full(ignore_index, n, targets.device())?;
    let valid_mask = targets.ne(&ignore_t)?; // u8, 1 = valid
    // Ignored positions gather class 0 so the index stays in range
    let safe_targets = valid_mask.where_cond(&targets, &targets.zeros_like()?)?;

    let (lo, hi) = (
        safe_targets.min_all()?.to_scalar::<i64>()?,
        safe_targets.max_all()?.to_scalar::<i64>()?,
    );
    ensure!(
        lo >= 0 && (hi as usize) < v,
        "targets must lie in [0, {v}) or equal ignore_index {ignore_index}, found range [{lo}, {hi}]"
    );

    // lse = max + log(sum(exp(x - max)))
    let max_logits = logits2d.max(D::Minus1)?; // (N,)
    let shifted = logits2d.broadcast_sub(&max_logits.reshape((n, 1))?)?;
    let sum_exp = shifted.exp()?.sum(D::Minus1)?;
    let lse = max_logits.add(&sum_exp.log()?)?; // (N,)

    let gathered = logits2d
        .gather(&safe_targets.to_dtype(DType::U32)?.reshape((n, 1))?, D::Minus1)?
        .squeeze(D::Minus1)?; // (N,)
    let nll = lse.sub(&gathered)?;
    let nll_masked = valid_mask.where_cond(&nll, &nll.zeros_like()?)?;

    match reduction {
        LossReduction::None => Ok(nll_masked.reshape((b, t))?),
        LossReduction::Mean => {
            let denom = valid_mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
            if denom == 0.0 {
                Ok(Tensor::zeros((), DType::F32, logits.device())?)
            } else {
                Ok((nll_masked.sum_all()? / denom as f64)?)
            }
        }
    }
}
