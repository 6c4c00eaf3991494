use ndarray::ArrayView2;
use tracing::warn;

use crate::error::{HoiError, Result};
use crate::ops::sigmoid;

const LOG_FLOOR: f32 = -100.0;

/// Mean binary cross-entropy of `prior * sigmoid(logits)` against `labels`.
///
/// Entries whose prior is zero cannot be predicted and are left out of the mean.
pub fn interaction_loss(
    logits: ArrayView2<f32>,
    prior: ArrayView2<f32>,
    labels: ArrayView2<f32>,
) -> Result<f32> {
    if logits.dim() != prior.dim() || labels.dim() != prior.dim() {
        return Err(HoiError::invalid(format!(
            "logits {:?}, prior {:?} and labels {:?} disagree",
            logits.dim(),
            prior.dim(),
            labels.dim()
        )));
    }

    let mut total = 0.0f64;
    let mut count = 0usize;
    for ((&x, &p), &y) in logits.iter().zip(prior.iter()).zip(labels.iter()) {
        if p == 0.0 {
            continue;
        }
        let prob = p * sigmoid(x);
        let log_p = prob.ln().max(LOG_FLOOR);
        let log_q = (1.0 - prob).ln().max(LOG_FLOOR);
        total -= (y * log_p + (1.0 - y) * log_q) as f64;
        count += 1;
    }

    if count == 0 {
        warn!("event" = "loss.empty", pairs = prior.nrows());
        return Ok(0.0);
    }
    Ok((total / count as f64) as f32)
}
