use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::index;
use rand::Rng;
use tracing::debug;

use crate::detection::GroundTruthPairs;
use crate::error::{HoiError, Result};
use crate::ops::box_iou;

/// Binary `[M, K]` interaction labels for candidate box pairs.
///
/// A candidate matches a ground-truth pair when both its human box and its object
/// box overlap the annotated ones by at least `fg_iou_thresh`. Each match sets the
/// annotated interaction, so a candidate can carry several labels.
pub fn assign_labels(
    boxes_h: ArrayView2<f32>,
    boxes_o: ArrayView2<f32>,
    targets: &GroundTruthPairs,
    fg_iou_thresh: f32,
    num_classes: usize,
) -> Result<Array2<f32>> {
    if boxes_h.ncols() != 4 || boxes_o.ncols() != 4 || boxes_h.nrows() != boxes_o.nrows() {
        return Err(HoiError::invalid(format!(
            "human boxes {:?} and object boxes {:?} do not pair up",
            boxes_h.dim(),
            boxes_o.dim()
        )));
    }
    if let Some(&c) = targets.hoi.iter().find(|&&c| c >= num_classes) {
        return Err(HoiError::invalid(format!("interaction {c} outside {num_classes} classes")));
    }

    let iou_h = box_iou(boxes_h, targets.boxes_h.view());
    let iou_o = box_iou(boxes_o, targets.boxes_o.view());
    let mut labels = Array2::<f32>::zeros((boxes_h.nrows(), num_classes));
    for ((m, g), &overlap_h) in iou_h.indexed_iter() {
        if overlap_h.min(iou_o[[m, g]]) >= fg_iou_thresh {
            labels[[m, targets.hoi[g]]] = 1.0;
        }
    }
    Ok(labels)
}

/// Draws a bounded set of pairs with a fixed share of positives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSampler {
    pub num_pairs_per_image: usize,
    pub positive_fraction: f64,
}

impl PairSampler {
    pub fn new(num_pairs_per_image: usize, positive_fraction: f64) -> Result<Self> {
        if !(positive_fraction > 0.0 && positive_fraction <= 1.0) {
            return Err(HoiError::invalid(format!(
                "positive fraction must be in (0, 1], got {positive_fraction}"
            )));
        }
        Ok(Self { num_pairs_per_image, positive_fraction })
    }

    /// Picks the pairs to train on, positives first.
    ///
    /// Short of positives, all of them are kept and negatives are drawn at the
    /// configured ratio to that count instead of filling up to the pair budget.
    pub fn subsample<R: Rng + ?Sized>(&self, labels: ArrayView2<f32>, rng: &mut R) -> Vec<usize> {
        let (positives, negatives): (Vec<usize>, Vec<usize>) = labels
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, row)| (i, row.iter().any(|&v| v != 0.0)))
            .fold((Vec::new(), Vec::new()), |(mut pos, mut neg), (i, is_pos)| {
                if is_pos { pos.push(i) } else { neg.push(i) }
                (pos, neg)
            });

        let fraction = self.positive_fraction;
        let target = self.num_pairs_per_image as f64 * fraction;

        let sampled = if (positives.len() as f64) < target {
            let num_neg = (positives.len() as f64 * (1.0 - fraction) / fraction).floor() as usize;
            let mut keep = positives.clone();
            keep.extend(draw(&negatives, num_neg, rng));
            keep
        } else {
            let num_pos = target.round() as usize;
            let num_neg = self.num_pairs_per_image.saturating_sub(num_pos);
            let mut keep = draw(&positives, num_pos, rng);
            keep.extend(draw(&negatives, num_neg, rng));
            keep
        };

        debug!(
            "event" = "sampler.subsample",
            positives = positives.len(),
            negatives = negatives.len(),
            sampled = sampled.len()
        );
        sampled
    }
}

fn draw<R: Rng + ?Sized>(pool: &[usize], amount: usize, rng: &mut R) -> Vec<usize> {
    let amount = amount.min(pool.len());
    index::sample(rng, pool.len(), amount).into_iter().map(|i| pool[i]).collect()
}
