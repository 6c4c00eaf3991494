//! Sinkhorn-Knopp normalization of pairwise interaction scores.
//!
//! The same human or object box usually takes part in many pairs, which lets one
//! confident box inflate the scores of every pair it appears in. For each
//! interaction class the scores are laid out as a dense human x object matrix and
//! driven towards row and column sums of one.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HoiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkhornKnopp {
    pub max_iterations: usize,
    /// Stop once every nonzero row and column sum is within this distance of one.
    pub tolerance: f32,
}

impl Default for SinkhornKnopp {
    fn default() -> Self {
        Self { max_iterations: 50, tolerance: 1e-5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f32,
}

impl SinkhornKnopp {
    pub fn new(max_iterations: usize, tolerance: f32) -> Self {
        Self { max_iterations, tolerance }
    }

    /// Rescales rows then columns of a non-negative matrix in place.
    ///
    /// All-zero rows and columns are left untouched.
    pub fn normalize(&self, m: &mut Array2<f32>) -> Convergence {
        let mut residual = marginal_residual(m.view());
        if residual < self.tolerance {
            return Convergence { converged: true, iterations: 0, residual };
        }
        for iter in 0..self.max_iterations {
            for mut row in m.rows_mut() {
                let s: f32 = row.sum();
                if s > 0.0 { row /= s; }
            }
            for mut col in m.columns_mut() {
                let s: f32 = col.sum();
                if s > 0.0 { col /= s; }
            }
            residual = marginal_residual(m.view());
            if residual < self.tolerance {
                return Convergence { converged: true, iterations: iter + 1, residual };
            }
        }
        Convergence { converged: false, iterations: self.max_iterations, residual }
    }

    /// Normalizes `scores[M,K]` in place, one interaction class at a time.
    ///
    /// Only classes with a nonzero prior for at least one pair are touched, and
    /// within a class only the pairs carrying a nonzero prior take part. Each
    /// participating score is multiplied by the normalized value of its
    /// (human box, object box) cell.
    pub fn normalize_pair_scores(
        &self,
        boxes_h: ArrayView2<f32>,
        boxes_o: ArrayView2<f32>,
        prior: ArrayView2<f32>,
        scores: &mut Array2<f32>,
    ) -> Result<()> {
        let m = scores.nrows();
        if boxes_h.dim() != (m, 4) || boxes_o.dim() != (m, 4) || prior.dim() != scores.dim() {
            return Err(HoiError::invalid(format!(
                "scores {:?}, prior {:?}, human boxes {:?} and object boxes {:?} disagree",
                scores.dim(),
                prior.dim(),
                boxes_h.dim(),
                boxes_o.dim()
            )));
        }

        for (class, prior_col) in prior.axis_iter(Axis(1)).enumerate() {
            let members: Vec<usize> = (0..m).filter(|&i| prior_col[i] != 0.0).collect();
            if members.is_empty() {
                continue;
            }
            let humans = BoxIndex::build(members.iter().map(|&i| boxes_h.row(i)));
            let objects = BoxIndex::build(members.iter().map(|&i| boxes_o.row(i)));

            let mut dense = Array2::<f32>::zeros((humans.len(), objects.len()));
            let cells: Vec<(usize, usize)> = members
                .iter()
                .map(|&i| (humans.lookup(boxes_h.row(i)), objects.lookup(boxes_o.row(i))))
                .collect();
            for (&i, &(u, v)) in members.iter().zip(&cells) {
                dense[[u, v]] = dense[[u, v]].max(scores[[i, class]]);
            }

            let result = self.normalize(&mut dense);
            debug!(
                "event" = "sinkhorn.class",
                class,
                humans = humans.len(),
                objects = objects.len(),
                iterations = result.iterations,
                converged = result.converged
            );

            let mut column = scores.column_mut(class);
            for (&i, &(u, v)) in members.iter().zip(&cells) {
                column[i] *= dense[[u, v]];
            }
        }
        Ok(())
    }
}

fn marginal_residual(m: ArrayView2<f32>) -> f32 {
    let rows = m.sum_axis(Axis(1));
    let cols = m.sum_axis(Axis(0));
    rows.iter()
        .chain(cols.iter())
        .filter(|&&s| s > 0.0)
        .map(|&s| (s - 1.0).abs())
        .fold(0.0, f32::max)
}

/// Dense indices for unique boxes in first-appearance order.
struct BoxIndex {
    keys: BTreeMap<[u32; 4], usize>,
}

impl BoxIndex {
    fn build<'a>(boxes: impl Iterator<Item = ArrayView1<'a, f32>>) -> Self {
        let mut keys = BTreeMap::new();
        for b in boxes {
            let next = keys.len();
            keys.entry(box_key(b)).or_insert(next);
        }
        Self { keys }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn lookup(&self, b: ArrayView1<f32>) -> usize {
        self.keys[&box_key(b)]
    }
}

fn box_key(b: ArrayView1<f32>) -> [u32; 4] {
    // Adding zero folds -0.0 into 0.0.
    [(b[0] + 0.0).to_bits(), (b[1] + 0.0).to_bits(), (b[2] + 0.0).to_bits(), (b[3] + 0.0).to_bits()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn sums(m: &Array2<f32>) -> (Vec<f32>, Vec<f32>) {
        (m.sum_axis(Axis(1)).to_vec(), m.sum_axis(Axis(0)).to_vec())
    }

    #[test]
    fn test_dense_positive_matrix_becomes_doubly_stochastic() {
        let mut m = arr2(&[[4.0f32, 1.0, 2.0], [1.0, 2.0, 3.0], [3.0, 4.0, 1.0]]);
        let sk = SinkhornKnopp::new(50, 1e-6);
        sk.normalize(&mut m);
        let (rows, cols) = sums(&m);
        for s in rows.into_iter().chain(cols) {
            assert!((s - 1.0).abs() < 1e-4, "marginal {s}");
        }
    }

    #[test]
    fn test_zero_row_stays_zero() {
        let mut m = arr2(&[[0.5f32, 0.2, 0.3], [0.0, 0.0, 0.0], [0.1, 0.6, 0.3]]);
        SinkhornKnopp::new(50, 1e-6).normalize(&mut m);
        assert!(m.row(1).iter().all(|&v| v == 0.0));
        assert!(m.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_already_stochastic_stops_immediately() {
        let mut m = Array2::<f32>::from_elem((2, 2), 0.5);
        let r = SinkhornKnopp::default().normalize(&mut m);
        assert!(r.converged);
        assert_eq!(r.iterations, 0);
    }

    #[test]
    fn test_iteration_cap_is_respected() {
        // A 1x2 matrix can never have both marginals at one.
        let mut m = arr2(&[[0.3f32, 0.6]]);
        let r = SinkhornKnopp::new(7, 1e-6).normalize(&mut m);
        assert!(!r.converged);
        assert_eq!(r.iterations, 7);
        // The last step normalizes columns.
        assert_eq!(m, arr2(&[[1.0f32, 1.0]]));
    }

    #[test]
    fn test_pair_scores_are_normalized_per_class() {
        // Two humans, two objects, four pairs; class 0 uses all four pairs,
        // class 1 only the last one.
        let boxes_h = arr2(&[
            [0.0f32, 0.0, 1.0, 1.0],
            [0.0, 0.0, 1.0, 1.0],
            [5.0, 5.0, 6.0, 6.0],
            [5.0, 5.0, 6.0, 6.0],
        ]);
        let boxes_o = arr2(&[
            [2.0f32, 2.0, 3.0, 3.0],
            [7.0, 7.0, 8.0, 8.0],
            [2.0, 2.0, 3.0, 3.0],
            [7.0, 7.0, 8.0, 8.0],
        ]);
        let prior = arr2(&[[1.0f32, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.5]]);
        let mut scores = arr2(&[[0.8f32, 0.0], [0.2, 0.0], [0.2, 0.0], [0.8, 0.4]]);
        let original = scores.clone();
        SinkhornKnopp::new(50, 1e-7)
            .normalize_pair_scores(boxes_h.view(), boxes_o.view(), prior.view(), &mut scores)
            .unwrap();

        // The class 0 matrix [[0.8, 0.2], [0.2, 0.8]] is already bi-stochastic.
        for i in 0..4 {
            let expected = original[[i, 0]] * original[[i, 0]];
            assert!((scores[[i, 0]] - expected).abs() < 1e-5);
        }
        // A single pair normalizes to one and keeps its score.
        assert!((scores[[3, 1]] - 0.4).abs() < 1e-6);
        assert_eq!(scores[[0, 1]], 0.0);
    }

    #[test]
    fn test_mismatched_shapes_are_invalid() {
        let boxes = Array2::<f32>::zeros((2, 4));
        let prior = Array2::<f32>::zeros((3, 2));
        let mut scores = Array2::<f32>::zeros((3, 2));
        let err = SinkhornKnopp::default().normalize_pair_scores(boxes.view(), boxes.view(), prior.view(), &mut scores);
        assert!(matches!(err, Err(HoiError::InvalidArgument(_))));
    }
}
