pub mod sampler;

use ndarray::{concatenate, Array1, ArrayView1, Axis};
use serde::Serialize;

use crate::detection::{Detection, GroundTruthPairs};
use crate::error::{HoiError, Result};

/// Indices of a human detection and the detection it is paired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandidatePair {
    pub h: usize,
    pub o: usize,
}

impl CandidatePair {
    pub fn new(h: usize, o: usize) -> Self {
        Self { h, o }
    }
}

/// Pairs every human detection with every other detection.
///
/// Pairs come out row-major: ascending human index, then ascending partner index.
pub fn construct_pairs(labels: ArrayView1<usize>, human_class: usize) -> Vec<CandidatePair> {
    let humans: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == human_class).collect();
    let mut pairs = Vec::with_capacity(humans.len() * labels.len().saturating_sub(1));
    for &h in &humans {
        pairs.extend((0..labels.len()).filter(|&o| o != h).map(|o| CandidatePair::new(h, o)));
    }
    pairs
}

/// Puts ground-truth boxes in front of the detections.
///
/// The `G` human boxes come first with the human class, then the `G` object boxes
/// with their annotated class, all scored 1.0. The returned pairs `(i, G + i)`
/// reproduce the annotated pairing.
pub fn inject_ground_truth(
    detection: &Detection,
    targets: &GroundTruthPairs,
    human_class: usize,
) -> Result<(Detection, Vec<CandidatePair>)> {
    let g = targets.len();
    let boxes = concatenate(
        Axis(0),
        &[targets.boxes_h.view(), targets.boxes_o.view(), detection.boxes().view()],
    )
    .map_err(|e| HoiError::invalid(format!("cannot stack ground-truth boxes: {e}")))?;

    let labels: Array1<usize> = std::iter::repeat_n(human_class, g)
        .chain(targets.object.iter().copied())
        .chain(detection.labels().iter().copied())
        .collect();
    let scores: Array1<f32> = std::iter::repeat_n(1.0, 2 * g)
        .chain(detection.scores().iter().copied())
        .collect();

    let augmented = Detection::new(boxes, labels, scores)?;
    let diagonal = (0..g).map(|i| CandidatePair::new(i, g + i)).collect();
    Ok((augmented, diagonal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array2};

    const HUMAN: usize = 0;

    fn pairs_of(v: &[CandidatePair]) -> Vec<(usize, usize)> {
        v.iter().map(|p| (p.h, p.o)).collect()
    }

    #[test]
    fn test_cross_product_excludes_self_pairs() {
        let labels = arr1(&[HUMAN, 3, HUMAN, 7]);
        let pairs = construct_pairs(labels.view(), HUMAN);
        assert_eq!(pairs.len(), 2 * (4 - 1));
        assert_eq!(pairs_of(&pairs), vec![(0, 1), (0, 2), (0, 3), (2, 0), (2, 1), (2, 3)]);
    }

    #[test]
    fn test_no_humans_no_pairs() {
        let labels = arr1(&[1usize, 2, 3]);
        assert!(construct_pairs(labels.view(), HUMAN).is_empty());
        assert!(construct_pairs(Array1::<usize>::zeros(0).view(), HUMAN).is_empty());
    }

    #[test]
    fn test_lone_human_has_no_partner() {
        let labels = arr1(&[HUMAN]);
        assert!(construct_pairs(labels.view(), HUMAN).is_empty());
    }

    #[test]
    fn test_ground_truth_goes_in_front() {
        let det = Detection::new(
            arr2(&[[0.0f32, 0.0, 5.0, 5.0]]),
            arr1(&[HUMAN]),
            arr1(&[0.7f32]),
        )
        .unwrap();
        let gt = GroundTruthPairs::new(
            arr2(&[[1.0f32, 1.0, 2.0, 2.0], [3.0, 3.0, 4.0, 4.0]]),
            arr2(&[[5.0f32, 5.0, 6.0, 6.0], [7.0, 7.0, 8.0, 8.0]]),
            vec![11, 12],
            vec![4, 9],
        )
        .unwrap();

        let (augmented, diagonal) = inject_ground_truth(&det, &gt, HUMAN).unwrap();
        assert_eq!(augmented.len(), det.len() + 2 * gt.len());
        assert_eq!(pairs_of(&diagonal), vec![(0, 2), (1, 3)]);
        assert_eq!(augmented.labels(), &arr1(&[HUMAN, HUMAN, 4, 9, HUMAN]));
        assert_eq!(augmented.scores(), &arr1(&[1.0f32, 1.0, 1.0, 1.0, 0.7]));
        assert_eq!(augmented.boxes().row(2), gt.boxes_o.row(0));
        assert_eq!(augmented.boxes().row(4), det.boxes().row(0));
    }

    #[test]
    fn test_empty_ground_truth_keeps_detections() {
        let det = Detection::new(arr2(&[[0.0f32, 0.0, 5.0, 5.0]]), arr1(&[2usize]), arr1(&[0.4f32])).unwrap();
        let gt = GroundTruthPairs::new(Array2::zeros((0, 4)), Array2::zeros((0, 4)), vec![], vec![]).unwrap();
        let (augmented, diagonal) = inject_ground_truth(&det, &gt, HUMAN).unwrap();
        assert_eq!(augmented, det);
        assert!(diagonal.is_empty());
    }
}
