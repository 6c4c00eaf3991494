use ndarray::{Array1, Array2};

use crate::error::{HoiError, Result};
use crate::ops::{batched_nms, gather_rows, validate_boxes};

/// Object detections for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    boxes: Array2<f32>,
    labels: Array1<usize>,
    scores: Array1<f32>,
}

impl Detection {
    pub fn new(boxes: Array2<f32>, labels: Array1<usize>, scores: Array1<f32>) -> Result<Self> {
        validate_boxes(boxes.view(), "detection boxes")?;
        if labels.len() != boxes.nrows() || scores.len() != boxes.nrows() {
            return Err(HoiError::invalid(format!(
                "{} boxes, {} labels and {} scores",
                boxes.nrows(),
                labels.len(),
                scores.len()
            )));
        }
        Ok(Self { boxes, labels, scores })
    }

    pub fn empty() -> Self {
        Self { boxes: Array2::zeros((0, 4)), labels: Array1::zeros(0), scores: Array1::zeros(0) }
    }

    pub fn boxes(&self) -> &Array2<f32> {
        &self.boxes
    }

    pub fn labels(&self) -> &Array1<usize> {
        &self.labels
    }

    pub fn scores(&self) -> &Array1<f32> {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Keeps the detections at `idx`, in that order.
    pub fn select(&self, idx: &[usize]) -> Self {
        Self {
            boxes: gather_rows(self.boxes.view(), idx),
            labels: idx.iter().map(|&i| self.labels[i]).collect(),
            scores: idx.iter().map(|&i| self.scores[i]).collect(),
        }
    }

    /// Drops detections scoring at or below `score_thresh`, then suppresses
    /// overlapping boxes of the same class.
    pub fn filter(&self, score_thresh: f32, nms_thresh: f32) -> Self {
        let confident: Vec<usize> = (0..self.len()).filter(|&i| self.scores[i] > score_thresh).collect();
        let kept = self.select(&confident);
        let keep = batched_nms(kept.boxes.view(), kept.scores.view(), kept.labels.view(), nms_thresh);
        kept.select(&keep)
    }
}

/// Annotated human-object pairs for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthPairs {
    pub boxes_h: Array2<f32>,
    pub boxes_o: Array2<f32>,
    /// Interaction class of each pair.
    pub hoi: Vec<usize>,
    /// Object class of each pair.
    pub object: Vec<usize>,
}

impl GroundTruthPairs {
    pub fn new(boxes_h: Array2<f32>, boxes_o: Array2<f32>, hoi: Vec<usize>, object: Vec<usize>) -> Result<Self> {
        validate_boxes(boxes_h.view(), "ground-truth human boxes")?;
        validate_boxes(boxes_o.view(), "ground-truth object boxes")?;
        let g = boxes_h.nrows();
        if boxes_o.nrows() != g || hoi.len() != g || object.len() != g {
            return Err(HoiError::invalid(format!(
                "ground truth has {g} human boxes, {} object boxes, {} interactions and {} objects",
                boxes_o.nrows(),
                hoi.len(),
                object.len()
            )));
        }
        Ok(Self { boxes_h, boxes_o, hoi, object })
    }

    pub fn len(&self) -> usize {
        self.hoi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hoi.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_new_rejects_length_mismatch() {
        let boxes = arr2(&[[0.0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 2.0, 2.0]]);
        let err = Detection::new(boxes.clone(), arr1(&[0usize]), arr1(&[0.5f32, 0.5]));
        assert!(matches!(err, Err(HoiError::InvalidArgument(_))));
        let err = Detection::new(boxes, arr1(&[0usize, 1]), arr1(&[0.5f32]));
        assert!(err.is_err());
    }

    #[test]
    fn test_new_rejects_non_box_columns() {
        let err = Detection::new(Array2::zeros((1, 3)), arr1(&[0usize]), arr1(&[0.5f32]));
        assert!(matches!(err, Err(HoiError::InvalidArgument(_))));
    }

    #[test]
    fn test_filter_thresholds_and_suppresses() {
        let det = Detection::new(
            arr2(&[
                [0.0f32, 0.0, 10.0, 10.0],
                [0.0, 0.0, 10.0, 9.0],
                [0.0, 0.0, 10.0, 10.0],
                [20.0, 20.0, 30.0, 30.0],
            ]),
            arr1(&[0usize, 0, 3, 3]),
            arr1(&[0.6f32, 0.9, 0.8, 0.1]),
        )
        .unwrap();
        let kept = det.filter(0.2, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.scores(), &arr1(&[0.9f32, 0.8]));
        assert_eq!(kept.labels(), &arr1(&[0usize, 3]));
    }

    #[test]
    fn test_ground_truth_lengths_must_agree() {
        let b = arr2(&[[0.0f32, 0.0, 1.0, 1.0]]);
        assert!(GroundTruthPairs::new(b.clone(), b.clone(), vec![1], vec![2]).is_ok());
        assert!(GroundTruthPairs::new(b.clone(), b, vec![1, 2], vec![2]).is_err());
    }
}
