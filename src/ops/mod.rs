pub mod box_pair_pooler;
pub mod masked_roi_align;
pub mod roi_align;
pub mod sinkhorn;

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{HoiError, Result};

pub fn box_area(b: ArrayView1<f32>) -> f32 {
    let w = (b[2] - b[0]).max(0.0);
    let h = (b[3] - b[1]).max(0.0);
    w * h
}

pub fn intersection_over_union(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let w = (x2 - x1).max(0.0);
    let h = (y2 - y1).max(0.0);
    let inter = w * h;
    if inter <= 0.0 { return 0.0; }
    let union = box_area(a) + box_area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Pairwise IoU between `[N,4]` and `[M,4]` boxes, returned as `[N,M]`.
pub fn box_iou(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        intersection_over_union(a.row(i), b.row(j))
    })
}

/// Class-wise non-maximum suppression.
///
/// Boxes only suppress boxes carrying the same label. A box is dropped when its
/// IoU with an already kept, higher scoring box exceeds `iou_threshold`. The kept
/// indices are returned in descending score order.
pub fn batched_nms(
    boxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    labels: ArrayView1<usize>,
    iou_threshold: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    let mut selected: Vec<usize> = Vec::with_capacity(order.len());
    for candidate in order {
        let keep = selected.iter().all(|&s| {
            labels[s] != labels[candidate]
                || intersection_over_union(boxes.row(candidate), boxes.row(s)) <= iou_threshold
        });
        if keep { selected.push(candidate); }
    }
    selected
}

/// Checks the `(x1, y1, x2, y2)` layout and ordering of a box array.
pub fn validate_boxes(boxes: ArrayView2<f32>, what: &str) -> Result<()> {
    if boxes.ncols() != 4 {
        return Err(HoiError::invalid(format!(
            "{what}: expected 4 box columns, got {}",
            boxes.ncols()
        )));
    }
    for (i, b) in boxes.rows().into_iter().enumerate() {
        if !b.iter().all(|v| v.is_finite()) {
            return Err(HoiError::invalid(format!("{what}: box {i} has non-finite coordinates: {b}")));
        }
        if !(b[0] <= b[2] && b[1] <= b[3]) {
            return Err(HoiError::invalid(format!(
                "{what}: box {i} is not ordered as (x1, y1, x2, y2): {b}"
            )));
        }
    }
    Ok(())
}

/// Gathers rows of a 2-D array by index.
pub fn gather_rows<A: Copy + Default>(a: ArrayView2<A>, idx: &[usize]) -> Array2<A> {
    let mut out = Array2::from_elem((idx.len(), a.ncols()), A::default());
    for (dst, &src) in idx.iter().enumerate() {
        out.row_mut(dst).assign(&a.row(src));
    }
    out
}

#[inline]
pub fn sigmoid(x: f32) -> f32 { 1.0 / (1.0 + (-x).exp()) }
