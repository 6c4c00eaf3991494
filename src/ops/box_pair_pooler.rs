use ndarray::{s, Array2, Array4, ArrayView1, ArrayView4, ArrayViewMut2};

use crate::error::{HoiError, Result};
use crate::ops::masked_roi_align::{MaskedRoiAlign, RoiBoxes};

/// Pools one feature tensor per (human, object) pair.
///
/// Each pair is pooled over the union of its two boxes, with a mask that keeps
/// the feature cells covered by either box and zeroes the rest of the map.
#[derive(Debug, Clone)]
pub struct BoxPairPooler {
    pub pooler: MaskedRoiAlign,
}

impl BoxPairPooler {
    pub fn new(pooler: MaskedRoiAlign) -> Self {
        Self { pooler }
    }

    pub fn forward(
        &self,
        features: ArrayView4<f32>,
        boxes_h: &[Array2<f32>],
        boxes_o: &[Array2<f32>],
    ) -> Result<Array4<f32>> {
        if boxes_h.len() != boxes_o.len() {
            return Err(HoiError::invalid(format!(
                "{} human box sets but {} object box sets",
                boxes_h.len(),
                boxes_o.len()
            )));
        }
        if boxes_h.len() > features.dim().0 {
            return Err(HoiError::invalid(format!(
                "boxes given for {} images but only {} feature maps",
                boxes_h.len(),
                features.dim().0
            )));
        }
        for (image, (h, o)) in boxes_h.iter().zip(boxes_o).enumerate() {
            if h.ncols() != 4 || o.ncols() != 4 || h.nrows() != o.nrows() {
                return Err(HoiError::invalid(format!(
                    "image {image}: human boxes {:?} and object boxes {:?} do not pair up",
                    h.dim(),
                    o.dim()
                )));
            }
        }

        let (_, _, height, width) = features.dim();
        let scale = self.pooler.params.spatial_scale;
        let unions: Vec<Array2<f32>> = boxes_h
            .iter()
            .zip(boxes_o)
            .map(|(h, o)| union_boxes(h, o))
            .collect();

        let total: usize = unions.iter().map(|u| u.nrows()).sum();
        let mut masks = Array4::<f32>::zeros((total, 1, height, width));
        let mut k = 0;
        for (h, o) in boxes_h.iter().zip(boxes_o) {
            for (bh, bo) in h.rows().into_iter().zip(o.rows()) {
                let mut mask = masks.slice_mut(s![k, 0, .., ..]);
                paint_box(&mut mask, bh, scale);
                paint_box(&mut mask, bo, scale);
                k += 1;
            }
        }

        self.pooler.forward(features, RoiBoxes::PerImage(&unions), masks.view())
    }
}

fn union_boxes(h: &Array2<f32>, o: &Array2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((h.nrows(), 4), |(i, j)| {
        if j < 2 { h[[i, j]].min(o[[i, j]]) } else { h[[i, j]].max(o[[i, j]]) }
    })
}

/// Sets to one every feature cell that the scaled box touches.
fn paint_box(mask: &mut ArrayViewMut2<f32>, b: ArrayView1<f32>, scale: f32) {
    let (height, width) = mask.dim();
    let x1 = ((b[0] * scale).floor().max(0.0) as usize).min(width);
    let y1 = ((b[1] * scale).floor().max(0.0) as usize).min(height);
    let x2 = ((b[2] * scale).ceil().max(0.0) as usize).min(width).max(x1);
    let y2 = ((b[3] * scale).ceil().max(0.0) as usize).min(height).max(y1);
    mask.slice_mut(s![y1..y2, x1..x2]).fill(1.0);
}
