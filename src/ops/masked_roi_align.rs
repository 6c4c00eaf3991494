//! Masked RoI align under a memory ceiling.
//!
//! Every box gets its own copy of the feature map it was drawn from, multiplied by
//! the box's mask before pooling. Copies are expensive, so boxes are pooled in
//! chunks sized to fit the caller's [`MemoryBudget`]. At most `clone_capacity`
//! copies are alive at any point and each chunk drops its copies before the next
//! one starts.

use std::mem::size_of;
use std::ops::Range;

use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HoiError, Result};
use crate::ops::roi_align::{roi_align, RoiAlignParams};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryBudget {
    pub limit_bytes: u64,
    pub reserve_bytes: u64,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self { limit_bytes: 8 * GIB, reserve_bytes: 128 * MIB }
    }
}

impl MemoryBudget {
    pub fn new(limit_bytes: u64, reserve_bytes: u64) -> Self {
        Self { limit_bytes, reserve_bytes }
    }

    /// Number of feature map copies of `instance_elems` elements that fit next to
    /// the output and mask tensors.
    pub fn clone_capacity(&self, instance_elems: usize, output_elems: usize, mask_elems: usize) -> usize {
        let elem = size_of::<f32>() as u128;
        let per_instance = instance_elems as u128 * elem;
        let committed = self.reserve_bytes as u128
            + output_elems as u128 * elem
            + mask_elems as u128 * elem;
        let limit = self.limit_bytes as u128;
        if per_instance == 0 || committed >= limit {
            return 0;
        }
        ((limit - committed) / per_instance).min(usize::MAX as u128) as usize
    }
}

/// Boxes in one of the two accepted layouts.
#[derive(Debug, Clone, Copy)]
pub enum RoiBoxes<'a> {
    /// One `[M_i,4]` array per feature map.
    PerImage(&'a [Array2<f32>]),
    /// A single `[K,5]` array whose first column is the feature map index.
    Indexed(ArrayView2<'a, f32>),
}

impl RoiBoxes<'_> {
    pub fn len(&self) -> usize {
        match self {
            RoiBoxes::PerImage(list) => list.iter().map(|b| b.nrows()).sum(),
            RoiBoxes::Indexed(rois) => rois.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts to the `[K,5]` layout.
    pub fn to_rois(&self) -> Result<Array2<f32>> {
        match self {
            RoiBoxes::Indexed(rois) => {
                if rois.ncols() != 5 {
                    return Err(HoiError::invalid(format!(
                        "indexed boxes must have 5 columns, got {}",
                        rois.ncols()
                    )));
                }
                Ok(rois.to_owned())
            }
            RoiBoxes::PerImage(list) => {
                let mut rois = Array2::<f32>::zeros((self.len(), 5));
                let mut row = 0;
                for (image, boxes) in list.iter().enumerate() {
                    if boxes.ncols() != 4 {
                        return Err(HoiError::invalid(format!(
                            "boxes of image {image} must have 4 columns, got {}",
                            boxes.ncols()
                        )));
                    }
                    for b in boxes.rows() {
                        rois[[row, 0]] = image as f32;
                        rois.slice_mut(s![row, 1..]).assign(&b);
                        row += 1;
                    }
                }
                Ok(rois)
            }
        }
    }
}

/// How a pooling call is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub clone_capacity: usize,
    pub num_boxes: usize,
}

impl ChunkPlan {
    pub fn num_chunks(&self) -> usize {
        self.num_boxes.div_ceil(self.clone_capacity)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.num_chunks()).map(move |i| {
            let start = i * self.clone_capacity;
            start..(start + self.clone_capacity).min(self.num_boxes)
        })
    }
}

#[derive(Debug, Clone)]
pub struct MaskedRoiAlign {
    pub params: RoiAlignParams,
    pub budget: MemoryBudget,
}

impl MaskedRoiAlign {
    pub fn new(params: RoiAlignParams, budget: MemoryBudget) -> Self {
        Self { params, budget }
    }

    /// Plans chunking for `num_boxes` boxes against features of shape
    /// `[_, C, H, W]` and a mask tensor of `mask_elems` elements.
    pub fn plan(&self, feature_dim: (usize, usize, usize, usize), num_boxes: usize, mask_elems: usize) -> Result<ChunkPlan> {
        let (_, channels, height, width) = feature_dim;
        let (out_h, out_w) = self.params.output_size;
        let instance_elems = channels * height * width;
        let output_elems = num_boxes * channels * out_h * out_w;
        let clone_capacity = self.budget.clone_capacity(instance_elems, output_elems, mask_elems);
        if clone_capacity < 1 {
            return Err(HoiError::ResourceExhausted(format!(
                "budget of {} bytes ({} reserved) cannot hold a single {}x{}x{} feature map copy next to {} output and {} mask elements",
                self.budget.limit_bytes, self.budget.reserve_bytes, channels, height, width, output_elems, mask_elems
            )));
        }
        Ok(ChunkPlan { clone_capacity, num_boxes })
    }

    /// Pools `[K, C, out_h, out_w]` features for `K` boxes.
    ///
    /// `masks` is `[K, Cm, H, W]` with `Cm` equal to 1 (broadcast over channels) or
    /// to the feature channel count.
    pub fn forward(&self, features: ArrayView4<f32>, boxes: RoiBoxes<'_>, masks: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, channels, height, width) = features.dim();
        let (out_h, out_w) = self.params.output_size;
        let output_shape = (boxes.len(), channels, out_h, out_w);

        let rois = boxes.to_rois()?;
        validate_masks(masks, rois.nrows(), channels, height, width)?;
        let owners = rois
            .column(0)
            .iter()
            .map(|&b| {
                if b.fract() == 0.0 && b >= 0.0 && (b as usize) < n {
                    Ok(b as usize)
                } else {
                    Err(HoiError::invalid(format!("box image index {b} is not an integer in [0, {n})")))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        if rois.nrows() == 0 {
            return Ok(Array4::zeros(output_shape));
        }

        let plan = self.plan(features.dim(), rois.nrows(), masks.len())?;
        debug!(
            "event" = "pooler.plan",
            num_boxes = plan.num_boxes,
            clone_capacity = plan.clone_capacity,
            num_chunks = plan.num_chunks()
        );

        let mut output = Array4::<f32>::zeros(output_shape);
        for (chunk_idx, range) in plan.chunks().enumerate() {
            let len = range.len();
            let mut clones = Array4::<f32>::zeros((len, channels, height, width));
            for (local, k) in range.clone().enumerate() {
                let mut clone = clones.index_axis_mut(Axis(0), local);
                clone.assign(&features.index_axis(Axis(0), owners[k]));
                clone *= &masks.index_axis(Axis(0), k);
            }

            // Renumber a local copy so box i of the chunk reads clone i.
            let mut local_rois = rois.slice(s![range.clone(), ..]).to_owned();
            for (i, mut row) in local_rois.rows_mut().into_iter().enumerate() {
                row[0] = i as f32;
            }

            let pooled = roi_align(clones.view(), local_rois.view(), &self.params)?;
            if pooled.dim() != (len, channels, out_h, out_w) {
                return Err(HoiError::InternalConsistency(format!(
                    "chunk {chunk_idx} pooled to {:?}, expected {:?}",
                    pooled.dim(),
                    (len, channels, out_h, out_w)
                )));
            }
            output.slice_mut(s![range, .., .., ..]).assign(&pooled);
            debug!("event" = "pooler.chunk", chunk = chunk_idx, boxes = len);
            drop(clones);
        }

        if output.dim() != output_shape {
            return Err(HoiError::InternalConsistency(format!(
                "pooled output has shape {:?}, expected {:?}",
                output.dim(),
                output_shape
            )));
        }
        Ok(output)
    }
}

fn validate_masks(masks: ArrayView4<f32>, num_boxes: usize, channels: usize, height: usize, width: usize) -> Result<()> {
    let (k, mc, mh, mw) = masks.dim();
    if k != num_boxes {
        return Err(HoiError::invalid(format!("got {k} masks for {num_boxes} boxes")));
    }
    if num_boxes > 0 && (mh != height || mw != width || (mc != 1 && mc != channels)) {
        return Err(HoiError::invalid(format!(
            "mask shape [{k}, {mc}, {mh}, {mw}] does not match features [_, {channels}, {height}, {width}]"
        )));
    }
    Ok(())
}
