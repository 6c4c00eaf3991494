use ndarray::{Array4, ArrayView2, ArrayView4};

use crate::error::{HoiError, Result};

/// Parameters shared by every region align call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiAlignParams {
    pub output_size: (usize, usize),
    pub spatial_scale: f32,
    /// Sampling points per bin along each axis; `<= 0` picks
    /// `ceil(roi_extent / output_extent)` adaptively.
    pub sampling_ratio: i32,
    /// Shift box coordinates by half a pixel before sampling.
    pub aligned: bool,
}

/// Bilinear-interpolated region align.
///
/// `rois` is `[K,5]` with the feature map index in the first column followed by
/// `(x1, y1, x2, y2)`. Returns `[K, C, out_h, out_w]`.
pub fn roi_align(
    input: ArrayView4<f32>,
    rois: ArrayView2<f32>,
    params: &RoiAlignParams,
) -> Result<Array4<f32>> {
    let (n, channels, height, width) = input.dim();
    let (out_h, out_w) = params.output_size;
    if rois.ncols() != 5 {
        return Err(HoiError::invalid(format!("rois must have 5 columns, got {}", rois.ncols())));
    }
    if out_h == 0 || out_w == 0 {
        return Err(HoiError::invalid("output size must be non-zero"));
    }
    if rois.nrows() > 0 && (height == 0 || width == 0) {
        return Err(HoiError::invalid(format!("cannot sample a {height}x{width} feature map")));
    }
    if let Some(k) = (0..rois.nrows()).find(|&k| rois.row(k).iter().skip(1).any(|v| !v.is_finite())) {
        return Err(HoiError::invalid(format!("roi {k} has non-finite coordinates")));
    }
    let batch_indices = rois
        .column(0)
        .iter()
        .map(|&b| batch_index(b, n))
        .collect::<Result<Vec<_>>>()?;

    let mut output = Array4::<f32>::zeros((rois.nrows(), channels, out_h, out_w));
    let offset = if params.aligned { 0.5 } else { 0.0 };

    for (k, &b) in batch_indices.iter().enumerate() {
        let roi = rois.row(k);
        let start_w = roi[1] * params.spatial_scale - offset;
        let start_h = roi[2] * params.spatial_scale - offset;
        let end_w = roi[3] * params.spatial_scale - offset;
        let end_h = roi[4] * params.spatial_scale - offset;

        let mut roi_w = end_w - start_w;
        let mut roi_h = end_h - start_h;
        if !params.aligned {
            roi_w = roi_w.max(1.0);
            roi_h = roi_h.max(1.0);
        }
        let bin_h = roi_h / out_h as f32;
        let bin_w = roi_w / out_w as f32;

        let grid_h = if params.sampling_ratio > 0 {
            params.sampling_ratio as usize
        } else {
            (roi_h / out_h as f32).ceil().max(0.0) as usize
        };
        let grid_w = if params.sampling_ratio > 0 {
            params.sampling_ratio as usize
        } else {
            (roi_w / out_w as f32).ceil().max(0.0) as usize
        };
        let count = grid_h.saturating_mul(grid_w).max(1) as f32;

        for c in 0..channels {
            let plane = input.slice(ndarray::s![b, c, .., ..]);
            for ph in 0..out_h {
                for pw in 0..out_w {
                    let mut acc = 0.0f32;
                    for iy in 0..grid_h {
                        let y = start_h
                            + ph as f32 * bin_h
                            + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                        for ix in 0..grid_w {
                            let x = start_w
                                + pw as f32 * bin_w
                                + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                            acc += bilinear(&plane, height, width, y, x);
                        }
                    }
                    output[[k, c, ph, pw]] = acc / count;
                }
            }
        }
    }
    Ok(output)
}

fn batch_index(value: f32, n: usize) -> Result<usize> {
    if value.fract() != 0.0 || value < 0.0 || value as usize >= n {
        return Err(HoiError::invalid(format!(
            "roi image index {value} is not an integer in [0, {n})"
        )));
    }
    Ok(value as usize)
}

fn bilinear(plane: &ndarray::ArrayView2<f32>, height: usize, width: usize, y: f32, x: f32) -> f32 {
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return 0.0;
    }
    let y = y.max(0.0);
    let x = x.max(0.0);

    let (y_low, y_high, y) = clamp_low_high(y, height);
    let (x_low, x_high, x) = clamp_low_high(x, width);

    let ly = y - y_low as f32;
    let lx = x - x_low as f32;
    let hy = 1.0 - ly;
    let hx = 1.0 - lx;

    let v1 = plane[[y_low, x_low]];
    let v2 = plane[[y_low, x_high]];
    let v3 = plane[[y_high, x_low]];
    let v4 = plane[[y_high, x_high]];
    hy * hx * v1 + hy * lx * v2 + ly * hx * v3 + ly * lx * v4
}

#[inline]
fn clamp_low_high(v: f32, len: usize) -> (usize, usize, f32) {
    let low = v as usize;
    if low >= len - 1 {
        (len - 1, len - 1, (len - 1) as f32)
    } else {
        (low, low + 1, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn params(out: usize, ratio: i32) -> RoiAlignParams {
        RoiAlignParams { output_size: (out, out), spatial_scale: 1.0, sampling_ratio: ratio, aligned: false }
    }

    #[test]
    fn test_constant_map_pools_to_constant() {
        let input = Array4::<f32>::from_elem((1, 2, 8, 8), 3.0);
        let rois = arr2(&[[0.0f32, 1.0, 1.0, 6.0, 5.0]]);
        let out = roi_align(input.view(), rois.view(), &params(3, -1)).unwrap();
        assert_eq!(out.dim(), (1, 2, 3, 3));
        for v in out.iter() {
            assert!((v - 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_horizontal_ramp_bin_means() {
        let input = Array4::<f32>::from_shape_fn((1, 1, 8, 8), |(_, _, _, x)| x as f32);
        let rois = arr2(&[[0.0f32, 0.0, 0.0, 4.0, 4.0]]);
        let out = roi_align(input.view(), rois.view(), &params(2, 2)).unwrap();
        // Samples at x = 0.5, 1.5 and 2.5, 3.5.
        assert!((out[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((out[[0, 0, 0, 1]] - 3.0).abs() < 1e-6);
        assert!((out[[0, 0, 1, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_selects_feature_map_by_index() {
        let input = Array4::<f32>::from_shape_fn((2, 1, 4, 4), |(n, _, _, _)| n as f32 + 1.0);
        let rois = arr2(&[[1.0f32, 0.0, 0.0, 3.0, 3.0], [0.0, 0.0, 0.0, 3.0, 3.0]]);
        let out = roi_align(input.view(), rois.view(), &params(1, 2)).unwrap();
        assert!((out[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((out[[1, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_image_index() {
        let input = Array4::<f32>::zeros((1, 1, 4, 4));
        let rois = arr2(&[[1.0f32, 0.0, 0.0, 3.0, 3.0]]);
        assert!(matches!(
            roi_align(input.view(), rois.view(), &params(1, 2)),
            Err(HoiError::InvalidArgument(_))
        ));
        let rois = arr2(&[[0.5f32, 0.0, 0.0, 3.0, 3.0]]);
        assert!(roi_align(input.view(), rois.view(), &params(1, 2)).is_err());
    }

    #[test]
    fn test_rejects_non_finite_roi() {
        let input = Array4::<f32>::zeros((1, 1, 4, 4));
        let rois = arr2(&[[0.0f32, 0.0, 0.0, f32::INFINITY, 3.0]]);
        assert!(matches!(
            roi_align(input.view(), rois.view(), &params(1, -1)),
            Err(HoiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_samples_outside_map_are_zero() {
        let input = Array4::<f32>::from_elem((1, 1, 4, 4), 1.0);
        let rois = arr2(&[[0.0f32, 10.0, 10.0, 14.0, 14.0]]);
        let out = roi_align(input.view(), rois.view(), &params(2, 2)).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
