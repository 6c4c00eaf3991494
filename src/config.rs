use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HoiError, Result};
use crate::ops::box_pair_pooler::BoxPairPooler;
use crate::ops::masked_roi_align::{MaskedRoiAlign, MemoryBudget};
use crate::ops::roi_align::RoiAlignParams;
use crate::ops::sinkhorn::SinkhornKnopp;

/// Region pooling settings for box pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolerConfig {
    /// `[height, width]` of each pooled feature.
    pub output_size: [usize; 2],
    pub spatial_scale: f32,
    pub sampling_ratio: i32,
    pub aligned: bool,
    pub budget: MemoryBudget,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            output_size: [7, 7],
            spatial_scale: 1.0,
            sampling_ratio: -1,
            aligned: false,
            budget: MemoryBudget::default(),
        }
    }
}

impl PoolerConfig {
    pub fn build(&self) -> BoxPairPooler {
        let params = RoiAlignParams {
            output_size: (self.output_size[0], self.output_size[1]),
            spatial_scale: self.spatial_scale,
            sampling_ratio: self.sampling_ratio,
            aligned: self.aligned,
        };
        BoxPairPooler::new(MaskedRoiAlign::new(params, self.budget))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadConfig {
    pub human_class_index: usize,
    /// Both boxes of a candidate must reach this IoU with a ground-truth pair.
    pub fg_iou_thresh: f32,
    pub num_pairs_per_image: usize,
    pub positive_fraction: f64,
    pub box_score_thresh: f32,
    pub box_nms_thresh: f32,
    /// Inference keeps interaction scores strictly above this value.
    pub interaction_score_thresh: f32,
    pub pooler: PoolerConfig,
    pub sinkhorn: SinkhornKnopp,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            human_class_index: 49,
            fg_iou_thresh: 0.5,
            num_pairs_per_image: 512,
            positive_fraction: 0.25,
            box_score_thresh: 0.2,
            box_nms_thresh: 0.5,
            interaction_score_thresh: 0.0,
            pooler: PoolerConfig::default(),
            sinkhorn: SinkhornKnopp::default(),
        }
    }
}

impl HeadConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: HeadConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(HoiError::invalid(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("fgIouThresh", self.fg_iou_thresh)?;
        unit("boxScoreThresh", self.box_score_thresh)?;
        unit("boxNmsThresh", self.box_nms_thresh)?;
        if !(self.positive_fraction > 0.0 && self.positive_fraction <= 1.0) {
            return Err(HoiError::invalid(format!(
                "positiveFraction must be in (0, 1], got {}",
                self.positive_fraction
            )));
        }
        if !self.interaction_score_thresh.is_finite() || self.interaction_score_thresh < 0.0 {
            return Err(HoiError::invalid(format!(
                "interactionScoreThresh must be a non-negative number, got {}",
                self.interaction_score_thresh
            )));
        }
        let pooler = &self.pooler;
        if pooler.output_size.contains(&0) {
            return Err(HoiError::invalid(format!("pooler outputSize {:?} has a zero side", pooler.output_size)));
        }
        if !(pooler.spatial_scale.is_finite() && pooler.spatial_scale > 0.0) {
            return Err(HoiError::invalid(format!("pooler spatialScale must be positive, got {}", pooler.spatial_scale)));
        }
        if pooler.budget.reserve_bytes >= pooler.budget.limit_bytes {
            return Err(HoiError::invalid(format!(
                "memory reserve {} leaves nothing of the {} byte limit",
                pooler.budget.reserve_bytes, pooler.budget.limit_bytes
            )));
        }
        if !(self.sinkhorn.tolerance.is_finite() && self.sinkhorn.tolerance > 0.0) {
            return Err(HoiError::invalid(format!("sinkhorn tolerance must be positive, got {}", self.sinkhorn.tolerance)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HeadConfig::default();
        assert_eq!(config.human_class_index, 49);
        assert_eq!(config.num_pairs_per_image, 512);
        assert_eq!(config.positive_fraction, 0.25);
        assert_eq!(config.pooler.budget, MemoryBudget::new(8 << 30, 128 << 20));
        assert_eq!(config.sinkhorn, SinkhornKnopp::new(50, 1e-5));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "humanClassIndex": 0,
            "boxScoreThresh": 0.05,
            "pooler": { "outputSize": [5, 3], "budget": { "limitBytes": 1048576, "reserveBytes": 4096 } },
            "sinkhorn": { "maxIterations": 10 }
        }"#;
        let config = HeadConfig::from_json_str(json).unwrap();
        assert_eq!(config.human_class_index, 0);
        assert_eq!(config.box_score_thresh, 0.05);
        assert_eq!(config.fg_iou_thresh, 0.5);
        assert_eq!(config.pooler.output_size, [5, 3]);
        assert_eq!(config.pooler.sampling_ratio, -1);
        assert_eq!(config.pooler.budget.limit_bytes, 1 << 20);
        assert_eq!(config.pooler.budget.reserve_bytes, 4096);
        assert_eq!(config.pooler.spatial_scale, 1.0);
        assert_eq!(config.positive_fraction, 0.25);
        assert_eq!(config.sinkhorn.max_iterations, 10);
        assert_eq!(config.sinkhorn.tolerance, 1e-5);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let cases = [
            r#"{"fgIouThresh": 1.5}"#,
            r#"{"positiveFraction": 0.0}"#,
            r#"{"interactionScoreThresh": -0.1}"#,
            r#"{"pooler": {"outputSize": [0, 7]}}"#,
            r#"{"pooler": {"spatialScale": 0.0}}"#,
            r#"{"sinkhorn": {"tolerance": 0.0}}"#,
        ];
        for json in cases {
            assert!(
                matches!(HeadConfig::from_json_str(json), Err(HoiError::InvalidArgument(_))),
                "accepted {json}"
            );
        }
        assert!(matches!(HeadConfig::from_json_str(r#"{"numPairsPerImage": "x"}"#), Err(HoiError::Parse(_))));
        assert!(matches!(HeadConfig::from_json_str("{"), Err(HoiError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"numPairsPerImage": 64, "positiveFraction": 0.5}}"#).unwrap();
        let config = HeadConfig::from_file(file.path()).unwrap();
        assert_eq!(config.num_pairs_per_image, 64);
        assert_eq!(config.positive_fraction, 0.5);

        let missing = file.path().with_extension("missing");
        assert!(matches!(HeadConfig::from_file(missing), Err(HoiError::Io(_))));
    }

    #[test]
    fn test_pooler_build_carries_params() {
        let pooler = PoolerConfig { output_size: [3, 4], spatial_scale: 0.25, ..Default::default() }.build();
        assert_eq!(pooler.pooler.params.output_size, (3, 4));
        assert_eq!(pooler.pooler.params.spatial_scale, 0.25);
        assert_eq!(pooler.pooler.budget, MemoryBudget::default());
    }
}
