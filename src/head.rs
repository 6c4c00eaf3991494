use ndarray::{concatenate, s, Array2, ArrayView2, ArrayView4, Axis};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::HeadConfig;
use crate::detection::{Detection, GroundTruthPairs};
use crate::error::{HoiError, Result};
use crate::loss::interaction_loss;
use crate::ops::box_pair_pooler::BoxPairPooler;
use crate::ops::{gather_rows, sigmoid};
use crate::pairs::sampler::{assign_labels, PairSampler};
use crate::pairs::{construct_pairs, inject_ground_truth, CandidatePair};
use crate::prior::ObjectToInteractionMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Maps pooled pair features `[M, C, h, w]` to interaction logits `[M, K]`.
pub trait PairClassifier {
    fn classify(&self, pooled: ArrayView4<f32>) -> Result<Array2<f32>>;
}

impl<F> PairClassifier for F
where
    F: Fn(ArrayView4<f32>) -> Result<Array2<f32>>,
{
    fn classify(&self, pooled: ArrayView4<f32>) -> Result<Array2<f32>> {
        self(pooled)
    }
}

/// Candidate pairs of one image with everything needed downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub pairs: Vec<CandidatePair>,
    pub boxes_h: Array2<f32>,
    pub boxes_o: Array2<f32>,
    pub prior_scores: Array2<f32>,
    /// Present in training only.
    pub labels: Option<Array2<f32>>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Scored interactions for one image, one entry per (pair, class).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionResult {
    pub boxes_h: Vec<[f32; 4]>,
    pub boxes_o: Vec<[f32; 4]>,
    pub labels: Vec<usize>,
    pub scores: Vec<f32>,
}

impl InteractionResult {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadOutput {
    Loss(f32),
    Detections(Vec<InteractionResult>),
}

/// Turns object detections into scored human-object interactions.
#[derive(Debug, Clone)]
pub struct InteractionHead {
    config: HeadConfig,
    object_map: ObjectToInteractionMap,
    pooler: BoxPairPooler,
    sampler: PairSampler,
}

impl InteractionHead {
    pub fn new(config: HeadConfig, object_map: ObjectToInteractionMap) -> Result<Self> {
        config.validate()?;
        if config.human_class_index >= object_map.num_object_classes() {
            return Err(HoiError::invalid(format!(
                "human class {} outside {} object classes",
                config.human_class_index,
                object_map.num_object_classes()
            )));
        }
        let pooler = config.pooler.build();
        let sampler = PairSampler::new(config.num_pairs_per_image, config.positive_fraction)?;
        info!(
            "event" = "head.init",
            num_classes = object_map.num_classes(),
            num_object_classes = object_map.num_object_classes(),
            human_class = config.human_class_index,
            pairs_per_image = config.num_pairs_per_image
        );
        Ok(Self { config, object_map, pooler, sampler })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn object_map(&self) -> &ObjectToInteractionMap {
        &self.object_map
    }

    pub fn num_classes(&self) -> usize {
        self.object_map.num_classes()
    }

    /// Score threshold and class-wise NMS applied before pairing at inference.
    pub fn filter_detections(&self, detection: &Detection) -> Detection {
        detection.filter(self.config.box_score_thresh, self.config.box_nms_thresh)
    }

    /// Builds the candidate pairs of one image.
    ///
    /// Training injects the ground truth, labels every pair and subsamples;
    /// inference filters the detections first. Targets are ignored at inference.
    pub fn pair_up<R: Rng + ?Sized>(
        &self,
        detection: &Detection,
        targets: Option<&GroundTruthPairs>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<PairBatch> {
        let human = self.config.human_class_index;
        let batch = match mode {
            Mode::Inference => {
                let detection = self.filter_detections(detection);
                let pairs = construct_pairs(detection.labels().view(), human);
                self.batch_for(&detection, pairs, None)?
            }
            Mode::Training => {
                let targets = targets.ok_or_else(|| {
                    HoiError::MissingTargets("no ground truth given for the image".into())
                })?;
                let (augmented, mut pairs) = inject_ground_truth(detection, targets, human)?;
                pairs.extend(construct_pairs(augmented.labels().view(), human));

                let boxes_h = gather_rows(augmented.boxes().view(), &side(&pairs, |p| p.h));
                let boxes_o = gather_rows(augmented.boxes().view(), &side(&pairs, |p| p.o));
                let labels = assign_labels(
                    boxes_h.view(),
                    boxes_o.view(),
                    targets,
                    self.config.fg_iou_thresh,
                    self.num_classes(),
                )?;
                let keep = self.sampler.subsample(labels.view(), rng);
                let pairs = keep.iter().map(|&i| pairs[i]).collect();
                self.batch_for(&augmented, pairs, Some(gather_rows(labels.view(), &keep)))?
            }
        };
        debug!("event" = "head.pair_up", mode = ?mode, detections = detection.len(), pairs = batch.len());
        Ok(batch)
    }

    fn batch_for(
        &self,
        detection: &Detection,
        pairs: Vec<CandidatePair>,
        labels: Option<Array2<f32>>,
    ) -> Result<PairBatch> {
        let prior_scores = self.object_map.map_scores(detection.scores().view(), detection.labels().view(), &pairs)?;
        Ok(PairBatch {
            boxes_h: gather_rows(detection.boxes().view(), &side(&pairs, |p| p.h)),
            boxes_o: gather_rows(detection.boxes().view(), &side(&pairs, |p| p.o)),
            prior_scores,
            labels,
            pairs,
        })
    }

    /// Training loss over the pairs of every image.
    pub fn compute_loss(&self, batches: &[PairBatch], logits: ArrayView2<f32>) -> Result<f32> {
        let k = self.num_classes();
        let mut priors = Vec::with_capacity(batches.len());
        let mut labels = Vec::with_capacity(batches.len());
        for (image, batch) in batches.iter().enumerate() {
            let l = batch.labels.as_ref().ok_or_else(|| {
                HoiError::MissingTargets(format!("pairs of image {image} carry no labels"))
            })?;
            priors.push(batch.prior_scores.view());
            labels.push(l.view());
        }
        let stack = |parts: &[ArrayView2<f32>]| -> Result<Array2<f32>> {
            if parts.is_empty() {
                return Ok(Array2::zeros((0, k)));
            }
            concatenate(Axis(0), parts).map_err(|e| HoiError::invalid(format!("cannot stack pair batches: {e}")))
        };
        interaction_loss(logits, stack(&priors)?.view(), stack(&labels)?.view())
    }

    /// Final scores for one image: prior times probability, normalized per class,
    /// thresholded. Entries come out pair-major, class-minor.
    pub fn postprocess(&self, batch: &PairBatch, logits: ArrayView2<f32>) -> Result<InteractionResult> {
        if logits.dim() != batch.prior_scores.dim() {
            return Err(HoiError::invalid(format!(
                "logits {:?} do not match prior scores {:?}",
                logits.dim(),
                batch.prior_scores.dim()
            )));
        }
        let mut scores = &batch.prior_scores * &logits.mapv(sigmoid);
        self.config.sinkhorn.normalize_pair_scores(
            batch.boxes_h.view(),
            batch.boxes_o.view(),
            batch.prior_scores.view(),
            &mut scores,
        )?;

        let mut result = InteractionResult::default();
        for ((i, c), &score) in scores.indexed_iter() {
            if score > self.config.interaction_score_thresh {
                result.boxes_h.push(corners(batch.boxes_h.view(), i));
                result.boxes_o.push(corners(batch.boxes_o.view(), i));
                result.labels.push(c);
                result.scores.push(score);
            }
        }
        Ok(result)
    }

    /// Runs the head over a batch of images.
    ///
    /// `features` holds one map per image, in the order of `detections`.
    pub fn forward<C, R>(
        &self,
        features: ArrayView4<f32>,
        detections: &[Detection],
        targets: Option<&[GroundTruthPairs]>,
        mode: Mode,
        classifier: &C,
        rng: &mut R,
    ) -> Result<HeadOutput>
    where
        C: PairClassifier + ?Sized,
        R: Rng + ?Sized,
    {
        if features.dim().0 != detections.len() {
            return Err(HoiError::invalid(format!(
                "{} feature maps for {} images",
                features.dim().0,
                detections.len()
            )));
        }
        let targets = match (mode, targets) {
            (Mode::Training, None) => {
                return Err(HoiError::MissingTargets("training needs ground truth for every image".into()));
            }
            (Mode::Training, Some(t)) if t.len() != detections.len() => {
                return Err(HoiError::MissingTargets(format!(
                    "{} ground-truth sets for {} images",
                    t.len(),
                    detections.len()
                )));
            }
            (_, t) => t,
        };

        let batches = detections
            .iter()
            .enumerate()
            .map(|(i, d)| self.pair_up(d, targets.map(|t| &t[i]), mode, rng))
            .collect::<Result<Vec<_>>>()?;
        let total: usize = batches.iter().map(PairBatch::len).sum();

        let logits = if total == 0 {
            Array2::zeros((0, self.num_classes()))
        } else {
            let boxes_h: Vec<Array2<f32>> = batches.iter().map(|b| b.boxes_h.clone()).collect();
            let boxes_o: Vec<Array2<f32>> = batches.iter().map(|b| b.boxes_o.clone()).collect();
            let pooled = self.pooler.forward(features, &boxes_h, &boxes_o)?;
            let logits = classifier.classify(pooled.view())?;
            if logits.dim() != (total, self.num_classes()) {
                return Err(HoiError::invalid(format!(
                    "classifier returned {:?}, expected {:?}",
                    logits.dim(),
                    (total, self.num_classes())
                )));
            }
            logits
        };
        debug!("event" = "head.forward", mode = ?mode, images = detections.len(), pairs = total);

        match mode {
            Mode::Training => Ok(HeadOutput::Loss(self.compute_loss(&batches, logits.view())?)),
            Mode::Inference => {
                let mut results = Vec::with_capacity(batches.len());
                let mut start = 0;
                for batch in &batches {
                    let end = start + batch.len();
                    results.push(self.postprocess(batch, logits.slice(s![start..end, ..]))?);
                    start = end;
                }
                Ok(HeadOutput::Detections(results))
            }
        }
    }
}

fn side(pairs: &[CandidatePair], pick: impl Fn(&CandidatePair) -> usize) -> Vec<usize> {
    pairs.iter().map(pick).collect()
}

fn corners(boxes: ArrayView2<f32>, i: usize) -> [f32; 4] {
    [boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]]
}
