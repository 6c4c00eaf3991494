use std::fs;
use std::path::Path;

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{HoiError, Result};
use crate::pairs::CandidatePair;

/// Interaction classes reachable from each object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectToInteractionMap {
    num_classes: usize,
    object_to_interactions: Vec<Vec<usize>>,
}

impl ObjectToInteractionMap {
    /// Builds the map from one interaction list per object class. Lists keep their
    /// order with repeated entries dropped.
    pub fn new(num_classes: usize, object_to_interactions: Vec<Vec<usize>>) -> Result<Self> {
        let mut cleaned = Vec::with_capacity(object_to_interactions.len());
        for (object, targets) in object_to_interactions.into_iter().enumerate() {
            let mut set: Vec<usize> = Vec::with_capacity(targets.len());
            for t in targets {
                if t >= num_classes {
                    return Err(HoiError::invalid(format!(
                        "object class {object} maps to interaction {t}, outside {num_classes} classes"
                    )));
                }
                if !set.contains(&t) { set.push(t); }
            }
            cleaned.push(set);
        }
        Ok(Self { num_classes, object_to_interactions: cleaned })
    }

    /// Inverts a table giving the object class of every interaction class.
    pub fn from_interaction_objects(interaction_objects: &[usize], num_objects: usize) -> Result<Self> {
        let mut table = vec![Vec::new(); num_objects];
        for (interaction, &object) in interaction_objects.iter().enumerate() {
            let entry = table.get_mut(object).ok_or_else(|| {
                HoiError::invalid(format!(
                    "interaction {interaction} refers to object {object}, outside {num_objects} objects"
                ))
            })?;
            entry.push(interaction);
        }
        Self::new(interaction_objects.len(), table)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: ObjectToInteractionMap = serde_json::from_str(s)?;
        Self::new(raw.num_classes, raw.object_to_interactions)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_object_classes(&self) -> usize {
        self.object_to_interactions.len()
    }

    pub fn targets(&self, object: usize) -> Option<&[usize]> {
        self.object_to_interactions.get(object).map(Vec::as_slice)
    }

    /// Spreads `scores[h] * scores[o]` over the interaction classes of each pair's
    /// object, giving `[M, K]` prior scores.
    pub fn map_scores(
        &self,
        scores: ArrayView1<f32>,
        labels: ArrayView1<usize>,
        pairs: &[CandidatePair],
    ) -> Result<Array2<f32>> {
        let n = scores.len();
        if labels.len() != n {
            return Err(HoiError::invalid(format!("{n} scores but {} labels", labels.len())));
        }
        if let Some(p) = pairs.iter().find(|p| p.h >= n || p.o >= n) {
            return Err(HoiError::invalid(format!("pair ({}, {}) indexes past {n} detections", p.h, p.o)));
        }
        if let Some(&l) = labels.iter().find(|&&l| l >= self.num_object_classes()) {
            return Err(HoiError::invalid(format!(
                "object label {l} outside {} object classes",
                self.num_object_classes()
            )));
        }

        let mut mapped = Array2::<f32>::zeros((pairs.len(), self.num_classes));
        for (row, p) in pairs.iter().enumerate() {
            let score = scores[p.h] * scores[p.o];
            for &c in &self.object_to_interactions[labels[p.o]] {
                mapped[[row, c]] = score;
            }
        }
        Ok(mapped)
    }
}
