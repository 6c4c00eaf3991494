//! Box-pair interaction head for human-object interaction detection.
//!
//! Pairs each detected person with every other detection, gates the pairs with
//! detection confidence, pools masked union-box features under a memory ceiling
//! and turns classifier logits into a training loss or per-image interaction
//! scores.

pub mod config;
pub mod detection;
pub mod error;
pub mod head;
pub mod loss;
pub mod ops;
pub mod pairs;
pub mod prior;

pub use config::{HeadConfig, PoolerConfig};
pub use detection::{Detection, GroundTruthPairs};
pub use error::{HoiError, Result};
pub use head::{HeadOutput, InteractionHead, InteractionResult, Mode, PairBatch, PairClassifier};
pub use ops::masked_roi_align::MemoryBudget;
pub use pairs::CandidatePair;
pub use prior::ObjectToInteractionMap;
