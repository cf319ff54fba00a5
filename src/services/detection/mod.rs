// Detection Module
// Heuristic scoring core organized into specialized submodules:
// - text_features / image_features / image_metadata: feature extraction
// - ensemble: weighted scoring of feature vectors
// - sensitivity: thresholds, sensitivity and allowlist policy
// - classifier: text and image strategies plus the ranked registry
// - refinement: asynchronous second pass with optional remote blending
// - aggregation: page-level summary

pub mod stats;
pub mod error;
pub mod text_features;
pub mod image_features;
pub mod image_metadata;
pub mod ensemble;
pub mod sensitivity;
pub mod classifier;
pub mod refinement;
pub mod aggregation;

pub use aggregation::summarize_page;
pub use classifier::{
    ClassifierRegistry,
    ImageClassifier,
    LocalImageClassifier,
    LocalTextClassifier,
    TextClassifier,
};
pub use ensemble::{score, ScoringProfile};
pub use error::DetectionError;
pub use refinement::{blend, RefinementEngine, RefinementJob, RefinementOutput, RemoteOutcome};
pub use sensitivity::{DetectionSensitivity, KindThresholds, ThresholdPolicy};
