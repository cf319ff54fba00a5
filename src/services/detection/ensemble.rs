// Ensemble Scorer
// One weighted scorer parameterized by a ScoringProfile. The quick and refined
// detectors for text and images are profiles over the same code path.

use crate::models::{FeatureVector, ScoreResult, ScoreSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::image_features as img;
use super::image_metadata::{MetadataScores, CONTEXT_SCORE, URL_SCORE};
use super::stats::{clamp01, variance};
use super::text_features as txt;

/// Confidence adjustment when URL/context metadata corroborates the pixel score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataBoost {
    /// Score multiplier applied when either metadata signal exceeds `strong_threshold`.
    pub score_multiplier: f64,
    pub strong_threshold: f64,
    pub weak_threshold: f64,
    /// Added to confidence when both signals are strong.
    pub both_strong_bonus: f64,
    /// Added to confidence when either signal is at least weak.
    pub either_weak_bonus: f64,
}

impl Default for MetadataBoost {
    fn default() -> Self {
        Self {
            score_multiplier: 1.25,
            strong_threshold: 0.5,
            weak_threshold: 0.3,
            both_strong_bonus: 0.3,
            either_weak_bonus: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringProfile {
    pub name: String,
    /// Feature name to non-negative weight. Features absent from a vector are skipped.
    pub weights: BTreeMap<String, f64>,
    /// Applied to the normalized weighted mean; 1.0 leaves it linear.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// `k` in `confidence = 1 - variance * k`.
    #[serde(default = "default_sensitivity")]
    pub confidence_sensitivity: f64,
    /// Lowest confidence once at least one feature contributed.
    #[serde(default = "default_floor")]
    pub confidence_floor: f64,
    #[serde(default)]
    pub metadata_boost: Option<MetadataBoost>,
}

fn default_exponent() -> f64 { 1.0 }
fn default_sensitivity() -> f64 { 1.5 }
fn default_floor() -> f64 { 0.5 }

impl ScoringProfile {
    pub fn new(name: &str, weights: &[(&str, f64)]) -> Self {
        Self {
            name: name.to_string(),
            weights: weights
                .iter()
                .filter(|(_, w)| w.is_finite() && *w > 0.0)
                .map(|(k, w)| (k.to_string(), *w))
                .collect(),
            exponent: default_exponent(),
            confidence_sensitivity: default_sensitivity(),
            confidence_floor: default_floor(),
            metadata_boost: None,
        }
    }

    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }

    pub fn with_confidence(mut self, sensitivity: f64, floor: f64) -> Self {
        self.confidence_sensitivity = sensitivity;
        self.confidence_floor = floor;
        self
    }

    pub fn with_metadata_boost(mut self, boost: MetadataBoost) -> Self {
        self.metadata_boost = Some(boost);
        self
    }

    /// Cheap statistics for synchronous text scoring.
    pub fn text_quick() -> Self {
        Self::new(
            "text_quick",
            &[
                (txt::CHAR_ENTROPY, 0.35),
                (txt::SENTENCE_UNIFORMITY, 0.20),
                (txt::STOPWORD_DENSITY, 0.15),
                (txt::LIST_DENSITY, 0.15),
                (txt::HEDGING, 0.15),
            ],
        )
    }

    pub fn text_refined() -> Self {
        Self::new(
            "text_refined",
            &[
                (txt::BURSTINESS, 0.13),
                (txt::SENTENCE_FREQUENCY_UNIFORMITY, 0.11),
                (txt::COHERENCE, 0.10),
                (txt::PUNCTUATION_DIVERSITY, 0.10),
                (txt::LEXICAL_DIVERSITY, 0.09),
                (txt::COMMON_WORD_RATIO, 0.08),
                (txt::NGRAM_REPETITION, 0.07),
                (txt::WORD_ENTROPY, 0.06),
                (txt::SYNTACTIC_UNIFORMITY, 0.05),
                (txt::TRANSITION_SMOOTHNESS, 0.04),
                (txt::WORD_LENGTH_UNIFORMITY, 0.02),
                (txt::DISCOURSE_MARKERS, 0.02),
                (txt::PRONOUN_PERSON, 0.01),
                (txt::CHAR_ENTROPY, 0.08),
                (txt::SENTENCE_UNIFORMITY, 0.05),
                (txt::STOPWORD_DENSITY, 0.04),
                (txt::HEDGING, 0.03),
                (txt::LIST_DENSITY, 0.02),
            ],
        )
    }

    pub fn image_quick() -> Self {
        Self::new(
            "image_quick",
            &[
                (img::COLOR_UNIFORMITY, 0.25),
                (img::EDGE_SOFTNESS, 0.20),
                (img::LOW_FREQUENCY_RATIO, 0.20),
                (img::TEXTURE_UNIFORMITY, 0.20),
                (img::COLOR_VARIANCE, 0.15),
            ],
        )
        .with_confidence(1.2, 0.5)
    }

    pub fn image_refined() -> Self {
        Self::new(
            "image_refined",
            &[
                (img::TEXTURE_SMOOTHNESS, 0.13),
                (img::GRADIENT_SMOOTHNESS, 0.11),
                (img::FREQUENCY_UNIFORMITY, 0.09),
                (img::LOW_FREQUENCY_RATIO, 0.09),
                (img::NOISE_LEVEL, 0.08),
                (img::EDGE_CONSISTENCY, 0.07),
                (img::LBP_TEXTURE, 0.07),
                (img::BLOCK_UNIFORMITY, 0.06),
                (img::COLOR_UNIFORMITY, 0.06),
                (img::EDGE_SOFTNESS, 0.06),
                (img::MULTI_SCALE, 0.05),
                (img::TEXTURE_UNIFORMITY, 0.05),
                (img::LAB_COLOR_UNIFORMITY, 0.03),
                (img::HISTOGRAM_ENTROPY, 0.02),
                (img::ARTIFACTS, 0.02),
                (URL_SCORE, 0.03),
                (CONTEXT_SCORE, 0.02),
            ],
        )
        .with_exponent(1.2)
        .with_confidence(1.2, 0.5)
        .with_metadata_boost(MetadataBoost::default())
    }
}

/// Combine a feature vector into a score and a self-consistency confidence.
///
/// The weighted sum is normalized by the weights actually applied, optionally boosted
/// by corroborating metadata, reshaped by the profile exponent and clamped. Confidence
/// is `1 - variance * k` over the same contributing values, floored once anything
/// contributed. No contributing features yields score 0 and confidence 0.
pub fn score(
    features: &FeatureVector,
    profile: &ScoringProfile,
    metadata: Option<&MetadataScores>,
) -> ScoreResult {
    let mut weighted = 0.0;
    let mut applied = 0.0;
    let mut used: Vec<f64> = Vec::with_capacity(profile.weights.len());

    for (name, weight) in &profile.weights {
        if let Some(value) = features.get(name) {
            weighted += weight * value;
            applied += weight;
            used.push(value);
        }
    }

    if used.is_empty() || applied <= 0.0 {
        return ScoreResult::unscoreable(features.clone());
    }

    let mut raw = weighted / applied;

    if let (Some(boost), Some(meta)) = (&profile.metadata_boost, metadata) {
        if meta.url_score > boost.strong_threshold || meta.context_score > boost.strong_threshold {
            raw = (raw * boost.score_multiplier).min(1.0);
        }
    }

    let shaped = clamp01(raw).powf(profile.exponent.max(0.0));
    let score = clamp01(shaped);

    let floor = profile.confidence_floor.clamp(f64::EPSILON, 1.0);
    let mut confidence = clamp01(1.0 - variance(&used) * profile.confidence_sensitivity).max(floor);

    if let (Some(boost), Some(meta)) = (&profile.metadata_boost, metadata) {
        if meta.url_score > boost.strong_threshold && meta.context_score > boost.strong_threshold {
            confidence += boost.both_strong_bonus;
        } else if meta.url_score > boost.weak_threshold || meta.context_score > boost.weak_threshold {
            confidence += boost.either_weak_bonus;
        }
    }

    ScoreResult {
        score,
        confidence: clamp01(confidence),
        features: features.clone(),
        source: ScoreSource::Local,
    }
}
