// Image Metadata Signals
// Cheap URL / context scoring that needs no pixel access and may short-circuit
// pixel analysis entirely.

use crate::models::{FeatureVector, ImagePayload, ScoreResult, ScoreSource};

pub const URL_SCORE: &str = "url_score";
pub const CONTEXT_SCORE: &str = "context_score";

/// Either metadata score above this skips pixel analysis.
pub const SHORT_CIRCUIT_THRESHOLD: f64 = 0.5;
/// Confidence of a metadata-only result decided by a generator signature in a URL.
pub const URL_MATCH_CONFIDENCE: f64 = 0.90;
/// Confidence of a metadata-only result decided by page context text.
pub const CONTEXT_MATCH_CONFIDENCE: f64 = 0.80;

/// Domains and path tokens of known image generators.
const GENERATOR_SIGNATURES: &[&str] = &[
    "midjourney.com",
    "midjourney",
    "dall-e",
    "dalle",
    "stable-diffusion.com",
    "stablediffusion",
    "thispersondoesnotexist.com",
    "thiswaifudoesnotexist.net",
    "thisxdoesnotexist.com",
    "generated.photos",
    "ai-generated.com",
    "ai_generated",
    "ai-art.com",
    "deepfake",
    "gan-generated.com",
    "leonardo.ai",
    "lexica.art",
    "nightcafe.studio",
];

/// Weak hints that only add up.
const URL_KEYWORDS: &[&str] = &["ai-", "-ai", "generated", "synthetic", "diffusion", "gan-", "artbreeder"];

const CONTEXT_KEYWORDS: &[&str] = &[
    "ai generated",
    "ai-generated",
    "generated by ai",
    "generated with ai",
    "created with ai",
    "made with ai",
    "ai art",
    "ai image",
    "midjourney",
    "dall-e",
    "dalle",
    "stable diffusion",
    "text-to-image",
    "synthetic image",
    "deepfake",
];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetadataScores {
    pub url_score: f64,
    pub context_score: f64,
}

impl MetadataScores {
    pub fn should_short_circuit(&self) -> bool {
        self.url_score > SHORT_CIRCUIT_THRESHOLD || self.context_score > SHORT_CIRCUIT_THRESHOLD
    }

    pub fn to_features(&self) -> FeatureVector {
        let mut fv = FeatureVector::new();
        fv.insert(URL_SCORE, self.url_score);
        fv.insert(CONTEXT_SCORE, self.context_score);
        fv
    }
}

/// Score a single URL-like string against generator signatures and keywords.
pub fn url_score(url: &str) -> f64 {
    let lower = url.to_lowercase();
    if lower.is_empty() {
        return 0.0;
    }
    if GENERATOR_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return URL_MATCH_CONFIDENCE;
    }
    let hits = URL_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
    (hits as f64 * 0.3).min(1.0)
}

pub fn context_score(context: &str) -> f64 {
    let lower = context.to_lowercase();
    let hits = CONTEXT_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
    (hits as f64 * 0.35).min(1.0)
}

pub fn score_metadata(payload: &ImagePayload) -> MetadataScores {
    let url = [Some(payload.src.as_str()), payload.link.as_deref()]
        .into_iter()
        .flatten()
        .map(url_score)
        .fold(0.0, f64::max);
    MetadataScores {
        url_score: url,
        context_score: context_score(&payload.context_text()),
    }
}

/// Metadata-only result when the signals are strong enough to skip pixel analysis.
pub fn metadata_result(scores: &MetadataScores) -> Option<ScoreResult> {
    if !scores.should_short_circuit() {
        return None;
    }
    let confidence = if scores.url_score > SHORT_CIRCUIT_THRESHOLD {
        URL_MATCH_CONFIDENCE
    } else {
        CONTEXT_MATCH_CONFIDENCE
    };
    Some(ScoreResult {
        score: scores.url_score.max(scores.context_score),
        confidence,
        features: scores.to_features(),
        source: ScoreSource::Metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_domain_short_circuits() {
        let payload = ImagePayload::new("https://cdn.midjourney.com/abc/0_0.png");
        let scores = score_metadata(&payload);
        assert_eq!(scores.url_score, URL_MATCH_CONFIDENCE);
        let result = metadata_result(&scores).unwrap();
        assert_eq!(result.source, ScoreSource::Metadata);
        assert!(result.confidence >= 0.75);
    }

    #[test]
    fn test_context_keywords_accumulate() {
        let mut payload = ImagePayload::new("https://images.example.org/photo.jpg");
        payload.alt = Some("AI-generated portrait".to_string());
        payload.surrounding_text = Some("Made with AI using Stable Diffusion".to_string());
        let scores = score_metadata(&payload);
        assert_eq!(scores.url_score, 0.0);
        assert!(scores.context_score > SHORT_CIRCUIT_THRESHOLD);
        assert_eq!(metadata_result(&scores).unwrap().confidence, CONTEXT_MATCH_CONFIDENCE);
    }

    #[test]
    fn test_plain_photo_has_no_metadata_signal() {
        let mut payload = ImagePayload::new("https://images.example.org/holiday/beach.jpg");
        payload.alt = Some("Our family at the beach".to_string());
        let scores = score_metadata(&payload);
        assert!(!scores.should_short_circuit());
        assert!(metadata_result(&scores).is_none());
    }

    #[test]
    fn test_link_is_also_checked() {
        let mut payload = ImagePayload::new("https://cdn.example.com/thumb.png");
        payload.link = Some("https://thispersondoesnotexist.com/".to_string());
        assert_eq!(score_metadata(&payload).url_score, URL_MATCH_CONFIDENCE);
    }
}
