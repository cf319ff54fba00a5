// Classifier Strategies
// Typed text and image classifiers behind traits, plus a ranked registry that picks
// the implementation once instead of probing per call.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::models::{ImagePayload, ScoreResult, ScoreSource};
use crate::services::text_processor::TextAnalysis;

use super::ensemble::{score, ScoringProfile};
use super::error::DetectionError;
use super::image_features::{self, require_pixels};
use super::image_metadata::{metadata_result, score_metadata, MetadataScores};
use super::text_features::{self, MIN_TEXT_CHARS};

/// Texts with fewer words than this have their score capped.
pub const SHORT_TEXT_WORDS: usize = 20;
pub const SHORT_TEXT_SCORE_CAP: f64 = 0.1;
/// Confidence of a metadata-only fallback that did not reach the short-circuit bar.
pub const WEAK_METADATA_CONFIDENCE: f64 = 0.5;

#[async_trait]
pub trait TextClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Synchronous score at discovery time. Never suspends.
    fn quick(&self, text: &str) -> ScoreResult;

    async fn refine(&self, text: &str) -> Result<ScoreResult, DetectionError>;
}

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn quick(&self, payload: &ImagePayload) -> ScoreResult;

    async fn refine(&self, payload: &ImagePayload) -> Result<ScoreResult, DetectionError>;
}

// ============ Local text ============

pub struct LocalTextClassifier {
    quick_profile: ScoringProfile,
    refined_profile: ScoringProfile,
}

impl Default for LocalTextClassifier {
    fn default() -> Self {
        Self {
            quick_profile: ScoringProfile::text_quick(),
            refined_profile: ScoringProfile::text_refined(),
        }
    }
}

impl LocalTextClassifier {
    pub fn with_profiles(quick_profile: ScoringProfile, refined_profile: ScoringProfile) -> Self {
        Self { quick_profile, refined_profile }
    }

    fn classify(&self, text: &str, refined: bool) -> ScoreResult {
        if text.trim().chars().count() < MIN_TEXT_CHARS {
            return ScoreResult::unscoreable(Default::default());
        }
        let analysis = TextAnalysis::new(text);
        let (features, profile) = if refined {
            (text_features::extract_refined_from(&analysis), &self.refined_profile)
        } else {
            (text_features::extract_quick_from(&analysis), &self.quick_profile)
        };
        let mut result = score(&features, profile, None);
        if analysis.word_count() < SHORT_TEXT_WORDS {
            result.score = result.score.min(SHORT_TEXT_SCORE_CAP);
        }
        result
    }
}

#[async_trait]
impl TextClassifier for LocalTextClassifier {
    fn name(&self) -> &str {
        "local-stylometry"
    }

    fn quick(&self, text: &str) -> ScoreResult {
        self.classify(text, false)
    }

    async fn refine(&self, text: &str) -> Result<ScoreResult, DetectionError> {
        tokio::task::yield_now().await;
        Ok(self.classify(text, true))
    }
}

// ============ Local image ============

pub struct LocalImageClassifier {
    quick_profile: ScoringProfile,
    refined_profile: ScoringProfile,
}

impl Default for LocalImageClassifier {
    fn default() -> Self {
        Self {
            quick_profile: ScoringProfile::image_quick(),
            refined_profile: ScoringProfile::image_refined(),
        }
    }
}

/// Result used when pixels cannot be read.
fn metadata_fallback(meta: &MetadataScores) -> ScoreResult {
    if let Some(result) = metadata_result(meta) {
        return result;
    }
    if meta.url_score <= 0.0 && meta.context_score <= 0.0 {
        let mut result = ScoreResult::unscoreable(meta.to_features());
        result.source = ScoreSource::Metadata;
        return result;
    }
    ScoreResult {
        score: meta.url_score.max(meta.context_score),
        confidence: WEAK_METADATA_CONFIDENCE,
        features: meta.to_features(),
        source: ScoreSource::Metadata,
    }
}

impl LocalImageClassifier {
    fn pixel_unavailable(&self, payload: &ImagePayload, err: DetectionError, meta: &MetadataScores) -> ScoreResult {
        debug!("[IMAGE] pixel analysis unavailable src={} : {}", truncate(&payload.src, 80), err);
        metadata_fallback(meta)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ImageClassifier for LocalImageClassifier {
    fn name(&self) -> &str {
        "local-pixels"
    }

    fn quick(&self, payload: &ImagePayload) -> ScoreResult {
        let meta = score_metadata(payload);
        if let Some(result) = metadata_result(&meta) {
            return result;
        }
        match require_pixels(payload) {
            Ok(sample) => score(&image_features::extract_quick(sample), &self.quick_profile, Some(&meta)),
            Err(err) => self.pixel_unavailable(payload, err, &meta),
        }
    }

    async fn refine(&self, payload: &ImagePayload) -> Result<ScoreResult, DetectionError> {
        let meta = score_metadata(payload);
        if let Some(result) = metadata_result(&meta) {
            return Ok(result);
        }
        let sample = match require_pixels(payload) {
            Ok(sample) => sample,
            Err(err) => return Ok(self.pixel_unavailable(payload, err, &meta)),
        };
        let mut features = image_features::extract_refined_chunked(sample).await;
        features.merge(&meta.to_features());
        Ok(score(&features, &self.refined_profile, Some(&meta)))
    }
}

// ============ Registry ============

struct Ranked<T: ?Sized> {
    rank: i32,
    classifier: Arc<T>,
}

/// Candidate classifiers ordered by rank. Higher rank wins; ties keep registration order.
pub struct ClassifierRegistryBuilder {
    text: Vec<Ranked<dyn TextClassifier>>,
    image: Vec<Ranked<dyn ImageClassifier>>,
}

impl ClassifierRegistryBuilder {
    pub fn text(mut self, rank: i32, classifier: Arc<dyn TextClassifier>) -> Self {
        self.text.push(Ranked { rank, classifier });
        self
    }

    pub fn image(mut self, rank: i32, classifier: Arc<dyn ImageClassifier>) -> Self {
        self.image.push(Ranked { rank, classifier });
        self
    }

    /// Resolve the winning implementation per kind. Local classifiers fill any gap.
    pub fn build(mut self) -> ClassifierRegistry {
        self.text.sort_by(|a, b| b.rank.cmp(&a.rank));
        self.image.sort_by(|a, b| b.rank.cmp(&a.rank));

        let text = self
            .text
            .into_iter()
            .next()
            .map(|r| r.classifier)
            .unwrap_or_else(|| Arc::new(LocalTextClassifier::default()));
        let image = self
            .image
            .into_iter()
            .next()
            .map(|r| r.classifier)
            .unwrap_or_else(|| Arc::new(LocalImageClassifier::default()));

        tracing::info!(
            "[SCAN] classifiers resolved text={} image={}",
            text.name(),
            image.name()
        );
        ClassifierRegistry { text, image }
    }
}

#[derive(Clone)]
pub struct ClassifierRegistry {
    text: Arc<dyn TextClassifier>,
    image: Arc<dyn ImageClassifier>,
}

impl ClassifierRegistry {
    pub fn builder() -> ClassifierRegistryBuilder {
        ClassifierRegistryBuilder {
            text: Vec::new(),
            image: Vec::new(),
        }
    }

    pub fn local() -> Self {
        Self::builder().build()
    }

    pub fn text(&self) -> &Arc<dyn TextClassifier> {
        &self.text
    }

    pub fn image(&self) -> &Arc<dyn ImageClassifier> {
        &self.image
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PixelSource;
    use crate::services::detection::image_features::fixtures;

    const SHORT: &str = "Quick note: the meeting moved to Friday after lunch today.";

    #[test]
    fn test_short_text_is_capped() {
        let result = LocalTextClassifier::default().quick(SHORT);
        assert!(result.score <= SHORT_TEXT_SCORE_CAP);
    }

    #[test]
    fn test_tiny_text_is_unscoreable() {
        let result = LocalTextClassifier::default().quick("  hi there  ");
        assert_eq!(result.score, 0.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_refine_is_deterministic() {
        let classifier = LocalTextClassifier::default();
        let text = "The committee reviewed the proposal carefully. It is important to note that the budget was approved. \
                    The schedule remains ambitious but achievable. Overall, the team expects a smooth rollout next quarter.";
        let a = classifier.refine(text).await.unwrap();
        let b = classifier.refine(text).await.unwrap();
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a.score));
    }

    #[test]
    fn test_generator_url_short_circuits_without_pixels() {
        let mut payload = ImagePayload::new("https://cdn.midjourney.com/grid/0_1.webp");
        payload.pixels = PixelSource::Denied;
        let result = LocalImageClassifier::default().quick(&payload);
        assert_eq!(result.source, ScoreSource::Metadata);
        assert!(result.confidence >= 0.75);
    }

    #[test]
    fn test_denied_pixels_fall_back_to_metadata() {
        let mut payload = ImagePayload::new("https://images.example.org/photo.jpg");
        payload.pixels = PixelSource::Denied;
        let result = LocalImageClassifier::default().quick(&payload);
        assert_eq!(result.source, ScoreSource::Metadata);
        assert_eq!(result.confidence, 0.0);

        payload.alt = Some("ai art".to_string());
        let result = LocalImageClassifier::default().quick(&payload);
        assert_eq!(result.confidence, WEAK_METADATA_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_pixel_path_scores_local() {
        let mut payload = ImagePayload::new("https://images.example.org/photo.png");
        payload.pixels = PixelSource::Available(fixtures::noisy(64, 64, 7));
        let classifier = LocalImageClassifier::default();
        let quick = classifier.quick(&payload);
        let refined = classifier.refine(&payload).await.unwrap();
        assert_eq!(quick.source, ScoreSource::Local);
        assert_eq!(refined.source, ScoreSource::Local);
        assert!(refined.features.len() > quick.features.len());
    }

    #[tokio::test]
    async fn test_truncated_raster_falls_back_to_metadata() {
        let mut sample = fixtures::noisy(64, 64, 7);
        sample.rgba.truncate(64 * 4);
        let mut payload = ImagePayload::new("https://images.example.org/photo.png");
        payload.pixels = PixelSource::Available(sample);
        let classifier = LocalImageClassifier::default();
        assert_eq!(classifier.quick(&payload).source, ScoreSource::Metadata);
        assert_eq!(classifier.refine(&payload).await.unwrap().source, ScoreSource::Metadata);
    }

    struct Fixed(f64);

    #[async_trait]
    impl TextClassifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn quick(&self, _text: &str) -> ScoreResult {
            ScoreResult { score: self.0, confidence: 1.0, features: Default::default(), source: ScoreSource::Local }
        }
        async fn refine(&self, text: &str) -> Result<ScoreResult, DetectionError> {
            Ok(self.quick(text))
        }
    }

    #[test]
    fn test_registry_picks_highest_rank() {
        let registry = ClassifierRegistry::builder()
            .text(1, Arc::new(Fixed(0.1)))
            .text(10, Arc::new(Fixed(0.9)))
            .text(5, Arc::new(Fixed(0.5)))
            .build();
        assert_eq!(registry.text().quick("x").score, 0.9);
        assert_eq!(registry.image().name(), "local-pixels");
    }
}
