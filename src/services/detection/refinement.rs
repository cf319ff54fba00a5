// Refinement
// Asynchronous second opinion for a unit: richer local features, optionally blended
// with a remote scorer. Remote failure always falls back to the local result.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::{
    ContentKey, ContentKind, ContentPayload, RemoteMetadata, RemoteScoreRequest,
    RemoteScoreResponse, ScoreResult, ScoreSource, UnitId,
};
use crate::services::remote_scorer::{build_request, RemoteScorer, RemoteScorerError};
use crate::services::text_processor::detect_language;

use super::classifier::ClassifierRegistry;
use super::error::DetectionError;

/// Used when the remote response carries no confidence of its own.
pub const DEFAULT_REMOTE_CONFIDENCE: f64 = 0.6;

/// One unit waiting for, or undergoing, refinement.
#[derive(Debug, Clone)]
pub struct RefinementJob {
    pub id: UnitId,
    pub generation: u64,
    pub kind: ContentKind,
    pub key: ContentKey,
    pub payload: ContentPayload,
    pub quick: ScoreResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Skipped,
    Scored { latency_ms: u64 },
    Failed,
    TimedOut,
}

#[derive(Debug)]
pub struct RefinementOutput {
    pub id: UnitId,
    pub generation: u64,
    pub result: Result<ScoreResult, DetectionError>,
    pub remote: RemoteOutcome,
}

#[derive(Clone)]
pub struct RefinementEngine {
    registry: ClassifierRegistry,
    remote: Option<Arc<dyn RemoteScorer>>,
    remote_timeout: Duration,
}

impl RefinementEngine {
    pub fn new(registry: ClassifierRegistry) -> Self {
        Self {
            registry,
            remote: None,
            remote_timeout: Duration::from_millis(3000),
        }
    }

    pub fn with_remote(mut self, scorer: Arc<dyn RemoteScorer>, timeout: Duration) -> Self {
        self.remote = Some(scorer);
        self.remote_timeout = timeout;
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<(Arc<dyn RemoteScorer>, Duration)> {
        self.remote.clone().map(|scorer| (scorer, self.remote_timeout))
    }

    pub async fn refine(&self, job: RefinementJob) -> RefinementOutput {
        let local = match &job.payload {
            ContentPayload::Text(text) => self.registry.text().refine(&text.text).await,
            ContentPayload::Image(image) => self.registry.image().refine(image).await,
        };

        let local = match local {
            Ok(result) => result,
            Err(e) => {
                return RefinementOutput {
                    id: job.id,
                    generation: job.generation,
                    result: Err(e),
                    remote: RemoteOutcome::Skipped,
                }
            }
        };

        let (result, remote) = self.consult_remote(&job, local).await;
        RefinementOutput {
            id: job.id,
            generation: job.generation,
            result: Ok(result),
            remote,
        }
    }

    async fn consult_remote(&self, job: &RefinementJob, local: ScoreResult) -> (ScoreResult, RemoteOutcome) {
        let Some(scorer) = &self.remote else {
            return (local, RemoteOutcome::Skipped);
        };
        // Metadata-only and unscoreable results have no features worth sending.
        if local.source == ScoreSource::Metadata || local.features.is_empty() {
            return (local, RemoteOutcome::Skipped);
        }

        let metadata = match &job.payload {
            ContentPayload::Text(text) => Some(RemoteMetadata {
                length: text.text.chars().count(),
                language: detect_language(&text.text),
            }),
            ContentPayload::Image(_) => None,
        };
        let request = build_request(&job.key, &local.features, metadata);

        let start = Instant::now();
        match self.call_remote(scorer.as_ref(), &request).await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let remote_confidence = response.confidence.unwrap_or(DEFAULT_REMOTE_CONFIDENCE);
                debug!(
                    "[REFINE] remote scored unit={} score={:.3} latency_ms={}",
                    job.id, response.score, latency_ms
                );
                (
                    blend(&local, response.score, remote_confidence),
                    RemoteOutcome::Scored { latency_ms },
                )
            }
            Err(e) => {
                warn!("[REFINE] unit={} kept local result: {}", job.id, e);
                (local, remote_outcome(&e))
            }
        }
    }

    async fn call_remote(
        &self,
        scorer: &dyn RemoteScorer,
        request: &RemoteScoreRequest,
    ) -> Result<RemoteScoreResponse, DetectionError> {
        let timeout_ms = self.remote_timeout.as_millis() as u64;
        let response = tokio::time::timeout(self.remote_timeout, scorer.score(request))
            .await
            .map_err(|_| RemoteScorerError::Timeout(timeout_ms))??;
        Ok(response)
    }
}

fn remote_outcome(error: &DetectionError) -> RemoteOutcome {
    match error {
        DetectionError::RemoteScorerUnreachable(RemoteScorerError::Timeout(_)) => {
            RemoteOutcome::TimedOut
        }
        _ => RemoteOutcome::Failed,
    }
}

/// Confidence-weighted merge of a local result with a remote score.
pub fn blend(local: &ScoreResult, remote_score: f64, remote_confidence: f64) -> ScoreResult {
    let remote_score = remote_score.clamp(0.0, 1.0);
    let rc = remote_confidence.clamp(0.0, 1.0);
    let lc = local.confidence.clamp(0.0, 1.0);
    let total = lc + rc;

    if total <= 0.0 {
        return ScoreResult {
            score: remote_score,
            confidence: 0.0,
            features: local.features.clone(),
            source: ScoreSource::Remote,
        };
    }

    ScoreResult {
        score: ((local.score * lc + remote_score * rc) / total).clamp(0.0, 1.0),
        confidence: ((lc * lc + rc * rc) / total).clamp(0.0, 1.0),
        features: local.features.clone(),
        source: ScoreSource::Hybrid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, TextPayload};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const TEXT: &str = "The committee reviewed the proposal carefully and approved the budget. \
                        The schedule remains ambitious but achievable for the whole team. \
                        Overall, the rollout is expected to finish before the next quarter begins.";

    struct FakeRemote {
        delay: Duration,
        response: Result<RemoteScoreResponse, u16>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn new(delay_ms: u64, response: Result<RemoteScoreResponse, u16>) -> Self {
            Self { delay: Duration::from_millis(delay_ms), response, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl RemoteScorer for FakeRemote {
        fn name(&self) -> &str {
            "fake"
        }

        async fn score(&self, request: &RemoteScoreRequest) -> Result<RemoteScoreResponse, RemoteScorerError> {
            self.seen.lock().unwrap().push(serde_json::to_string(request).unwrap());
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Ok(r) => Ok(r.clone()),
                Err(status) => Err(RemoteScorerError::Api { status: *status, message: "down".into() }),
            }
        }
    }

    fn job() -> RefinementJob {
        RefinementJob {
            id: UnitId::from("t1"),
            generation: 1,
            kind: ContentKind::Text,
            key: ContentKey::for_text(TEXT),
            payload: ContentPayload::Text(TextPayload { text: TEXT.to_string(), page_url: None }),
            quick: ScoreResult::unscoreable(FeatureVector::new()),
        }
    }

    #[test]
    fn test_blend_is_confidence_weighted() {
        let local = ScoreResult { score: 0.2, confidence: 0.6, features: FeatureVector::new(), source: ScoreSource::Local };
        let merged = blend(&local, 0.8, 0.6);
        assert!((merged.score - 0.5).abs() < 1e-12);
        assert_eq!(merged.source, ScoreSource::Hybrid);

        let merged = blend(&local, 0.8, 0.0);
        assert!((merged.score - 0.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_local_only_without_remote() {
        let output = RefinementEngine::new(ClassifierRegistry::local()).refine(job()).await;
        assert_eq!(output.remote, RemoteOutcome::Skipped);
        assert_eq!(output.result.unwrap().source, ScoreSource::Local);
    }

    #[tokio::test]
    async fn test_remote_hybrid_sends_only_features() {
        let remote = Arc::new(FakeRemote::new(0, Ok(RemoteScoreResponse { score: 0.9, confidence: None })));
        let engine = RefinementEngine::new(ClassifierRegistry::local())
            .with_remote(remote.clone(), Duration::from_millis(500));
        let output = engine.refine(job()).await;
        assert!(matches!(output.remote, RemoteOutcome::Scored { .. }));
        assert_eq!(output.result.unwrap().source, ScoreSource::Hybrid);

        let seen = remote.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].contains("committee"));
        assert!(seen[0].contains("\"language\":\"en\""));
    }

    #[tokio::test]
    async fn test_remote_timeout_falls_back_to_local() {
        let remote = Arc::new(FakeRemote::new(5_000, Ok(RemoteScoreResponse { score: 0.9, confidence: Some(0.9) })));
        let engine = RefinementEngine::new(ClassifierRegistry::local())
            .with_remote(remote, Duration::from_millis(20));
        let output = engine.refine(job()).await;
        assert_eq!(output.remote, RemoteOutcome::TimedOut);
        assert_eq!(output.result.unwrap().source, ScoreSource::Local);
    }

    #[tokio::test]
    async fn test_remote_error_falls_back_to_local() {
        let remote = Arc::new(FakeRemote::new(0, Err(503)));
        let engine = RefinementEngine::new(ClassifierRegistry::local())
            .with_remote(remote, Duration::from_millis(200));
        let output = engine.refine(job()).await;
        assert_eq!(output.remote, RemoteOutcome::Failed);
        assert!(output.result.is_ok());
    }

    #[tokio::test]
    async fn test_remote_failures_surface_as_unreachable() {
        let engine = RefinementEngine::new(ClassifierRegistry::local())
            .with_remote(Arc::new(FakeRemote::new(5_000, Err(503))), Duration::from_millis(10));
        let (scorer, _) = engine.remote().unwrap();
        let request = build_request(&job().key, &FeatureVector::new(), None);

        let err = engine.call_remote(scorer.as_ref(), &request).await.unwrap_err();
        assert!(matches!(
            err,
            DetectionError::RemoteScorerUnreachable(RemoteScorerError::Timeout(10))
        ));
        assert_eq!(remote_outcome(&err), RemoteOutcome::TimedOut);
        assert!(!err.is_expected());

        let engine = RefinementEngine::new(ClassifierRegistry::local())
            .with_remote(Arc::new(FakeRemote::new(0, Err(503))), Duration::from_millis(200));
        let (scorer, _) = engine.remote().unwrap();
        let err = engine.call_remote(scorer.as_ref(), &request).await.unwrap_err();
        assert!(matches!(
            err,
            DetectionError::RemoteScorerUnreachable(RemoteScorerError::Api { status: 503, .. })
        ));
        assert_eq!(remote_outcome(&err), RemoteOutcome::Failed);
    }
}
