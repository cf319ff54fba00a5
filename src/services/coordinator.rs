// Scan Coordinator
// Owns the live units of a page session. Quick-scores discoveries synchronously,
// then refines them through a bounded worklist.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{debug, info, warn};

use crate::models::{
    ContentKey, ContentKind, ContentPayload, DiscoveryEvent, PageSummary, ScoreResult,
    ScoreStage, TelemetryEvent, UnitId, UnitState,
};
use crate::services::annotation::{AnnotationRenderer, AnnotationSink, RenderConfig, RenderError};
use crate::services::config_store::{AppConfig, ConfigError, PreferenceStore};
use crate::services::detection::aggregation::summarize_page;
use crate::services::detection::classifier::ClassifierRegistry;
use crate::services::detection::error::DetectionError;
use crate::services::detection::refinement::{
    RefinementEngine, RefinementJob, RefinementOutput, RemoteOutcome,
};
use crate::services::detection::sensitivity::ThresholdPolicy;
use crate::services::remote_scorer::{resolve_url, HttpRemoteScorer, RemoteScorer};
use crate::services::result_cache::{CacheStats, ResultCache};
use crate::services::telemetry::{DetectionHistory, RemoteStats, TelemetrySink};
use crate::services::unit::{
    judge_refinement, ClassificationUnit, RefinementOutcome, RefinementPolicy, TransitionError,
    UnitEvent, Verdict,
};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Scan knobs resolved for one discovery batch.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub enabled: bool,
    pub refine: bool,
    pub refine_suppressed: bool,
    pub max_in_flight: usize,
    pub yield_every: usize,
    pub min_text_chars: usize,
    pub min_image_dimension: u32,
}

impl ScanSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enabled: config.enabled,
            refine: config.refinement.enabled,
            refine_suppressed: config.refinement.refine_suppressed,
            max_in_flight: config.refinement.max_in_flight.max(1),
            yield_every: config.refinement.yield_every.max(1),
            min_text_chars: config.filters.min_text_chars,
            min_image_dimension: config.filters.min_image_dimension,
        }
    }

    fn passes_filters(&self, payload: &ContentPayload) -> bool {
        match payload {
            ContentPayload::Text(text) => text.text.trim().chars().count() >= self.min_text_chars,
            ContentPayload::Image(image) => {
                let (w, h) = image.dimensions();
                // unknown dimensions still get the metadata path
                w == 0 || h == 0 || (w >= self.min_image_dimension && h >= self.min_image_dimension)
            }
        }
    }
}

/// Immutable view of the preferences for one batch. A refinement resolves against the
/// context of the batch that discovered its unit.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub render: RenderConfig,
    pub thresholds: ThresholdPolicy,
    pub refinement: RefinementPolicy,
    pub settings: ScanSettings,
}

impl BatchContext {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            render: config.render_config(),
            thresholds: config.threshold_policy(),
            refinement: config.refinement_policy(),
            settings: ScanSettings::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub accepted: usize,
    pub annotated: usize,
    pub suppressed: usize,
    pub scheduled: usize,
    pub duplicates: usize,
    pub filtered: usize,
    pub malformed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementReport {
    pub id: UnitId,
    /// `None` when the result arrived for a unit that is gone or no longer refining.
    pub state: Option<UnitState>,
}

#[derive(Debug, Default)]
struct Accepted {
    annotated: bool,
    scheduled: bool,
    failed: bool,
}

enum Discovery {
    Accepted(Accepted),
    Duplicate,
    Filtered,
}

struct Pending {
    job: RefinementJob,
    ctx: Arc<BatchContext>,
    text: Option<String>,
}

/// Kept per launched job until its result is resolved.
struct Resolving {
    ctx: Arc<BatchContext>,
    text: Option<String>,
}

pub struct ScanCoordinator<S: AnnotationSink> {
    prefs: Arc<dyn PreferenceStore>,
    registry: ClassifierRegistry,
    engine: RefinementEngine,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    renderer: AnnotationRenderer<S>,
    text_cache: ResultCache,
    image_cache: ResultCache,
    units: HashMap<UnitId, ClassificationUnit>,
    pending: VecDeque<Pending>,
    in_flight: JoinSet<RefinementOutput>,
    tasks: HashMap<TaskId, (UnitId, u64)>,
    resolving: HashMap<(UnitId, u64), Resolving>,
    ctx: Arc<BatchContext>,
    next_generation: u64,
    image_jobs_launched: usize,
    history: DetectionHistory,
    remote_stats: RemoteStats,
}

impl<S: AnnotationSink> ScanCoordinator<S> {
    /// Build a coordinator from the current preferences. Cache sizes and the remote
    /// endpoint are fixed for the session; everything else is re-read per batch.
    pub fn new(prefs: Arc<dyn PreferenceStore>, sink: S) -> Result<Self, ConfigError> {
        let config = prefs.load()?;
        let registry = ClassifierRegistry::local();
        let mut engine = RefinementEngine::new(registry.clone());

        if config.remote.enabled {
            match resolve_url(config.remote.url.as_deref()) {
                Some(url) => match HttpRemoteScorer::new(&url, config.remote.timeout_ms) {
                    Ok(scorer) => {
                        info!("[SCAN] remote scorer enabled url={}", url);
                        engine = engine.with_remote(
                            Arc::new(scorer),
                            Duration::from_millis(config.remote.timeout_ms),
                        );
                    }
                    Err(e) => warn!("[SCAN] remote scorer disabled: {}", e),
                },
                None => warn!("[SCAN] remote scoring enabled but no url configured"),
            }
        }

        Ok(Self {
            prefs,
            registry,
            engine,
            telemetry: None,
            renderer: AnnotationRenderer::new(sink),
            text_cache: ResultCache::new(config.cache.text_capacity, config.cache.policy),
            image_cache: ResultCache::new(config.cache.image_capacity, config.cache.policy),
            units: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: JoinSet::new(),
            tasks: HashMap::new(),
            resolving: HashMap::new(),
            ctx: Arc::new(BatchContext::from_config(&config)),
            next_generation: 1,
            image_jobs_launched: 0,
            history: DetectionHistory::default(),
            remote_stats: RemoteStats::default(),
        })
    }

    /// Replace the classifiers. Keeps any configured remote scorer.
    pub fn with_registry(mut self, registry: ClassifierRegistry) -> Self {
        let mut engine = RefinementEngine::new(registry.clone());
        if let Some((scorer, timeout)) = self.engine.remote() {
            engine = engine.with_remote(scorer, timeout);
        }
        self.registry = registry;
        self.engine = engine;
        self
    }

    pub fn with_remote_scorer(mut self, scorer: Arc<dyn RemoteScorer>, timeout: Duration) -> Self {
        self.engine = RefinementEngine::new(self.registry.clone()).with_remote(scorer, timeout);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    // ============ Discovery ============

    /// Process one batch of discovery events.
    ///
    /// Preferences are re-read first. Each event is quick-scored without suspending
    /// and a failure in one event never affects the others. Refinements are queued
    /// and launched up to the in-flight limit.
    pub async fn ingest(&mut self, events: Vec<DiscoveryEvent>) -> BatchReport {
        self.refresh_context();
        let ctx = self.ctx.clone();
        let mut report = BatchReport::default();

        if !ctx.settings.enabled {
            debug!("[SCAN] disabled, ignoring {} events", events.len());
            return report;
        }

        for event in events {
            match self.discover(event, &ctx) {
                Ok(Discovery::Accepted(outcome)) => {
                    report.accepted += 1;
                    if outcome.annotated {
                        report.annotated += 1;
                    } else {
                        report.suppressed += 1;
                    }
                    if outcome.scheduled {
                        report.scheduled += 1;
                    }
                    if outcome.failed {
                        report.failed += 1;
                    }
                }
                Ok(Discovery::Duplicate) => report.duplicates += 1,
                Ok(Discovery::Filtered) => report.filtered += 1,
                Err(ScanError::Detection(DetectionError::MalformedInput(reason))) => {
                    warn!("[SCAN] dropped malformed event: {}", reason);
                    report.malformed += 1;
                }
                Err(e) => {
                    warn!("[SCAN] event failed before a unit existed: {}", e);
                    report.failed += 1;
                }
            }
        }

        self.launch_pending().await;

        info!(
            "[SCAN] batch done accepted={} annotated={} suppressed={} scheduled={} in_flight={}",
            report.accepted,
            report.annotated,
            report.suppressed,
            report.scheduled,
            self.in_flight.len()
        );
        report
    }

    fn refresh_context(&mut self) {
        match self.prefs.load() {
            Ok(config) => self.ctx = Arc::new(BatchContext::from_config(&config)),
            Err(e) => warn!("[CONFIG] failed to reload preferences, keeping previous: {}", e),
        }
    }

    fn discover(&mut self, event: DiscoveryEvent, ctx: &Arc<BatchContext>) -> Result<Discovery, ScanError> {
        let (id, payload) = validate(event)?;

        if self.units.contains_key(&id) {
            return Ok(Discovery::Duplicate);
        }
        if !ctx.settings.passes_filters(&payload) {
            debug!("[SCAN] unit={} below minimum size", id);
            return Ok(Discovery::Filtered);
        }

        let kind = payload.kind();
        let key = content_key(&payload);
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut unit = ClassificationUnit::new(id.clone(), kind, key.clone(), generation)
            .with_page_url(page_url(&payload));

        let quick = self.quick_score(&key, &payload);
        self.emit(kind, &quick, ScoreStage::Quick);
        unit.transition(UnitEvent::QuickScored(quick.clone()))?;

        let text = match &payload {
            ContentPayload::Text(t) => Some(t.text.clone()),
            ContentPayload::Image(_) => None,
        };

        let mut outcome = Accepted::default();
        match self.settle_quick(&mut unit, &quick, ctx, text.as_deref()) {
            Ok(annotated) => outcome.annotated = annotated,
            Err(e) => {
                warn!("[SCAN] unit={} suppressed after failure: {}", id, e);
                outcome.failed = true;
                if unit.state() == UnitState::QuickScored {
                    unit.transition(UnitEvent::Suppress)?;
                }
            }
        }

        let wants_refine = ctx.settings.refine
            && match unit.state() {
                UnitState::Annotated => true,
                UnitState::Suppressed => ctx.settings.refine_suppressed && !outcome.failed,
                _ => false,
            };

        if wants_refine {
            unit.transition(UnitEvent::BeginRefining)?;
            self.pending.push_back(Pending {
                job: RefinementJob {
                    id: id.clone(),
                    generation,
                    kind,
                    key,
                    payload,
                    quick,
                },
                ctx: ctx.clone(),
                text,
            });
            outcome.scheduled = true;
        }

        self.units.insert(id, unit);
        Ok(Discovery::Accepted(outcome))
    }

    /// Cache-checked synchronous score.
    fn quick_score(&mut self, key: &ContentKey, payload: &ContentPayload) -> ScoreResult {
        let cache = match payload.kind() {
            ContentKind::Text => &mut self.text_cache,
            ContentKind::Image => &mut self.image_cache,
        };
        if let Some(hit) = cache.get(key) {
            return hit;
        }
        let result = match payload {
            ContentPayload::Text(text) => self.registry.text().quick(&text.text),
            ContentPayload::Image(image) => self.registry.image().quick(image),
        };
        cache.put(key.clone(), result.clone());
        result
    }

    fn settle_quick(
        &mut self,
        unit: &mut ClassificationUnit,
        quick: &ScoreResult,
        ctx: &BatchContext,
        text: Option<&str>,
    ) -> Result<bool, ScanError> {
        if ctx.thresholds.exceeds(unit.kind, quick, unit.page_url.as_deref()) {
            let treatment = self.renderer.apply(unit, &ctx.render)?;
            unit.transition(UnitEvent::Annotate(treatment))?;
            self.history.push(unit.kind, quick, unit.page_url.as_deref(), text);
            debug!("[SCAN] unit={} annotated score={:.3}", unit.id, quick.score);
            Ok(true)
        } else {
            unit.transition(UnitEvent::Suppress)?;
            Ok(false)
        }
    }

    // ============ Refinement ============

    async fn launch_pending(&mut self) {
        let limit = self.ctx.settings.max_in_flight;
        let yield_every = self.ctx.settings.yield_every;

        while self.in_flight.len() < limit {
            let Some(Pending { job, ctx, text }) = self.pending.pop_front() else {
                break;
            };
            if !self.is_live(&job.id, job.generation) {
                debug!("[REFINE] skipped queued job for removed unit={}", job.id);
                continue;
            }

            let is_image = job.kind == ContentKind::Image;
            let owner = (job.id.clone(), job.generation);
            self.resolving.insert(owner.clone(), Resolving { ctx, text });
            let engine = self.engine.clone();
            let handle = self.in_flight.spawn(async move { engine.refine(job).await });
            self.tasks.insert(handle.id(), owner);

            if is_image {
                self.image_jobs_launched += 1;
                if self.image_jobs_launched % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Wait for the next refinement to finish and resolve it. Returns `None` once
    /// nothing is queued or in flight.
    pub async fn next_refinement(&mut self) -> Option<RefinementReport> {
        loop {
            self.launch_pending().await;
            let output = match self.in_flight.join_next_with_id().await? {
                Ok((task, output)) => {
                    self.tasks.remove(&task);
                    output
                }
                Err(e) => {
                    // A panicked job still owns a Refining unit; settle it on the quick result.
                    let Some((id, generation)) = self.tasks.remove(&e.id()) else {
                        warn!("[REFINE] untracked refinement task failed: {}", e);
                        continue;
                    };
                    RefinementOutput {
                        id,
                        generation,
                        result: Err(DetectionError::RefinementAborted(e.to_string())),
                        remote: RemoteOutcome::Skipped,
                    }
                }
            };
            let report = self.resolve(output);
            self.launch_pending().await;
            return Some(report);
        }
    }

    pub async fn drain_refinements(&mut self) -> Vec<RefinementReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.next_refinement().await {
            reports.push(report);
        }
        reports
    }

    fn resolve(&mut self, output: RefinementOutput) -> RefinementReport {
        let RefinementOutput {
            id,
            generation,
            result,
            remote,
        } = output;
        self.record_remote(remote);

        let resolving = self.resolving.remove(&(id.clone(), generation));
        let live = self
            .units
            .get(&id)
            .map_or(false, |u| u.generation == generation && u.state() == UnitState::Refining);
        let (Some(Resolving { ctx, text }), true) = (resolving, live) else {
            debug!("[REFINE] discarded result for stale unit={}", id);
            return RefinementReport { id, state: None };
        };
        let Some(mut unit) = self.units.remove(&id) else {
            return RefinementReport { id, state: None };
        };

        let (refined, verdict) = match result {
            Ok(refined) => {
                self.emit(unit.kind, &refined, ScoreStage::Refined);
                let exceeds = ctx
                    .thresholds
                    .exceeds(unit.kind, &refined, unit.page_url.as_deref());
                let verdict = judge_refinement(
                    unit.annotation(),
                    unit.quick_result(),
                    &refined,
                    exceeds,
                    &ctx.refinement,
                );
                (refined, verdict)
            }
            Err(e) => {
                if e.is_expected() {
                    debug!("[REFINE] unit={} kept quick result: {}", id, e);
                } else {
                    warn!("[REFINE] unit={} kept quick result: {}", id, e);
                }
                let quick = unit
                    .quick_result()
                    .cloned()
                    .unwrap_or_else(|| ScoreResult::unscoreable(Default::default()));
                (quick, Verdict::Confirm)
            }
        };

        if let Err(e) = self.apply_verdict(&mut unit, refined.clone(), verdict, &ctx, text.as_deref()) {
            warn!("[REFINE] unit={} verdict {:?} failed: {}", id, verdict, e);
            if unit.state() == UnitState::Refining {
                let _ = unit.transition(UnitEvent::Resolve {
                    refined,
                    outcome: RefinementOutcome::Confirmed,
                });
            }
        }

        let state = unit.state();
        debug!("[REFINE] unit={} resolved state={}", id, state);
        self.units.insert(id.clone(), unit);
        RefinementReport { id, state: Some(state) }
    }

    fn apply_verdict(
        &mut self,
        unit: &mut ClassificationUnit,
        refined: ScoreResult,
        verdict: Verdict,
        ctx: &BatchContext,
        text: Option<&str>,
    ) -> Result<(), ScanError> {
        match verdict {
            Verdict::Confirm => {
                unit.transition(UnitEvent::Resolve {
                    refined,
                    outcome: RefinementOutcome::Confirmed,
                })?;
                self.renderer.refresh_badge(unit, &ctx.render)?;
            }
            Verdict::Upgrade => {
                let treatment = self.renderer.apply(unit, &ctx.render)?;
                self.history
                    .push(unit.kind, &refined, unit.page_url.as_deref(), text);
                unit.transition(UnitEvent::Resolve {
                    refined,
                    outcome: RefinementOutcome::Upgraded(treatment),
                })?;
            }
            Verdict::Revert => {
                self.renderer.revert(unit)?;
                unit.transition(UnitEvent::Resolve {
                    refined,
                    outcome: RefinementOutcome::Reverted,
                })?;
            }
        }
        Ok(())
    }

    // ============ Liveness ============

    /// Forget a unit whose content left the page. Queued work for it is dropped and
    /// any in-flight result is discarded on arrival.
    pub fn remove(&mut self, id: &UnitId) -> bool {
        let removed = self.units.remove(id).is_some();
        if removed {
            self.pending.retain(|p| p.job.id != *id);
            debug!("[SCAN] unit={} removed", id);
        }
        removed
    }

    fn is_live(&self, id: &UnitId, generation: u64) -> bool {
        self.units
            .get(id)
            .map_or(false, |u| u.generation == generation)
    }

    // ============ Observation ============

    fn emit(&self, kind: ContentKind, result: &ScoreResult, stage: ScoreStage) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(&TelemetryEvent {
                unit_kind: kind,
                score: result.score,
                confidence: result.confidence,
                source: result.source,
                stage,
            });
        }
    }

    fn record_remote(&mut self, outcome: RemoteOutcome) {
        match outcome {
            RemoteOutcome::Skipped => {}
            RemoteOutcome::Scored { latency_ms } => self.remote_stats.record_success(latency_ms),
            RemoteOutcome::Failed => self.remote_stats.record_error(),
            RemoteOutcome::TimedOut => self.remote_stats.record_timeout(),
        }
    }

    pub fn unit(&self, id: &UnitId) -> Option<&ClassificationUnit> {
        self.units.get(id)
    }

    pub fn units(&self) -> impl Iterator<Item = &ClassificationUnit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn queued_refinements(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_refinements(&self) -> usize {
        self.in_flight.len()
    }

    pub fn cache_stats(&self, kind: ContentKind) -> CacheStats {
        match kind {
            ContentKind::Text => self.text_cache.stats(),
            ContentKind::Image => self.image_cache.stats(),
        }
    }

    pub fn remote_stats(&self) -> &RemoteStats {
        &self.remote_stats
    }

    pub fn history(&self) -> &DetectionHistory {
        &self.history
    }

    pub fn has_telemetry(&self) -> bool {
        self.telemetry.is_some()
    }

    pub fn context(&self) -> &BatchContext {
        &self.ctx
    }

    pub fn summary(&self) -> PageSummary {
        summarize_page(self.units.values())
    }

    pub fn sink(&self) -> &S {
        self.renderer.sink()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.renderer.sink_mut()
    }
}

fn validate(event: DiscoveryEvent) -> Result<(UnitId, ContentPayload), DetectionError> {
    let id = event
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| DetectionError::MalformedInput("missing id".to_string()))?;
    let payload = event
        .payload
        .ok_or_else(|| DetectionError::MalformedInput(format!("event {} has no payload", id)))?;
    if let Some(kind) = event.kind {
        if kind != payload.kind() {
            return Err(DetectionError::MalformedInput(format!(
                "event {} declares {} but carries {}",
                id,
                kind,
                payload.kind()
            )));
        }
    }
    Ok((UnitId(id), payload))
}

fn content_key(payload: &ContentPayload) -> ContentKey {
    match payload {
        ContentPayload::Text(text) => ContentKey::for_text(&text.text),
        ContentPayload::Image(image) => {
            let (w, h) = image.dimensions();
            ContentKey::for_image(&image.src, w, h)
        }
    }
}

fn page_url(payload: &ContentPayload) -> Option<String> {
    match payload {
        ContentPayload::Text(text) => text.page_url.clone(),
        ContentPayload::Image(image) => image.page_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Annotation, AnnotationMode, ImagePayload, ScoreSource};
    use crate::services::annotation::MemorySurface;
    use crate::services::config_store::MemoryPreferences;
    use crate::services::detection::classifier::TextClassifier;
    use crate::services::telemetry::BufferedTelemetry;
    use async_trait::async_trait;

    const TEXT: &str = "The system is designed to process the data in a consistent way. \
        The model is able to handle the input at a steady rate today.";

    struct Fixed(f64);

    #[async_trait]
    impl TextClassifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn quick(&self, _text: &str) -> ScoreResult {
            ScoreResult { score: self.0, confidence: 0.9, features: Default::default(), source: ScoreSource::Local }
        }
        async fn refine(&self, text: &str) -> Result<ScoreResult, DetectionError> {
            Ok(self.quick(text))
        }
    }

    fn coordinator(score: f64) -> (ScanCoordinator<MemorySurface>, Arc<MemoryPreferences>) {
        let prefs = Arc::new(MemoryPreferences::new(AppConfig::default()));
        let registry = ClassifierRegistry::builder().text(10, Arc::new(Fixed(score))).build();
        let coordinator = ScanCoordinator::new(prefs.clone(), MemorySurface::new())
            .unwrap()
            .with_registry(registry);
        (coordinator, prefs)
    }

    fn text_event(c: &mut ScanCoordinator<MemorySurface>, id: &str, text: &str) -> DiscoveryEvent {
        c.sink_mut().register(UnitId::from(id), text);
        DiscoveryEvent::text(id, text)
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let (mut c, _) = coordinator(0.9);
        let mut wrong_kind = DiscoveryEvent::text("x", TEXT);
        wrong_kind.kind = Some(ContentKind::Image);
        let events = vec![
            DiscoveryEvent::default(),
            DiscoveryEvent { id: Some("no-payload".into()), ..Default::default() },
            wrong_kind,
        ];
        let report = c.ingest(events).await;
        assert_eq!(report.malformed, 3);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_and_filters() {
        let (mut c, _) = coordinator(0.9);
        let a = text_event(&mut c, "a", TEXT);
        let report = c.ingest(vec![a.clone(), a, DiscoveryEvent::text("tiny", "too short")]).await;
        assert_eq!(report.accepted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.filtered, 1);

        let mut small = ImagePayload::new("https://cdn.example.com/icon.png");
        small.declared_width = Some(16);
        small.declared_height = Some(16);
        let report = c.ingest(vec![DiscoveryEvent::image("icon", small)]).await;
        assert_eq!(report.filtered, 1);
    }

    #[tokio::test]
    async fn test_render_failure_suppresses_only_that_unit() {
        let (mut c, _) = coordinator(0.9);
        // "ghost" is never registered on the surface, so annotation fails
        let good = text_event(&mut c, "good", TEXT);
        let ghost = DiscoveryEvent::text("ghost", TEXT);
        let report = c.ingest(vec![ghost, good]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(c.unit(&UnitId::from("ghost")).unwrap().state(), UnitState::Suppressed);
        assert_eq!(c.unit(&UnitId::from("good")).unwrap().annotation(), Annotation::Blurred);
    }

    #[tokio::test]
    async fn test_disabled_ignores_batch_and_prefs_are_reread() {
        let (mut c, prefs) = coordinator(0.9);
        prefs.update(|cfg| cfg.enabled = false);
        let e = text_event(&mut c, "a", TEXT);
        assert_eq!(c.ingest(vec![e.clone()]).await.accepted, 0);

        prefs.update(|cfg| {
            cfg.enabled = true;
            cfg.mode = AnnotationMode::Outline;
        });
        c.ingest(vec![e]).await;
        assert_eq!(c.unit(&UnitId::from("a")).unwrap().annotation(), Annotation::Outlined);
    }

    #[tokio::test]
    async fn test_cache_hit_for_repeated_content_and_telemetry() {
        let (c, _) = coordinator(0.9);
        let telemetry = Arc::new(BufferedTelemetry::new());
        let mut c = c.with_telemetry(telemetry.clone());
        let a = text_event(&mut c, "a", TEXT);
        let b = text_event(&mut c, "b", TEXT);
        c.ingest(vec![a, b]).await;
        let stats = c.cache_stats(ContentKind::Text);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        let reports = c.drain_refinements().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.state == Some(UnitState::Confirmed)));
        let events = telemetry.drain();
        assert_eq!(events.iter().filter(|e| e.stage == ScoreStage::Quick).count(), 2);
        assert_eq!(events.iter().filter(|e| e.stage == ScoreStage::Refined).count(), 2);
        assert_eq!(c.history().len(), 2);
    }

    #[tokio::test]
    async fn test_suppressed_units_refine_only_when_enabled() {
        let (mut c, prefs) = coordinator(0.05);
        let a = text_event(&mut c, "a", TEXT);
        let report = c.ingest(vec![a]).await;
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.scheduled, 0);

        prefs.update(|cfg| cfg.refinement.refine_suppressed = true);
        let b = text_event(&mut c, "b", TEXT);
        let report = c.ingest(vec![b]).await;
        assert_eq!(report.scheduled, 1);
        c.drain_refinements().await;
        assert_eq!(c.unit(&UnitId::from("b")).unwrap().state(), UnitState::Confirmed);
    }
}
