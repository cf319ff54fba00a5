use anyhow::{bail, Context, Result};
use close_ai_lib::init_logging;
use close_ai_lib::models::{
    AnnotationMode, ContentKind, ContentPayload, DiscoveryEvent, PageSummary, PixelSource, UnitId,
};
use close_ai_lib::services::coordinator::{BatchReport, RefinementReport, ScanCoordinator};
use close_ai_lib::services::detection::image_features::decode_raster;
use close_ai_lib::services::telemetry::{HistoryStatistics, RemoteStats, TracingTelemetry};
use close_ai_lib::services::{
    AppConfig, CacheStats, ConfigStore, MemoryPreferences, MemorySurface, PreferenceStore,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One discovery event as written in the input file. Images may point at a local file
/// whose pixels stand in for what the page would have decoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageEvent {
    #[serde(flatten)]
    event: DiscoveryEvent,
    #[serde(default)]
    image_path: Option<PathBuf>,
    #[serde(default)]
    cross_origin: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanInput {
    #[serde(default)]
    page_url: Option<String>,
    /// Each inner list is delivered as one discovery batch.
    batches: Vec<Vec<PageEvent>>,
    /// Units whose content leaves the page after discovery, before refinements settle.
    #[serde(default)]
    removed: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitLine {
    id: String,
    kind: ContentKind,
    state: String,
    annotation: String,
    score: Option<f64>,
    confidence: Option<f64>,
    certainty: Option<f64>,
    rendered: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScanOutput {
    batches: Vec<BatchReport>,
    refinements: Vec<RefinementReport>,
    units: Vec<UnitLine>,
    summary: PageSummary,
    text_cache: CacheStats,
    image_cache: CacheStats,
    remote: RemoteStats,
    history: HistoryStatistics,
}

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

fn load_config(args: &[String]) -> Result<AppConfig> {
    let dir = match parse_arg_value(args, "--config") {
        Some(dir) => PathBuf::from(dir),
        None => ConfigStore::default_config_dir().context("no config directory available")?,
    };
    let mut config = ConfigStore::new(dir).load()?;

    if let Some(mode) = parse_arg_value(args, "--mode") {
        config.mode = AnnotationMode::from_str(&mode);
    }
    if has_flag(args, "--no-refine") {
        config.refinement.enabled = false;
    }
    if has_flag(args, "--refine-suppressed") {
        config.refinement.refine_suppressed = true;
    }
    Ok(config)
}

fn build_coordinator(config: AppConfig) -> Result<ScanCoordinator<MemorySurface>> {
    let prefs: Arc<dyn PreferenceStore> = Arc::new(MemoryPreferences::new(config));
    Ok(ScanCoordinator::new(prefs, MemorySurface::new())?.with_telemetry(Arc::new(TracingTelemetry)))
}

/// Attach page url and decoded pixels, and register the node's markup on the surface.
fn prepare(event: PageEvent, page_url: Option<&str>, surface: &mut MemorySurface) -> DiscoveryEvent {
    let PageEvent {
        mut event,
        image_path,
        cross_origin,
    } = event;

    let markup = match event.payload.as_mut() {
        Some(ContentPayload::Text(text)) => {
            if text.page_url.is_none() {
                text.page_url = page_url.map(str::to_string);
            }
            text.text.clone()
        }
        Some(ContentPayload::Image(image)) => {
            if image.page_url.is_none() {
                image.page_url = page_url.map(str::to_string);
            }
            image.pixels = if cross_origin {
                PixelSource::Denied
            } else if let Some(path) = &image_path {
                match std::fs::read(path).map_err(anyhow::Error::from).and_then(|b| Ok(decode_raster(&b)?)) {
                    Ok(sample) => PixelSource::Available(sample),
                    Err(e) => {
                        tracing::warn!("[CLI] could not decode {}: {}", path.display(), e);
                        PixelSource::NotLoaded
                    }
                }
            } else {
                PixelSource::NotLoaded
            };
            format!("<img src=\"{}\">", image.src)
        }
        None => String::new(),
    };

    if let Some(id) = &event.id {
        surface.register(UnitId::from(id.as_str()), &markup);
    }
    event
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage:\n  scan_page <events.json> [--mode blur|outline|remove] [--config <dir>] [--no-refine] [--refine-suppressed] [--out <json_path>] [--history <csv_path>]\n\nNotes:\n  - events.json holds {{\"pageUrl\", \"batches\": [[event, ...], ...], \"removed\": [id, ...]}}.\n  - Image events may carry \"imagePath\" (local file to decode) or \"crossOrigin\": true."
        );
        return Ok(());
    }

    init_logging();

    let path = PathBuf::from(&args[1]);
    let out_path = parse_arg_value(&args, "--out");
    let history_path = parse_arg_value(&args, "--history");
    let config = load_config(&args)?;

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read events failed: {}", path.display()))?;
    let input: ScanInput = serde_json::from_str(&raw).context("parse events failed")?;
    if input.batches.is_empty() {
        bail!("no discovery batches in {}", path.display());
    }

    let mut coordinator = build_coordinator(config)?;

    let mut batches = Vec::new();
    for batch in input.batches {
        let events: Vec<DiscoveryEvent> = batch
            .into_iter()
            .map(|e| prepare(e, input.page_url.as_deref(), coordinator.sink_mut()))
            .collect();
        batches.push(coordinator.ingest(events).await);
    }

    for id in &input.removed {
        if !coordinator.remove(&UnitId::from(id.as_str())) {
            tracing::warn!("[CLI] removed id {} was never discovered", id);
        }
    }

    let refinements = coordinator.drain_refinements().await;

    let mut units: Vec<UnitLine> = coordinator
        .units()
        .map(|unit| {
            let best = unit.best_result();
            UnitLine {
                id: unit.id.to_string(),
                kind: unit.kind,
                state: unit.state().to_string(),
                annotation: format!("{:?}", unit.annotation()).to_lowercase(),
                score: best.map(|r| r.score),
                confidence: best.map(|r| r.confidence),
                certainty: best.map(|r| r.certainty()),
                rendered: coordinator.sink().content(&unit.id).map(|c| preview(c, 120)),
            }
        })
        .collect();
    units.sort_by(|a, b| a.id.cmp(&b.id));

    let output = ScanOutput {
        batches,
        refinements,
        units,
        summary: coordinator.summary(),
        text_cache: coordinator.cache_stats(ContentKind::Text),
        image_cache: coordinator.cache_stats(ContentKind::Image),
        remote: coordinator.remote_stats().clone(),
        history: coordinator.history().statistics(),
    };

    println!("Input: {}", path.display());
    for unit in &output.units {
        println!(
            "  {:<12} {:<6} {:<12} {:<9} score={}",
            unit.id,
            unit.kind.as_str(),
            unit.state,
            unit.annotation,
            unit.score.map(|s| format!("{:.3}", s)).unwrap_or_else(|| "-".to_string())
        );
    }
    println!(
        "Page: units={} annotated={} overall={:.3} ({})",
        output.summary.units,
        output.summary.annotated_units,
        output.summary.overall_score,
        output.summary.method
    );

    if let Some(out) = out_path {
        let json = serde_json::to_string_pretty(&output)?;
        std::fs::write(&out, json).with_context(|| format!("write output failed: {}", out))?;
        println!("Wrote {}", out);
    }

    if let Some(history) = history_path {
        std::fs::write(&history, coordinator.history().to_csv())
            .with_context(|| format!("write history failed: {}", history))?;
        println!("Wrote {} ({} detections)", history, output.history.total);
    }

    Ok(())
}
