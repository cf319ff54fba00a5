// CloseAI Core Services

pub mod text_processor;
pub mod config_store;
pub mod detection;
pub mod result_cache;
pub mod unit;
pub mod annotation;
pub mod remote_scorer;
pub mod telemetry;
pub mod coordinator;

pub use text_processor::*;
pub use config_store::*;
pub use result_cache::{CacheStats, EvictionPolicy, ResultCache};
pub use unit::{ClassificationUnit, RefinementOutcome, RefinementPolicy, UnitEvent};
pub use annotation::{AnnotationRenderer, AnnotationSink, MemorySurface, RenderConfig, RenderError};
pub use remote_scorer::{HttpRemoteScorer, RemoteScorer, RemoteScorerError};
pub use telemetry::{BufferedTelemetry, DetectionHistory, TelemetrySink, TracingTelemetry};
pub use coordinator::{BatchContext, BatchReport, RefinementReport, ScanCoordinator, ScanError};

// Re-export detection entry points
pub use detection::{
    summarize_page,
    ClassifierRegistry,
    DetectionError,
    DetectionSensitivity,
    ImageClassifier,
    TextClassifier,
    ThresholdPolicy,
};
