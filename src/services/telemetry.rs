// Telemetry & History
// Observational outputs only. Nothing here is read back into scoring.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::models::{ContentKind, DetectionRecord, ScoreResult, TelemetryEvent};
use crate::services::detection::sensitivity::host_of;

pub const HISTORY_CAPACITY: usize = 1000;
pub const PREVIEW_CHARS: usize = 200;

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// Emits every event as a debug log line.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        tracing::debug!(
            kind = %event.unit_kind,
            score = event.score,
            confidence = event.confidence,
            source = ?event.source,
            stage = ?event.stage,
            "[TELEMETRY] score event"
        );
    }
}

/// Buffers events in memory for a host to drain.
#[derive(Debug, Default)]
pub struct BufferedTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl BufferedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<TelemetryEvent> {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *guard)
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for BufferedTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(event.clone());
    }
}

/// Newest-first log of annotated units for the current session.
#[derive(Debug)]
pub struct DetectionHistory {
    capacity: usize,
    records: VecDeque<DetectionRecord>,
}

impl Default for DetectionHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    /// Text keeps a short preview; images keep no content at all.
    pub fn push(
        &mut self,
        kind: ContentKind,
        result: &ScoreResult,
        page_url: Option<&str>,
        text: Option<&str>,
    ) -> &DetectionRecord {
        let preview = match kind {
            ContentKind::Text => text.map(|t| {
                let collapsed = t.split_whitespace().collect::<Vec<_>>().join(" ");
                collapsed.chars().take(PREVIEW_CHARS).collect::<String>()
            }),
            ContentKind::Image => None,
        };
        let record = DetectionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
            score: result.score,
            confidence: result.confidence,
            certainty: result.certainty(),
            domain: page_url.and_then(host_of),
            preview,
        };
        self.records.push_front(record);
        self.records.truncate(self.capacity);
        &self.records[0]
    }

    pub fn records(&self) -> impl Iterator<Item = &DetectionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("timestamp,kind,score,confidence,certainty,domain,preview\n");
        for record in &self.records {
            out.push_str(&format!(
                "{},{},{:.4},{:.4},{:.4},{},{}\n",
                record.timestamp,
                record.kind.as_str(),
                record.score,
                record.confidence,
                record.certainty,
                csv_field(record.domain.as_deref().unwrap_or("")),
                csv_field(record.preview.as_deref().unwrap_or("")),
            ));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let records: Vec<&DetectionRecord> = self.records.iter().collect();
        serde_json::to_string_pretty(&records)
    }

    pub fn statistics(&self) -> HistoryStatistics {
        let mut stats = HistoryStatistics {
            total: self.records.len(),
            ..Default::default()
        };
        if stats.total == 0 {
            return stats;
        }

        let mut score_sum = 0.0;
        let mut certainty_sum = 0.0;
        for record in &self.records {
            match record.kind {
                ContentKind::Text => stats.text += 1,
                ContentKind::Image => stats.images += 1,
            }
            score_sum += record.score;
            certainty_sum += record.certainty;

            let domain = record.domain.clone().unwrap_or_else(|| "unknown".to_string());
            *stats.domains.entry(domain).or_insert(0) += 1;
            let date = record.timestamp.split('T').next().unwrap_or("unknown").to_string();
            *stats.by_date.entry(date).or_insert(0) += 1;
        }
        stats.avg_score = score_sum / stats.total as f64;
        stats.avg_certainty = certainty_sum / stats.total as f64;
        stats
    }
}

/// Aggregate view over the session history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatistics {
    pub total: usize,
    pub text: usize,
    pub images: usize,
    pub avg_score: f64,
    pub avg_certainty: f64,
    pub domains: BTreeMap<String, usize>,
    /// Keyed by UTC calendar date (`YYYY-MM-DD`).
    pub by_date: BTreeMap<String, usize>,
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStats {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}

impl RemoteStats {
    pub fn record_success(&mut self, latency_ms: u64) {
        let successes = self.requests - self.errors - self.timeouts;
        self.avg_latency_ms =
            (self.avg_latency_ms * successes as f64 + latency_ms as f64) / (successes + 1) as f64;
        self.requests += 1;
    }

    pub fn record_error(&mut self) {
        self.requests += 1;
        self.errors += 1;
    }

    pub fn record_timeout(&mut self) {
        self.requests += 1;
        self.timeouts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, ScoreSource, ScoreStage};

    fn result(score: f64) -> ScoreResult {
        ScoreResult {
            score,
            confidence: 0.8,
            features: FeatureVector::new(),
            source: ScoreSource::Local,
        }
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let mut history = DetectionHistory::new(3);
        for n in 0..5 {
            history.push(ContentKind::Text, &result(n as f64 / 10.0), None, Some("text"));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.records().next().map(|r| r.score), Some(0.4));
    }

    #[test]
    fn test_history_privacy() {
        let mut history = DetectionHistory::default();
        let long = "word ".repeat(100);
        let text = history
            .push(ContentKind::Text, &result(0.5), Some("https://news.example.com/a"), Some(&long))
            .clone();
        assert_eq!(text.preview.as_ref().map(|p| p.chars().count()), Some(PREVIEW_CHARS));
        assert_eq!(text.domain.as_deref(), Some("news.example.com"));

        let image = history.push(ContentKind::Image, &result(0.9), None, Some("ignored"));
        assert!(image.preview.is_none());
        assert!((image.certainty - (0.9 * 0.7 + 0.8 * 0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_history_csv_escapes_previews() {
        let mut history = DetectionHistory::default();
        history.push(ContentKind::Image, &result(0.9), None, None);
        history.push(
            ContentKind::Text,
            &result(0.5),
            Some("https://blog.example.com/p"),
            Some("He said \"done, finally\""),
        );

        let csv = history.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,kind,score,confidence,certainty,domain,preview");
        assert!(lines[1].contains(",text,0.5000,0.8000,"));
        assert!(lines[1].ends_with(",blog.example.com,\"He said \"\"done, finally\"\"\""));
        assert!(lines[2].contains(",image,0.9000,"));
        assert!(lines[2].ends_with(",,"));

        assert_eq!(DetectionHistory::default().to_csv().lines().count(), 1);
    }

    #[test]
    fn test_history_json_keeps_records() {
        let mut history = DetectionHistory::default();
        history.push(ContentKind::Text, &result(0.5), None, Some("text"));
        let parsed: Vec<DetectionRecord> = serde_json::from_str(&history.to_json().unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].preview.as_deref(), Some("text"));
    }

    #[test]
    fn test_history_statistics() {
        let mut history = DetectionHistory::default();
        assert_eq!(history.statistics(), HistoryStatistics::default());

        history.push(ContentKind::Text, &result(0.4), Some("https://a.example.com/1"), Some("x"));
        history.push(ContentKind::Text, &result(0.6), Some("https://a.example.com/2"), Some("y"));
        history.push(ContentKind::Image, &result(0.8), None, None);

        let stats = history.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.text, 2);
        assert_eq!(stats.images, 1);
        assert!((stats.avg_score - 0.6).abs() < 1e-12);
        assert_eq!(stats.domains.get("a.example.com"), Some(&2));
        assert_eq!(stats.domains.get("unknown"), Some(&1));
        assert_eq!(stats.by_date.values().sum::<usize>(), 3);
    }

    #[test]
    fn test_buffered_telemetry() {
        let sink = BufferedTelemetry::new();
        sink.record(&TelemetryEvent {
            unit_kind: ContentKind::Image,
            score: 0.7,
            confidence: 0.9,
            source: ScoreSource::Metadata,
            stage: ScoreStage::Quick,
        });
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_remote_stats_latency_average() {
        let mut stats = RemoteStats::default();
        stats.record_success(100);
        stats.record_error();
        stats.record_success(300);
        stats.record_timeout();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.timeouts, 1);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-9);
    }
}
