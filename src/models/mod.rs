// CloseAI Data Models
// Shared types for content units, feature vectors and score results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============ Identity ============

/// Stable identifier of one discovered content item on the host surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UnitId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache fingerprint of a content unit.
///
/// Text keys use a bounded, whitespace-collapsed prefix verbatim; image keys use the
/// resource locator plus decoded dimensions. Equal keys share cached results even when
/// the payloads differ past the sampled prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub const TEXT_PREFIX_CHARS: usize = 200;
    pub const IMAGE_SRC_CHARS: usize = 150;

    pub fn for_text(text: &str) -> Self {
        let mut prefix = String::with_capacity(Self::TEXT_PREFIX_CHARS);
        let mut taken = 0usize;
        for word in text.split_whitespace() {
            if taken >= Self::TEXT_PREFIX_CHARS {
                break;
            }
            if !prefix.is_empty() {
                prefix.push(' ');
                taken += 1;
            }
            for ch in word.chars() {
                if taken >= Self::TEXT_PREFIX_CHARS {
                    break;
                }
                prefix.push(ch);
                taken += 1;
            }
        }
        Self(format!("text:{}", prefix))
    }

    pub fn for_image(src: &str, width: u32, height: u32) -> Self {
        let src: String = src.chars().take(Self::IMAGE_SRC_CHARS).collect();
        Self(format!("image:{}@{}x{}", src, width, height))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ Features & Scores ============

/// Named feature values, each normalized to [0, 1] where 1 reads as "more AI-like".
///
/// Backed by a `BTreeMap` so iteration order (and therefore every floating point
/// reduction over it) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a feature value. Non-finite values are treated as missing and dropped.
    pub fn insert(&mut self, name: &str, value: f64) {
        if value.is_finite() {
            self.0.insert(name.to_string(), value.clamp(0.0, 1.0));
        } else {
            self.0.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn merge(&mut self, other: &FeatureVector) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }
}

impl<'a> FromIterator<(&'a str, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (&'a str, f64)>>(iter: I) -> Self {
        let mut out = FeatureVector::new();
        for (name, value) in iter {
            out.insert(name, value);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Local,
    Remote,
    Hybrid,
    /// Image decided from URL/context strings alone, without pixel analysis.
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub score: f64,
    pub confidence: f64,
    pub features: FeatureVector,
    pub source: ScoreSource,
}

impl ScoreResult {
    /// Result for input with no usable features at all.
    pub fn unscoreable(features: FeatureVector) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            features,
            source: ScoreSource::Local,
        }
    }

    /// Presentational blend of score and confidence. Never fed back into scoring.
    pub fn certainty(&self) -> f64 {
        certainty(self.score, Some(self.confidence))
    }
}

pub fn certainty(score: f64, confidence: Option<f64>) -> f64 {
    match confidence {
        Some(c) => (score * 0.7 + c * 0.3).clamp(0.0, 1.0),
        None => score.clamp(0.0, 1.0),
    }
}

// ============ Unit Lifecycle ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitState {
    Unscanned,
    QuickScored,
    Suppressed,
    Annotated,
    Refining,
    Confirmed,
    Upgraded,
    Reverted,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Suppressed | Self::Confirmed | Self::Upgraded | Self::Reverted
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unscanned => "unscanned",
            Self::QuickScored => "quickScored",
            Self::Suppressed => "suppressed",
            Self::Annotated => "annotated",
            Self::Refining => "refining",
            Self::Confirmed => "confirmed",
            Self::Upgraded => "upgraded",
            Self::Reverted => "reverted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    #[default]
    None,
    Blurred,
    Outlined,
    Removed,
}

impl Annotation {
    /// Removal cannot be undone; blur and outline can.
    pub fn is_reversible(&self) -> bool {
        matches!(self, Self::Blurred | Self::Outlined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationMode {
    #[default]
    Blur,
    Outline,
    Remove,
}

impl AnnotationMode {
    pub fn from_str(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "outline" => Self::Outline,
            "remove" | "nuke" => Self::Remove,
            _ => Self::Blur,
        }
    }

    pub fn treatment(&self) -> Annotation {
        match self {
            Self::Blur => Annotation::Blurred,
            Self::Outline => Annotation::Outlined,
            Self::Remove => Annotation::Removed,
        }
    }
}

// ============ Discovery Stream ============

/// One "content discovered" notification from the host page.
///
/// Every field is optional on the wire so malformed events can be rejected by the
/// coordinator instead of failing deserialization of the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<ContentKind>,
    #[serde(default)]
    pub payload: Option<ContentPayload>,
}

impl DiscoveryEvent {
    pub fn text(id: &str, text: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: Some(ContentKind::Text),
            payload: Some(ContentPayload::Text(TextPayload {
                text: text.to_string(),
                page_url: None,
            })),
        }
    }

    pub fn image(id: &str, payload: ImagePayload) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: Some(ContentKind::Image),
            payload: Some(ContentPayload::Image(payload)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPayload {
    Text(TextPayload),
    Image(ImagePayload),
}

impl ContentPayload {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text(_) => ContentKind::Text,
            Self::Image(_) => ContentKind::Image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    pub text: String,
    #[serde(default)]
    pub page_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub src: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub surrounding_text: Option<String>,
    #[serde(default)]
    pub declared_width: Option<u32>,
    #[serde(default)]
    pub declared_height: Option<u32>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(skip)]
    pub pixels: PixelSource,
}

impl ImagePayload {
    pub fn new(src: &str) -> Self {
        Self {
            src: src.to_string(),
            ..Default::default()
        }
    }

    /// Decoded dimensions when pixels are available, declared dimensions otherwise.
    pub fn dimensions(&self) -> (u32, u32) {
        match &self.pixels {
            PixelSource::Available(sample) => (sample.width, sample.height),
            _ => (
                self.declared_width.unwrap_or(0),
                self.declared_height.unwrap_or(0),
            ),
        }
    }

    /// Alt, title and surrounding text joined for keyword matching.
    pub fn context_text(&self) -> String {
        [&self.alt, &self.title, &self.surrounding_text]
            .iter()
            .filter_map(|s| s.as_deref())
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of the host's attempt to read pixels for an image.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PixelSource {
    Available(RasterSample),
    /// Pixel read blocked by cross-origin policy.
    Denied,
    #[default]
    NotLoaded,
}

/// Decoded RGBA raster, row-major, 4 bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSample {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl RasterSample {
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        if rgba.len() != expected {
            return None;
        }
        Some(Self { width, height, rgba })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Fields are public, so a sample built by hand may not match its dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.pixel_count().checked_mul(4) == Some(self.rgba.len())
    }

    #[inline]
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [self.rgba[idx], self.rgba[idx + 1], self.rgba[idx + 2]]
    }

    /// Mean of the RGB channels.
    #[inline]
    pub fn gray(&self, x: u32, y: u32) -> f64 {
        let [r, g, b] = self.rgb(x, y);
        (r as f64 + g as f64 + b as f64) / 3.0
    }
}

// ============ Remote Scoring ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteScoreRequest {
    pub content_hash: String,
    pub features: FeatureVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RemoteMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    pub length: usize,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteScoreResponse {
    pub score: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
}

// ============ Telemetry & Summary ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreStage {
    Quick,
    Refined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub unit_kind: ContentKind,
    pub score: f64,
    pub confidence: f64,
    pub source: ScoreSource,
    pub stage: ScoreStage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub id: String,
    pub timestamp: String,
    pub kind: ContentKind,
    pub score: f64,
    pub confidence: f64,
    pub certainty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCounts {
    pub quick_scored: usize,
    pub suppressed: usize,
    pub annotated: usize,
    pub refining: usize,
    pub confirmed: usize,
    pub upgraded: usize,
    pub reverted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub units: usize,
    pub annotated_units: usize,
    pub overall_score: f64,
    pub overall_confidence: f64,
    pub method: String,
    pub states: StateCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_key_uses_bounded_prefix() {
        let long = "word ".repeat(200);
        let key = ContentKey::for_text(&long);
        assert!(key.as_str().len() <= "text:".len() + ContentKey::TEXT_PREFIX_CHARS);

        let same_prefix = format!("{} tail that differs", long);
        assert_eq!(key, ContentKey::for_text(&same_prefix));
    }

    #[test]
    fn test_text_key_collapses_whitespace() {
        assert_eq!(
            ContentKey::for_text("a  b\n\tc"),
            ContentKey::for_text("a b c")
        );
    }

    #[test]
    fn test_feature_vector_drops_nan() {
        let mut fv = FeatureVector::new();
        fv.insert("a", f64::NAN);
        fv.insert("b", 1.7);
        assert!(!fv.contains("a"));
        assert_eq!(fv.get("b"), Some(1.0));
    }

    #[test]
    fn test_certainty_formula() {
        assert!((certainty(0.8, Some(0.5)) - 0.71).abs() < 1e-9);
        assert_eq!(certainty(0.4, None), 0.4);
    }

    #[test]
    fn test_raster_rejects_bad_buffer() {
        assert!(RasterSample::new(2, 2, vec![0; 15]).is_none());
        assert!(RasterSample::new(2, 2, vec![0; 16]).is_some());
    }

    #[test]
    fn test_discovery_event_deserializes_partial() {
        let ev: DiscoveryEvent = serde_json::from_str(r#"{"kind":"text"}"#).unwrap();
        assert!(ev.id.is_none());
        assert!(ev.payload.is_none());

        let ev: DiscoveryEvent = serde_json::from_str(
            r#"{"id":"img-1","kind":"image","payload":{"src":"https://x/y.png","alt":"a cat"}}"#,
        )
        .unwrap();
        match ev.payload {
            Some(ContentPayload::Image(p)) => assert_eq!(p.alt.as_deref(), Some("a cat")),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
