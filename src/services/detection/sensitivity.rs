// Sensitivity & Thresholds
// Sensitivity shifts the per-kind annotation threshold; it never touches raw scores.
// The allowlist boost is the only score adjustment and is bounded.

use crate::models::{ContentKind, ScoreResult, ScoreSource};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Items below this are never boosted, so noise cannot be lifted into a positive.
pub const BOOST_FLOOR: f64 = 0.15;
/// Upper bound for the allowlist multiplier.
pub const MAX_BOOST: f64 = 1.10;
/// Metadata-only image results need at least this confidence to annotate.
pub const METADATA_MIN_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl DetectionSensitivity {
    pub fn from_str(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }

    /// Added to the configured threshold. Higher sensitivity annotates more.
    fn threshold_shift(&self) -> f64 {
        match self {
            Self::Low => 0.10,
            Self::Medium => 0.0,
            Self::High => -0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindThresholds {
    #[serde(default = "default_text_threshold")]
    pub text: f64,
    #[serde(default = "default_image_threshold")]
    pub image: f64,
}

fn default_text_threshold() -> f64 { 0.25 }
fn default_image_threshold() -> f64 { 0.60 }

impl Default for KindThresholds {
    fn default() -> Self {
        Self {
            text: default_text_threshold(),
            image: default_image_threshold(),
        }
    }
}

/// Decision thresholds resolved for one discovery batch.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub thresholds: KindThresholds,
    pub sensitivity: DetectionSensitivity,
    pub allowlist: Vec<String>,
    pub boost_factor: f64,
}

impl ThresholdPolicy {
    pub fn new(thresholds: KindThresholds, sensitivity: DetectionSensitivity, allowlist: Vec<String>) -> Self {
        Self {
            thresholds,
            sensitivity,
            allowlist: allowlist
                .into_iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            boost_factor: MAX_BOOST,
        }
    }

    /// Active threshold for a content kind
    pub fn threshold(&self, kind: ContentKind) -> f64 {
        let base = match kind {
            ContentKind::Text => self.thresholds.text,
            ContentKind::Image => self.thresholds.image,
        };
        (base + self.sensitivity.threshold_shift()).clamp(0.05, 0.95)
    }

    /// Score after the allowlist boost for the page the unit lives on.
    pub fn effective_score(&self, score: f64, page_url: Option<&str>) -> f64 {
        match page_url {
            Some(url) if self.is_allowlisted(url) => {
                allowlist_boost(score, self.boost_factor)
            }
            _ => score.clamp(0.0, 1.0),
        }
    }

    /// Whether a result should be annotated.
    pub fn exceeds(&self, kind: ContentKind, result: &ScoreResult, page_url: Option<&str>) -> bool {
        if result.source == ScoreSource::Metadata && result.confidence < METADATA_MIN_CONFIDENCE {
            return false;
        }
        self.effective_score(result.score, page_url) >= self.threshold(kind)
    }

    pub fn is_allowlisted(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        self.allowlist
            .iter()
            .any(|entry| host == *entry || host.ends_with(&format!(".{}", entry)))
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(KindThresholds::default(), DetectionSensitivity::Medium, Vec::new())
    }
}

/// Bounded multiplicative boost. Only lifts scores already at or above [`BOOST_FLOOR`].
pub fn allowlist_boost(score: f64, factor: f64) -> f64 {
    let score = score.clamp(0.0, 1.0);
    if score < BOOST_FLOOR {
        return score;
    }
    (score * factor.clamp(1.0, MAX_BOOST)).clamp(0.0, 1.0)
}

/// Lowercased host of a URL, without port or credentials. Bare `host/path` strings
/// are read as https.
pub fn host_of(url: &str) -> Option<String> {
    let url = url.trim();
    let parsed = Url::parse(url)
        .ok()
        .filter(Url::has_host)
        .or_else(|| {
            if url.contains("://") {
                None
            } else {
                Url::parse(&format!("https://{}", url)).ok()
            }
        })?;
    let host = parsed.host_str()?.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureVector;

    fn result(score: f64, confidence: f64, source: ScoreSource) -> ScoreResult {
        ScoreResult { score, confidence, features: FeatureVector::new(), source }
    }

    #[test]
    fn test_thresholds_order() {
        let t = KindThresholds::default();
        let low = ThresholdPolicy::new(t, DetectionSensitivity::from_str("low"), vec![]);
        let mid = ThresholdPolicy::new(t, DetectionSensitivity::from_str("medium"), vec![]);
        let high = ThresholdPolicy::new(t, DetectionSensitivity::from_str("HIGH"), vec![]);
        assert!(low.threshold(ContentKind::Text) > mid.threshold(ContentKind::Text));
        assert!(mid.threshold(ContentKind::Text) > high.threshold(ContentKind::Text));
        assert_eq!(mid.threshold(ContentKind::Text), 0.25);
        assert_eq!(mid.threshold(ContentKind::Image), 0.60);
    }

    #[test]
    fn test_boost_is_capped_and_floored() {
        assert_eq!(allowlist_boost(0.10, MAX_BOOST), 0.10);
        assert!((allowlist_boost(0.50, 5.0) - 0.55).abs() < 1e-12);
        assert_eq!(allowlist_boost(0.95, MAX_BOOST), 1.0);
        assert_eq!(allowlist_boost(0.40, 0.5), 0.40);
    }

    #[test]
    fn test_allowlisted_page_lifts_borderline_score() {
        let policy = ThresholdPolicy::new(
            KindThresholds::default(),
            DetectionSensitivity::Medium,
            vec!["Midjourney.com".to_string()],
        );
        let r = result(0.24, 0.8, ScoreSource::Local);
        assert!(!policy.exceeds(ContentKind::Text, &r, Some("https://blog.example.com/post")));
        assert!(policy.exceeds(ContentKind::Text, &r, Some("https://www.midjourney.com/showcase")));
    }

    #[test]
    fn test_metadata_results_need_confidence() {
        let policy = ThresholdPolicy::default();
        assert!(!policy.exceeds(ContentKind::Image, &result(0.9, 0.7, ScoreSource::Metadata), None));
        assert!(policy.exceeds(ContentKind::Image, &result(0.9, 0.8, ScoreSource::Metadata), None));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://user@Example.com:8080/a?b").as_deref(), Some("example.com"));
        assert_eq!(host_of("example.org/path").as_deref(), Some("example.org"));
        assert_eq!(host_of("HTTPS://WWW.Example.COM").as_deref(), Some("www.example.com"));
        assert_eq!(host_of("http://[::1]:3000/x").as_deref(), Some("::1"));
        assert_eq!(host_of("https://user:p@ss@news.example.net/a").as_deref(), Some("news.example.net"));
        assert_eq!(host_of("https://evil.com\\@good.example.com/"), Some("evil.com".to_string()));
        assert_eq!(host_of("example.com:8080/path").as_deref(), Some("example.com"));
        assert_eq!(host_of("file:///tmp/page.html"), None);
        assert_eq!(host_of(""), None);
    }

    #[test]
    fn test_allowlist_ignores_lookalike_hosts() {
        let policy = ThresholdPolicy::new(
            KindThresholds::default(),
            DetectionSensitivity::Medium,
            vec!["example.com".to_string()],
        );
        assert!(policy.is_allowlisted("https://USER@Blog.Example.com:8443/post"));
        assert!(!policy.is_allowlisted("https://example.com.attacker.net/"));
        assert!(!policy.is_allowlisted("https://notexample.com/"));
    }
}
