// Aggregation Logic
// Rolls unit results up into a page-level summary

use crate::models::{Annotation, PageSummary};
use crate::services::unit::{count_states, ClassificationUnit};

/// Units below this confidence still count, but no less than this.
const MIN_WEIGHT: f64 = 0.3;
const TRIM_FRACTION: f64 = 0.1;
const TRIM_MIN_UNITS: usize = 5;

/// Summarize the units currently tracked on a page.
/// Uses confidence-weighted aggregation with robust statistics
pub fn summarize_page<'a, I>(units: I) -> PageSummary
where
    I: IntoIterator<Item = &'a ClassificationUnit>,
    I::IntoIter: Clone,
{
    let units = units.into_iter();
    let states = count_states(units.clone());

    let scored: Vec<(f64, f64)> = units
        .clone()
        .filter_map(|u| u.best_result())
        .filter(|r| r.confidence > 0.0)
        .map(|r| (r.score, r.confidence))
        .collect();
    let annotated_units = units
        .filter(|u| u.annotation() != Annotation::None)
        .count();
    let unit_count = states.quick_scored
        + states.suppressed
        + states.annotated
        + states.refining
        + states.confirmed
        + states.upgraded
        + states.reverted;

    if scored.is_empty() {
        return PageSummary {
            units: unit_count,
            annotated_units,
            overall_score: 0.0,
            overall_confidence: 0.0,
            method: "empty".to_string(),
            states,
        };
    }

    let weights: Vec<f64> = scored.iter().map(|(_, c)| c.max(MIN_WEIGHT)).collect();
    let total: f64 = weights.iter().sum();

    let weighted_score = scored
        .iter()
        .zip(&weights)
        .map(|((s, _), w)| s * w)
        .sum::<f64>()
        / total;

    // Trimmed mean (drop top/bottom 10%) for robustness against single outliers
    let (trimmed_score, method) = if scored.len() >= TRIM_MIN_UNITS {
        let mut scores: Vec<f64> = scored.iter().map(|(s, _)| *s).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        let trim = (scores.len() as f64 * TRIM_FRACTION).ceil() as usize;
        let kept = &scores[trim..scores.len() - trim];
        if kept.is_empty() {
            (weighted_score, "weighted")
        } else {
            (kept.iter().sum::<f64>() / kept.len() as f64, "weighted+trimmed")
        }
    } else {
        (weighted_score, "weighted")
    };

    // Blend weighted and trimmed (70% weighted, 30% trimmed for stability)
    let overall = 0.7 * weighted_score + 0.3 * trimmed_score;

    let confidence = scored
        .iter()
        .zip(&weights)
        .map(|((_, c), w)| c * w)
        .sum::<f64>()
        / total;

    PageSummary {
        units: unit_count,
        annotated_units,
        overall_score: overall.clamp(0.0, 1.0),
        overall_confidence: confidence.clamp(0.0, 1.0),
        method: method.to_string(),
        states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ContentKey, ContentKind, FeatureVector, ScoreResult, ScoreSource, UnitId,
    };
    use crate::services::unit::UnitEvent;

    fn unit(n: usize, score: f64, confidence: f64, annotate: bool) -> ClassificationUnit {
        let mut u = ClassificationUnit::new(
            UnitId::from(format!("u{}", n)),
            ContentKind::Text,
            ContentKey::for_text(&format!("text of unit {}", n)),
            1,
        );
        u.transition(UnitEvent::QuickScored(ScoreResult {
            score,
            confidence,
            features: FeatureVector::new(),
            source: ScoreSource::Local,
        }))
        .unwrap();
        if annotate {
            u.transition(UnitEvent::Annotate(Annotation::Blurred)).unwrap();
        } else {
            u.transition(UnitEvent::Suppress).unwrap();
        }
        u
    }

    #[test]
    fn test_empty_page() {
        let units: Vec<ClassificationUnit> = Vec::new();
        let summary = summarize_page(&units);
        assert_eq!(summary.units, 0);
        assert_eq!(summary.overall_score, 0.0);
        assert_eq!(summary.method, "empty");
    }

    #[test]
    fn test_small_page_is_weighted_mean() {
        let units = vec![unit(0, 0.8, 1.0, true), unit(1, 0.2, 1.0, false)];
        let summary = summarize_page(&units);
        assert!((summary.overall_score - 0.5).abs() < 1e-12);
        assert_eq!(summary.annotated_units, 1);
        assert_eq!(summary.states.annotated, 1);
        assert_eq!(summary.states.suppressed, 1);
        assert_eq!(summary.method, "weighted");
    }

    #[test]
    fn test_trimmed_mean_dampens_outlier() {
        let mut units: Vec<ClassificationUnit> =
            (0..9).map(|n| unit(n, 0.2, 0.8, false)).collect();
        units.push(unit(9, 1.0, 0.8, true));
        let summary = summarize_page(&units);
        let plain_mean = (0.2 * 9.0 + 1.0) / 10.0;
        assert_eq!(summary.method, "weighted+trimmed");
        assert!(summary.overall_score < plain_mean);
        assert_eq!(summary.units, 10);
    }

    #[test]
    fn test_unscoreable_units_are_counted_not_averaged() {
        let units = vec![unit(0, 0.0, 0.0, false), unit(1, 0.6, 0.9, true)];
        let summary = summarize_page(&units);
        assert_eq!(summary.units, 2);
        assert!((summary.overall_score - 0.6).abs() < 1e-12);
    }
}
