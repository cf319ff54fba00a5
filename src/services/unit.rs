// Classification Unit
// Per-content-item lifecycle. Every state change goes through `transition`, which
// rejects events that are not valid from the current state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    Annotation, ContentKey, ContentKind, ScoreResult, StateCounts, UnitId, UnitState,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("invalid transition from {from} on {event}")]
    Invalid { from: UnitState, event: &'static str },
}

#[derive(Debug, Clone)]
pub enum UnitEvent {
    QuickScored(ScoreResult),
    Suppress,
    Annotate(Annotation),
    BeginRefining,
    Resolve {
        refined: ScoreResult,
        outcome: RefinementOutcome,
    },
}

impl UnitEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::QuickScored(_) => "quickScored",
            Self::Suppress => "suppress",
            Self::Annotate(_) => "annotate",
            Self::BeginRefining => "beginRefining",
            Self::Resolve { .. } => "resolve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefinementOutcome {
    Confirmed,
    /// Carries the treatment that was applied when the unit was upgraded.
    Upgraded(Annotation),
    Reverted,
}

/// Knobs for judging a refined result against the quick one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementPolicy {
    /// Refined and quick scores closer than this agree.
    pub tolerance: f64,
    /// Refined results below this confidence carry no new information.
    pub min_confidence: f64,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.15,
            min_confidence: 0.55,
        }
    }
}

/// What a refined result means for a unit.
///
/// `refined_exceeds` is the threshold decision for the refined result, already
/// including sensitivity and any allowlist boost. Removal is never reverted.
pub fn judge_refinement(
    annotation: Annotation,
    quick: Option<&ScoreResult>,
    refined: &ScoreResult,
    refined_exceeds: bool,
    policy: &RefinementPolicy,
) -> Verdict {
    if refined.confidence < policy.min_confidence {
        return Verdict::Confirm;
    }

    if annotation == Annotation::None {
        return if refined_exceeds {
            Verdict::Upgrade
        } else {
            Verdict::Confirm
        };
    }

    let agrees = quick
        .map(|q| (q.score - refined.score).abs() <= policy.tolerance)
        .unwrap_or(false);

    if refined_exceeds || agrees || !annotation.is_reversible() {
        Verdict::Confirm
    } else {
        Verdict::Revert
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Confirm,
    Upgrade,
    Revert,
}

#[derive(Debug, Clone)]
pub struct ClassificationUnit {
    pub id: UnitId,
    pub kind: ContentKind,
    pub key: ContentKey,
    /// Distinguishes a rediscovered node from the unit that was tracked before it.
    pub generation: u64,
    pub page_url: Option<String>,
    state: UnitState,
    quick_result: Option<ScoreResult>,
    refined_result: Option<ScoreResult>,
    annotation: Annotation,
}

impl ClassificationUnit {
    pub fn new(id: UnitId, kind: ContentKind, key: ContentKey, generation: u64) -> Self {
        Self {
            id,
            kind,
            key,
            generation,
            page_url: None,
            state: UnitState::Unscanned,
            quick_result: None,
            refined_result: None,
            annotation: Annotation::None,
        }
    }

    pub fn with_page_url(mut self, page_url: Option<String>) -> Self {
        self.page_url = page_url;
        self
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn annotation(&self) -> Annotation {
        self.annotation
    }

    pub fn quick_result(&self) -> Option<&ScoreResult> {
        self.quick_result.as_ref()
    }

    pub fn refined_result(&self) -> Option<&ScoreResult> {
        self.refined_result.as_ref()
    }

    /// Refined result when present, quick result otherwise.
    pub fn best_result(&self) -> Option<&ScoreResult> {
        self.refined_result.as_ref().or(self.quick_result.as_ref())
    }

    pub fn transition(&mut self, event: UnitEvent) -> Result<UnitState, TransitionError> {
        let from = self.state;
        let invalid = TransitionError::Invalid {
            from,
            event: event.name(),
        };

        match (from, event) {
            (UnitState::Unscanned, UnitEvent::QuickScored(result)) => {
                self.quick_result = Some(result);
                self.state = UnitState::QuickScored;
            }
            (UnitState::QuickScored, UnitEvent::Suppress) => {
                self.state = UnitState::Suppressed;
            }
            (UnitState::QuickScored, UnitEvent::Annotate(treatment))
                if treatment != Annotation::None =>
            {
                self.annotation = treatment;
                self.state = UnitState::Annotated;
            }
            // Suppressed units only refine when catching false negatives is enabled.
            (UnitState::Annotated | UnitState::Suppressed, UnitEvent::BeginRefining) => {
                self.state = UnitState::Refining;
            }
            (UnitState::Refining, UnitEvent::Resolve { refined, outcome }) => {
                match outcome {
                    RefinementOutcome::Confirmed => {
                        self.state = UnitState::Confirmed;
                    }
                    RefinementOutcome::Upgraded(treatment)
                        if self.annotation == Annotation::None && treatment != Annotation::None =>
                    {
                        self.annotation = treatment;
                        self.state = UnitState::Upgraded;
                    }
                    RefinementOutcome::Reverted if self.annotation.is_reversible() => {
                        self.annotation = Annotation::None;
                        self.state = UnitState::Reverted;
                    }
                    _ => return Err(invalid),
                }
                self.refined_result = Some(refined);
            }
            _ => return Err(invalid),
        }

        Ok(self.state)
    }
}

/// Count units per lifecycle state.
pub fn count_states<'a>(units: impl IntoIterator<Item = &'a ClassificationUnit>) -> StateCounts {
    let mut counts = StateCounts::default();
    for unit in units {
        match unit.state() {
            UnitState::Unscanned => {}
            UnitState::QuickScored => counts.quick_scored += 1,
            UnitState::Suppressed => counts.suppressed += 1,
            UnitState::Annotated => counts.annotated += 1,
            UnitState::Refining => counts.refining += 1,
            UnitState::Confirmed => counts.confirmed += 1,
            UnitState::Upgraded => counts.upgraded += 1,
            UnitState::Reverted => counts.reverted += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, ScoreSource};

    fn result(score: f64, confidence: f64) -> ScoreResult {
        ScoreResult {
            score,
            confidence,
            features: FeatureVector::new(),
            source: ScoreSource::Local,
        }
    }

    fn unit() -> ClassificationUnit {
        ClassificationUnit::new(
            UnitId::from("p-1"),
            ContentKind::Text,
            ContentKey::for_text("some paragraph text for the unit"),
            1,
        )
    }

    fn annotated(treatment: Annotation) -> ClassificationUnit {
        let mut u = unit();
        u.transition(UnitEvent::QuickScored(result(0.6, 0.8))).unwrap();
        u.transition(UnitEvent::Annotate(treatment)).unwrap();
        u.transition(UnitEvent::BeginRefining).unwrap();
        u
    }

    #[test]
    fn test_happy_path_to_confirmed() {
        let mut u = annotated(Annotation::Blurred);
        let state = u
            .transition(UnitEvent::Resolve {
                refined: result(0.62, 0.9),
                outcome: RefinementOutcome::Confirmed,
            })
            .unwrap();
        assert_eq!(state, UnitState::Confirmed);
        assert_eq!(u.annotation(), Annotation::Blurred);
        assert_eq!(u.best_result().map(|r| r.score), Some(0.62));
    }

    #[test]
    fn test_revert_clears_reversible_annotation() {
        let mut u = annotated(Annotation::Outlined);
        u.transition(UnitEvent::Resolve {
            refined: result(0.1, 0.9),
            outcome: RefinementOutcome::Reverted,
        })
        .unwrap();
        assert_eq!(u.state(), UnitState::Reverted);
        assert_eq!(u.annotation(), Annotation::None);
    }

    #[test]
    fn test_removed_unit_cannot_revert() {
        let mut u = annotated(Annotation::Removed);
        let err = u
            .transition(UnitEvent::Resolve {
                refined: result(0.0, 1.0),
                outcome: RefinementOutcome::Reverted,
            })
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid { from: UnitState::Refining, event: "resolve" }
        );
        assert_eq!(u.annotation(), Annotation::Removed);
    }

    #[test]
    fn test_terminal_states_reject_events() {
        let mut u = unit();
        u.transition(UnitEvent::QuickScored(result(0.05, 0.5))).unwrap();
        u.transition(UnitEvent::Suppress).unwrap();
        assert!(u.state().is_terminal());
        assert!(u.transition(UnitEvent::Annotate(Annotation::Blurred)).is_err());
        assert!(u.transition(UnitEvent::QuickScored(result(0.9, 0.9))).is_err());
    }

    #[test]
    fn test_upgrade_from_suppressed() {
        let mut u = unit();
        u.transition(UnitEvent::QuickScored(result(0.1, 0.6))).unwrap();
        u.transition(UnitEvent::Suppress).unwrap();
        u.transition(UnitEvent::BeginRefining).unwrap();
        u.transition(UnitEvent::Resolve {
            refined: result(0.7, 0.9),
            outcome: RefinementOutcome::Upgraded(Annotation::Blurred),
        })
        .unwrap();
        assert_eq!(u.state(), UnitState::Upgraded);
        assert_eq!(u.annotation(), Annotation::Blurred);
    }

    #[test]
    fn test_judge_refinement() {
        let policy = RefinementPolicy::default();
        let quick = result(0.6, 0.8);

        // low confidence means no new information
        assert_eq!(
            judge_refinement(Annotation::Blurred, Some(&quick), &result(0.0, 0.3), false, &policy),
            Verdict::Confirm
        );
        // small drop within tolerance
        assert_eq!(
            judge_refinement(Annotation::Blurred, Some(&quick), &result(0.5, 0.9), false, &policy),
            Verdict::Confirm
        );
        assert_eq!(
            judge_refinement(Annotation::Blurred, Some(&quick), &result(0.1, 0.9), false, &policy),
            Verdict::Revert
        );
        assert_eq!(
            judge_refinement(Annotation::Removed, Some(&quick), &result(0.1, 0.9), false, &policy),
            Verdict::Confirm
        );
        assert_eq!(
            judge_refinement(Annotation::None, Some(&result(0.1, 0.6)), &result(0.7, 0.9), true, &policy),
            Verdict::Upgrade
        );
    }

    #[test]
    fn test_count_states() {
        let a = annotated(Annotation::Blurred);
        let mut b = unit();
        b.transition(UnitEvent::QuickScored(result(0.0, 0.0))).unwrap();
        b.transition(UnitEvent::Suppress).unwrap();
        let counts = count_states([&a, &b]);
        assert_eq!(counts.refining, 1);
        assert_eq!(counts.suppressed, 1);
    }
}
