// Annotation Renderer
// Applies and removes visual treatments on the host surface. It never decides
// anything: the treatment comes from the batch RenderConfig, the target from the unit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Annotation, AnnotationMode, UnitId};
use crate::services::unit::ClassificationUnit;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("annotation on {0} is a removal and cannot be reverted")]
    Irreversible(UnitId),
    #[error("no rendered node for unit {0}")]
    UnknownNode(UnitId),
}

/// Rendering flags for one discovery batch. Threaded explicitly into every call so a
/// mode change mid-refinement cannot be observed half-way.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    pub mode: AnnotationMode,
    pub show_certainty: bool,
    pub blur_px: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: AnnotationMode::Blur,
            show_certainty: false,
            blur_px: 8,
        }
    }
}

/// Overlay shown next to an annotated unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub certainty: f64,
}

impl Badge {
    pub fn label(&self) -> String {
        format!("AI {:.0}%", self.certainty.clamp(0.0, 1.0) * 100.0)
    }
}

/// Host rendering surface.
pub trait AnnotationSink: Send {
    fn apply(
        &mut self,
        id: &UnitId,
        treatment: Annotation,
        badge: Option<Badge>,
        config: &RenderConfig,
    ) -> Result<(), RenderError>;

    fn revert(&mut self, id: &UnitId) -> Result<(), RenderError>;

    fn update_badge(&mut self, _id: &UnitId, _badge: Badge) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Drives a sink from unit state.
pub struct AnnotationRenderer<S: AnnotationSink> {
    sink: S,
}

impl<S: AnnotationSink> AnnotationRenderer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Apply the configured treatment. A unit that already carries an annotation is
    /// left untouched and its current treatment is returned.
    pub fn apply(
        &mut self,
        unit: &ClassificationUnit,
        config: &RenderConfig,
    ) -> Result<Annotation, RenderError> {
        if unit.annotation() != Annotation::None {
            return Ok(unit.annotation());
        }
        let treatment = config.mode.treatment();
        let badge = badge_for(unit, config);
        self.sink.apply(&unit.id, treatment, badge, config)?;
        tracing::debug!("[RENDER] applied {:?} to unit={}", treatment, unit.id);
        Ok(treatment)
    }

    pub fn revert(&mut self, unit: &ClassificationUnit) -> Result<(), RenderError> {
        match unit.annotation() {
            Annotation::None => Ok(()),
            Annotation::Removed => Err(RenderError::Irreversible(unit.id.clone())),
            _ => {
                self.sink.revert(&unit.id)?;
                tracing::debug!("[RENDER] reverted unit={}", unit.id);
                Ok(())
            }
        }
    }

    /// Refresh the certainty overlay after refinement, if overlays are shown.
    pub fn refresh_badge(
        &mut self,
        unit: &ClassificationUnit,
        config: &RenderConfig,
    ) -> Result<(), RenderError> {
        if unit.annotation() == Annotation::None || unit.annotation() == Annotation::Removed {
            return Ok(());
        }
        match badge_for(unit, config) {
            Some(badge) => self.sink.update_badge(&unit.id, badge),
            None => Ok(()),
        }
    }
}

fn badge_for(unit: &ClassificationUnit, config: &RenderConfig) -> Option<Badge> {
    if !config.show_certainty {
        return None;
    }
    unit.best_result().map(|r| Badge {
        certainty: r.certainty(),
    })
}

// ============ In-memory surface ============

#[derive(Debug, Clone)]
struct Node {
    /// Pre-annotation markup. Dropped once the node is removed.
    original: Option<String>,
    rendered: String,
    annotation: Annotation,
    /// Radius the current treatment was rendered with.
    blur_px: u32,
}

/// Markup-level stand-in for a page. Used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemorySurface {
    nodes: HashMap<UnitId, Node>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: UnitId, content: &str) {
        self.nodes.insert(
            id,
            Node {
                original: Some(content.to_string()),
                rendered: content.to_string(),
                annotation: Annotation::None,
                blur_px: 0,
            },
        );
    }

    pub fn content(&self, id: &UnitId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.rendered.as_str())
    }

    pub fn annotation(&self, id: &UnitId) -> Annotation {
        self.nodes.get(id).map(|n| n.annotation).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn wrap(original: &str, treatment: Annotation, badge: Option<Badge>, config: &RenderConfig) -> String {
    let badge_html = badge
        .map(|b| format!("<span class=\"closeai-badge\">{}</span>", b.label()))
        .unwrap_or_default();
    match treatment {
        Annotation::Blurred => format!(
            "<div class=\"closeai-blur\" style=\"filter: blur({}px)\">{}{}</div>",
            config.blur_px, badge_html, original
        ),
        Annotation::Outlined => format!(
            "<div class=\"closeai-outline\">{}{}</div>",
            badge_html, original
        ),
        Annotation::Removed | Annotation::None => String::new(),
    }
}

impl AnnotationSink for MemorySurface {
    fn apply(
        &mut self,
        id: &UnitId,
        treatment: Annotation,
        badge: Option<Badge>,
        config: &RenderConfig,
    ) -> Result<(), RenderError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownNode(id.clone()))?;

        if node.annotation != Annotation::None || treatment == Annotation::None {
            return Ok(());
        }

        match treatment {
            Annotation::Removed => {
                node.original = None;
                node.rendered.clear();
            }
            _ => {
                let original = node.original.as_deref().unwrap_or_default();
                node.rendered = wrap(original, treatment, badge, config);
                node.blur_px = config.blur_px;
            }
        }
        node.annotation = treatment;
        Ok(())
    }

    fn revert(&mut self, id: &UnitId) -> Result<(), RenderError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownNode(id.clone()))?;

        match node.annotation {
            Annotation::None => Ok(()),
            Annotation::Removed => Err(RenderError::Irreversible(id.clone())),
            _ => {
                if let Some(original) = &node.original {
                    node.rendered = original.clone();
                }
                node.annotation = Annotation::None;
                Ok(())
            }
        }
    }

    fn update_badge(&mut self, id: &UnitId, badge: Badge) -> Result<(), RenderError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownNode(id.clone()))?;
        if let (Some(original), true) = (&node.original, node.annotation.is_reversible()) {
            let config = RenderConfig { blur_px: node.blur_px, ..RenderConfig::default() };
            node.rendered = wrap(original, node.annotation, Some(badge), &config);
        }
        Ok(())
    }
}
