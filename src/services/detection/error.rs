// Detection Errors
// Per-unit failures. None of these halt processing of other units.

use thiserror::Error;

use crate::services::remote_scorer::RemoteScorerError;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("pixel read blocked by cross-origin policy")]
    PixelAccessDenied,
    #[error("feature extraction unavailable: {0}")]
    ExtractionUnavailable(String),
    #[error("malformed discovery event: {0}")]
    MalformedInput(String),
    #[error("remote scorer unreachable: {0}")]
    RemoteScorerUnreachable(#[from] RemoteScorerError),
    #[error("refinement task aborted: {0}")]
    RefinementAborted(String),
}

impl DetectionError {
    /// Errors that are expected on real pages and only warrant a debug log.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::PixelAccessDenied | Self::ExtractionUnavailable(_)
        )
    }
}
