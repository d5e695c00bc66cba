//! Pipeline error taxonomy
//!
//! Distinguishes retryable capture-side failures from terminal ones so the
//! orchestrator can apply the right retry policy per stage.

use serde::{Deserialize, Serialize};

/// Pipeline stage identifiers, used to attribute errors to the stage that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Virtual display acquisition
    Display,
    /// Frame capture (screenshot or upload decode)
    Capture,
    /// OCR text extraction
    Ocr,
    /// Detection rule evaluation
    Detection,
    /// Result persistence
    Persistence,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Display => "display",
            Stage::Capture => "capture",
            Stage::Ocr => "ocr",
            Stage::Detection => "detection",
            Stage::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

/// Errors produced by the capture-to-detection pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No virtual display slot could be leased within the timeout
    #[error("no virtual display slot available after {attempts} attempt(s)")]
    DisplayUnavailable { attempts: u32 },

    /// Screenshot tool did not return within the configured deadline
    #[error("capture timed out after {elapsed_ms}ms")]
    CaptureTimeout { elapsed_ms: u64 },

    /// Captured or uploaded image has zero area or cannot be decoded
    #[error("captured frame is empty or unreadable: {0}")]
    CaptureEmpty(String),

    /// OCR engine crashed or rejected the frame; deterministic for a given
    /// frame, so never retried internally
    #[error("OCR engine error: {0}")]
    OcrEngine(String),

    /// A single detection rule failed during evaluation
    #[error("rule '{rule_id}' failed: {message}")]
    Rule { rule_id: String, message: String },

    /// Result could not be persisted
    #[error("storage error: {0}")]
    Storage(String),

    /// The request was cancelled by the caller
    #[error("pipeline run cancelled")]
    Cancelled,

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the failing operation may succeed if attempted again on the
    /// same input. OCR failures are deterministic per frame and excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::DisplayUnavailable { .. }
                | PipelineError::CaptureTimeout { .. }
                | PipelineError::CaptureEmpty(_)
        )
    }
}

/// A recoverable failure attributed to one pipeline stage, recorded on the
/// result without aborting the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    /// Stage that produced the error
    pub stage: Stage,
    /// 1-based attempt number at which the error occurred
    pub attempt: u32,
    /// Human-readable error description
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, attempt: u32, error: &PipelineError) -> Self {
        Self {
            stage,
            attempt,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::DisplayUnavailable { attempts: 1 }.is_retryable());
        assert!(PipelineError::CaptureTimeout { elapsed_ms: 5000 }.is_retryable());
        assert!(PipelineError::CaptureEmpty("zero area".into()).is_retryable());

        assert!(!PipelineError::OcrEngine("crash".into()).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_stage_error_serialization() {
        let err = StageError {
            stage: Stage::Detection,
            attempt: 1,
            message: "rule 'R1' failed: bad script".to_string(),
        };

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"detection\""));

        let parsed: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_stage_display_names() {
        assert_eq!(Stage::Display.to_string(), "display");
        assert_eq!(Stage::Persistence.to_string(), "persistence");
    }
}
