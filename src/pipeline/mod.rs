//! Pipeline Orchestrator
//!
//! Coordinates display acquisition, frame capture, OCR extraction, detection
//! and persistence for one request. Runs as a state machine:
//!
//! `Idle -> DisplayAcquired -> FrameCaptured -> TextExtracted -> Detected -> Finalized`
//!
//! with `Failed` as the terminal state for unrecoverable capture-side errors.
//! The display lease is released on every exit path, including cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{DetectionEngine, Finding};
use crate::capture::frame::{Frame, FrameMeta};
use crate::capture::FrameCapturer;
use crate::config::AppConfig;
use crate::display::{DisplayHandle, DisplayPool};
use crate::error::{PipelineError, Stage, StageError};
use crate::storage::Database;
use crate::vision::{TextBlock, TextRecognizer};

/// Overall outcome of one pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every stage succeeded
    Ok,
    /// Capture and OCR succeeded; detection or persistence recorded
    /// recoverable errors
    Partial,
    /// No usable frame, or OCR failed terminally
    Failed,
}

/// What to run the pipeline against
#[derive(Debug, Clone)]
pub enum DetectionRequest {
    /// Screenshot a leased virtual display
    LiveCapture,
    /// Decode the submitted image bytes (display stage skipped entirely)
    Upload(Vec<u8>),
}

/// Unified result of one pipeline run; persisted after assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub id: Uuid,
    pub status: PipelineStatus,
    /// Frame metadata; None iff no frame was captured
    pub frame: Option<FrameMeta>,
    /// Extracted text blocks in reading order
    pub blocks: Vec<TextBlock>,
    /// Findings ordered by severity descending, rule id ascending
    pub findings: Vec<Finding>,
    /// Stage-level errors accumulated during the run
    pub errors: Vec<StageError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Orchestrator state machine positions, logged per transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    DisplayAcquired,
    FrameCaptured,
    TextExtracted,
    Detected,
    Finalized,
    Failed,
}

/// Intermediate data carried between stages
struct StageData {
    frame_meta: Option<FrameMeta>,
    blocks: Vec<TextBlock>,
    findings: Vec<Finding>,
    rule_errors: Vec<StageError>,
    /// Terminal failure: stage, attempt that produced it, error
    fatal: Option<(Stage, u32, PipelineError)>,
}

/// Coordinates the capture-to-detection pipeline per request.
///
/// Independent requests run concurrently; captures against one display are
/// serialized by the display handle itself.
pub struct Orchestrator {
    displays: DisplayPool,
    capturer: FrameCapturer,
    recognizer: Arc<dyn TextRecognizer>,
    detector: Arc<DetectionEngine>,
    store: Option<Arc<Database>>,
    display_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        recognizer: Arc<dyn TextRecognizer>,
        detector: Arc<DetectionEngine>,
        store: Option<Arc<Database>>,
    ) -> Self {
        debug!(recognizer = recognizer.name(), "building orchestrator");
        Self {
            displays: DisplayPool::new(config.display.clone()),
            capturer: FrameCapturer::new(config.capture.clone()),
            recognizer,
            detector,
            store,
            display_attempts: config.detection.display_attempts.max(1),
        }
    }

    /// Display pool, exposed for health reporting
    pub fn display_pool(&self) -> &DisplayPool {
        &self.displays
    }

    /// Run the full pipeline for one request. Always returns a structured
    /// result; failures surface as `status: failed` with stage errors, never
    /// as a bare error.
    pub async fn run(&self, request: DetectionRequest, cancel: CancellationToken) -> PipelineResult {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut handle: Option<DisplayHandle> = None;

        debug!(%id, "pipeline run starting");
        let data = self.run_stages(&request, &cancel, &mut handle).await;

        // Finalized: the display lease is released on every exit path
        if let Some(h) = handle.take() {
            self.displays.release(h).await;
        }

        let mut errors = Vec::new();
        let status = match &data.fatal {
            Some((stage, attempt, e)) => {
                errors.push(StageError::new(*stage, *attempt, e));
                debug!(%id, state = ?RunState::Failed, "pipeline run failed: {}", e);
                PipelineStatus::Failed
            }
            None => PipelineStatus::Ok,
        };
        errors.extend(data.rule_errors);

        let mut result = PipelineResult {
            id,
            status,
            frame: data.frame_meta,
            blocks: data.blocks,
            findings: data.findings,
            errors,
            started_at,
            completed_at: Utc::now(),
        };

        if result.status != PipelineStatus::Failed {
            self.persist(&mut result).await;
            result.status = if result.errors.is_empty() {
                PipelineStatus::Ok
            } else {
                PipelineStatus::Partial
            };
            debug!(%id, state = ?RunState::Finalized, "pipeline run finalized");
        }

        result.completed_at = Utc::now();
        info!(
            %id,
            status = ?result.status,
            blocks = result.blocks.len(),
            findings = result.findings.len(),
            errors = result.errors.len(),
            "pipeline run finished"
        );
        result
    }

    async fn run_stages(
        &self,
        request: &DetectionRequest,
        cancel: &CancellationToken,
        handle_slot: &mut Option<DisplayHandle>,
    ) -> StageData {
        let mut data = StageData {
            frame_meta: None,
            blocks: Vec::new(),
            findings: Vec::new(),
            rule_errors: Vec::new(),
            fatal: None,
        };
        let mut state = RunState::Idle;
        debug!(state = ?state, "pipeline idle");

        // Stage 1: frame acquisition
        let frame = match request {
            DetectionRequest::Upload(bytes) => {
                // Idle -> FrameCaptured: display stage skipped for uploads
                match self.capturer.from_bytes(bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        data.fatal = Some((Stage::Capture, 1, e));
                        return data;
                    }
                }
            }
            DetectionRequest::LiveCapture => {
                let handle = match self.acquire_display(cancel).await {
                    Ok(handle) => handle,
                    Err((attempt, e)) => {
                        data.fatal = Some((Stage::Display, attempt, e));
                        return data;
                    }
                };
                state = RunState::DisplayAcquired;
                debug!(state = ?state, display = handle.display(), "display acquired");
                let handle = handle_slot.insert(handle);

                match self.capturer.capture_display(handle, cancel).await {
                    Ok(frame) => frame,
                    Err((attempt, e)) => {
                        data.fatal = Some((Stage::Capture, attempt, e));
                        return data;
                    }
                }
            }
        };

        state = RunState::FrameCaptured;
        debug!(state = ?state, width = frame.width, height = frame.height, "frame captured");
        data.frame_meta = Some(frame.meta());

        // Stage 2: OCR extraction. Not retried: engine failures are
        // deterministic for a given frame.
        let blocks = match self.extract_text(&frame, cancel).await {
            Ok(blocks) => blocks,
            Err(e) => {
                data.fatal = Some((Stage::Ocr, 1, e));
                return data;
            }
        };
        state = RunState::TextExtracted;
        debug!(state = ?state, blocks = blocks.len(), "text extracted");
        data.blocks = blocks;

        // Stage 3: detection. Rule failures are isolated and non-fatal.
        let (findings, rule_errors) = self.detector.evaluate(&data.blocks);
        state = RunState::Detected;
        debug!(state = ?state, findings = findings.len(), "detection evaluated");
        data.findings = findings;
        data.rule_errors = rule_errors;

        data
    }

    /// Orchestrator-level bounded retry around display acquisition. Failures
    /// carry the attempt that produced them.
    async fn acquire_display(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DisplayHandle, (u32, PipelineError)> {
        let mut last_err = None;
        for attempt in 1..=self.display_attempts {
            if cancel.is_cancelled() {
                return Err((attempt, PipelineError::Cancelled));
            }
            match self.displays.acquire().await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(attempt, "display acquisition failed: {}", e);
                    last_err = Some((attempt, e));
                }
            }
        }
        Err(last_err.unwrap_or((
            self.display_attempts,
            PipelineError::DisplayUnavailable {
                attempts: self.display_attempts,
            },
        )))
    }

    async fn extract_text(
        &self,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextBlock>, PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            blocks = self.recognizer.recognize(frame) => blocks,
        }
    }

    /// Persist the assembled result. Storage failure is a stage error on the
    /// result, never fatal to the response.
    async fn persist(&self, result: &mut PipelineResult) {
        let Some(store) = &self.store else {
            return;
        };

        let store = Arc::clone(store);
        let snapshot = result.clone();
        let stored = tokio::task::spawn_blocking(move || store.store(&snapshot)).await;

        match stored {
            Ok(Ok(receipt)) => {
                debug!(result_id = %result.id, row_id = receipt.row_id, "result persisted");
            }
            Ok(Err(e)) => {
                warn!(result_id = %result.id, "persistence failed: {}", e);
                result.errors.push(StageError::new(Stage::Persistence, 1, &e));
            }
            Err(e) => {
                let e = PipelineError::Storage(format!("persistence task panicked: {}", e));
                result.errors.push(StageError::new(Stage::Persistence, 1, &e));
            }
        }
    }
}
