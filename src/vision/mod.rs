//! Vision/OCR Layer
//!
//! Extracts structured text with geometry from captured frames. The engine
//! sits behind the [`TextRecognizer`] trait so backends can be swapped; the
//! default backend shells out to the Tesseract binary (see [`ocr`]).

pub mod ocr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;
use crate::error::PipelineError;

pub use ocr::TesseractOcr;

/// Axis-aligned bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Smallest box covering both boxes
    pub fn union(&self, other: &Bounds) -> Bounds {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Bounds::new(x, y, right - x, bottom - y)
    }
}

/// One recognized text block with geometry and confidence.
///
/// Blocks are immutable once extracted; `index` is the reading-order position
/// within the frame and is strictly increasing across a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Reading-order index (top-to-bottom, left-to-right tie-break)
    pub index: usize,
    /// Recognized text content
    pub text: String,
    /// Bounding box in frame coordinates
    pub bounds: Bounds,
    /// Recognition confidence in [0.0, 1.0]
    pub confidence: f32,
    /// Below the configured confidence threshold. Flagged, never dropped -
    /// detection rules decide relevance.
    pub low_confidence: bool,
}

/// Sort blocks into reading order and assign strictly increasing indices
pub fn sort_reading_order(blocks: &mut [TextBlock]) {
    blocks.sort_by(|a, b| {
        a.bounds
            .y
            .cmp(&b.bounds.y)
            .then(a.bounds.x.cmp(&b.bounds.x))
    });
    for (i, block) in blocks.iter_mut().enumerate() {
        block.index = i;
    }
}

/// Text recognition backend
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Extract text blocks from a frame, sorted in reading order.
    ///
    /// Failures are deterministic for a given frame and must not be retried
    /// internally; the caller may re-capture and restart the pipeline.
    async fn recognize(&self, frame: &Frame) -> Result<Vec<TextBlock>, PipelineError>;

    /// Backend name for logging
    fn name(&self) -> &str;
}
