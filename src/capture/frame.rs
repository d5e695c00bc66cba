//! Frame data structures for captured raster content

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    /// Screenshot of a virtual display
    VirtualDisplay,
    /// Image bytes submitted by the caller
    Upload,
}

/// A captured raster frame, the unit of work for OCR.
///
/// Immutable once created; owned by the pipeline run that produced it. Only
/// its metadata survives into the pipeline result.
#[derive(Debug)]
pub struct Frame {
    /// Raw RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels (always > 0)
    pub width: u32,
    /// Frame height in pixels (always > 0)
    pub height: u32,
    /// When the frame was captured
    pub captured_at: DateTime<Utc>,
    /// Capture source
    pub source: FrameSource,
}

/// Frame metadata carried into the pipeline result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub source: FrameSource,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame from a decoded image, rejecting zero-area input
    pub fn from_image(img: DynamicImage, source: FrameSource) -> Result<Self, PipelineError> {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::CaptureEmpty(format!(
                "zero-area image ({}x{})",
                width, height
            )));
        }

        Ok(Self {
            data: rgba.into_raw(),
            width,
            height,
            captured_at: Utc::now(),
            source,
        })
    }

    /// Decode encoded image bytes (PNG, JPEG, ...) into a frame
    pub fn from_bytes(bytes: &[u8], source: FrameSource) -> Result<Self, PipelineError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::CaptureEmpty(format!("unreadable image: {}", e)))?;
        Self::from_image(img, source)
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Encode the frame as PNG, the input format handed to the OCR engine
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let img = image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| PipelineError::CaptureEmpty("inconsistent frame buffer".to_string()))?;

        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img).write_to(&mut out, image::ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    /// Metadata snapshot for the pipeline result
    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            width: self.width,
            height: self.height,
            source: self.source,
            captured_at: self.captured_at,
        }
    }
}
