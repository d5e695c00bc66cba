//! Tesseract OCR backend
//!
//! Runs the `tesseract` binary in TSV output mode and groups word-level rows
//! into line blocks with unioned bounding boxes and averaged confidences.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::capture::frame::Frame;
use crate::config::OcrSettings;
use crate::error::PipelineError;

use super::{sort_reading_order, Bounds, TextBlock, TextRecognizer};

/// OCR engine shelling out to the Tesseract binary
pub struct TesseractOcr {
    settings: OcrSettings,
}

impl TesseractOcr {
    pub fn new(settings: OcrSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TextRecognizer for TesseractOcr {
    async fn recognize(&self, frame: &Frame) -> Result<Vec<TextBlock>, PipelineError> {
        let png = frame
            .to_png_bytes()
            .map_err(|e| PipelineError::OcrEngine(format!("frame encode failed: {}", e)))?;

        // Tesseract reads from a file path; stdin handling varies by build
        let mut input = tempfile::Builder::new()
            .prefix("detectar-ocr-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| PipelineError::OcrEngine(format!("scratch file: {}", e)))?;
        input
            .write_all(&png)
            .map_err(|e| PipelineError::OcrEngine(format!("scratch file: {}", e)))?;

        debug!(
            width = frame.width,
            height = frame.height,
            binary = %self.settings.binary,
            "running OCR"
        );

        let run = Command::new(&self.settings.binary)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", &self.settings.language])
            .args(["--psm", &self.settings.page_seg_mode.to_string()])
            .arg("tsv")
            .kill_on_drop(true)
            .output();

        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PipelineError::OcrEngine(format!(
                    "failed to run {}: {}",
                    self.settings.binary, e
                )))
            }
            Err(_) => {
                return Err(PipelineError::OcrEngine(format!(
                    "OCR timed out after {}ms",
                    self.settings.timeout_ms
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::OcrEngine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let blocks = parse_tsv(&tsv, self.settings.low_confidence_threshold)?;
        debug!(blocks = blocks.len(), "OCR extraction complete");
        Ok(blocks)
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// One word row accumulated into its line group
struct LineAccumulator {
    words: Vec<String>,
    bounds: Bounds,
    conf_sum: f32,
    conf_count: u32,
}

/// Parse Tesseract TSV output into line-level text blocks.
///
/// TSV columns: level, page_num, block_num, par_num, line_num, word_num,
/// left, top, width, height, conf, text. Word rows are level 5; they are
/// grouped by (block, paragraph, line) with a unioned bounding box and the
/// mean of per-word confidences (words with conf -1 contribute no score).
fn parse_tsv(tsv: &str, low_confidence_threshold: f32) -> Result<Vec<TextBlock>, PipelineError> {
    let mut lines = tsv.lines();
    match lines.next() {
        Some(header) if header.starts_with("level") => {}
        _ => {
            return Err(PipelineError::OcrEngine(
                "unexpected TSV output from tesseract".to_string(),
            ))
        }
    }

    // BTreeMap keyed by (block, par, line) keeps engine emission order stable
    let mut groups: BTreeMap<(u32, u32, u32), LineAccumulator> = BTreeMap::new();

    for row in lines {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        let level: u32 = fields[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }

        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }

        let parse_u32 = |s: &str| -> Result<u32, PipelineError> {
            s.parse()
                .map_err(|_| PipelineError::OcrEngine(format!("malformed TSV field '{}'", s)))
        };

        let key = (parse_u32(fields[2])?, parse_u32(fields[3])?, parse_u32(fields[4])?);
        let bounds = Bounds::new(
            parse_u32(fields[6])?,
            parse_u32(fields[7])?,
            parse_u32(fields[8])?,
            parse_u32(fields[9])?,
        );
        let conf: f32 = fields[10].parse().unwrap_or(-1.0);

        let entry = groups.entry(key).or_insert(LineAccumulator {
            words: Vec::new(),
            bounds,
            conf_sum: 0.0,
            conf_count: 0,
        });
        entry.words.push(text.to_string());
        entry.bounds = entry.bounds.union(&bounds);
        if conf >= 0.0 {
            entry.conf_sum += conf;
            entry.conf_count += 1;
        }
    }

    let mut blocks: Vec<TextBlock> = groups
        .into_values()
        .map(|acc| {
            let confidence = if acc.conf_count > 0 {
                (acc.conf_sum / acc.conf_count as f32 / 100.0).clamp(0.0, 1.0)
            } else {
                0.0
            };
            TextBlock {
                index: 0,
                text: acc.words.join(" "),
                bounds: acc.bounds,
                confidence,
                low_confidence: confidence < low_confidence_threshold,
            }
        })
        .collect();

    sort_reading_order(&mut blocks);
    Ok(blocks)
}
