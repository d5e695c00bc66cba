//! Detection Layer
//!
//! Evaluates detection rules against OCR-extracted text blocks. Rules are
//! loaded at startup and read-only during request processing; each rule is
//! evaluated in isolation so one misbehaving rule cannot abort the batch.

pub mod engine;
pub mod rules;

use serde::{Deserialize, Serialize};

pub use engine::DetectionEngine;
pub use rules::{DetectionRule, Severity};

/// A structured detection result referencing specific OCR text evidence.
///
/// Always references at least one block index that exists in the same
/// pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule that produced this finding
    pub rule_id: String,
    /// Severity inherited from the rule
    pub severity: Severity,
    /// Reading-order indices of the matched blocks (never empty)
    pub block_indices: Vec<usize>,
    /// Matched text evidence
    pub snippet: String,
    /// Confidence of the underlying OCR evidence
    pub confidence: f32,
}
