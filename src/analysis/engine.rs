//! Rule evaluation engine
//!
//! Each rule is a pure function over the extracted text blocks. Evaluation is
//! isolated per rule: a failing rule records one stage error and the rest of
//! the batch still runs. Findings are ordered deterministically by severity
//! descending, then rule id, then block index.

use anyhow::{Context, Result};
use rhai::{Engine, Scope, AST};
use tracing::{debug, warn};

use crate::error::{PipelineError, Stage, StageError};
use crate::vision::TextBlock;

use super::rules::{DetectionRule, RuleMatcher};
use super::Finding;

enum Compiled {
    Regex(regex::Regex),
    Script(AST),
}

struct CompiledRule {
    rule: DetectionRule,
    matcher: Compiled,
}

/// Detection engine holding the compiled, read-only rule set
pub struct DetectionEngine {
    engine: Engine,
    rules: Vec<CompiledRule>,
}

impl DetectionEngine {
    /// Compile a rule set. Invalid patterns or scripts fail here, at startup,
    /// rather than during request processing.
    pub fn new(rules: Vec<DetectionRule>) -> Result<Self> {
        let engine = Engine::new();

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = match &rule.matcher {
                RuleMatcher::Pattern { pattern } => Compiled::Regex(
                    regex::Regex::new(pattern)
                        .with_context(|| format!("invalid pattern in rule '{}'", rule.id))?,
                ),
                RuleMatcher::Script { script } => Compiled::Script(
                    engine
                        .compile(script)
                        .map_err(|e| anyhow::anyhow!("invalid script in rule '{}': {}", rule.id, e))?,
                ),
            };
            compiled.push(CompiledRule { rule, matcher });
        }

        Ok(Self {
            engine,
            rules: compiled,
        })
    }

    /// Number of loaded rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every enabled rule against the extracted blocks.
    ///
    /// Returns the ordered findings plus one stage error per rule that failed
    /// during evaluation.
    pub fn evaluate(&self, blocks: &[TextBlock]) -> (Vec<Finding>, Vec<StageError>) {
        let mut findings = Vec::new();
        let mut errors = Vec::new();

        for compiled in &self.rules {
            if !compiled.rule.enabled {
                continue;
            }

            match self.eval_rule(compiled, blocks) {
                Ok(mut rule_findings) => findings.append(&mut rule_findings),
                Err(e) => {
                    warn!(rule_id = %compiled.rule.id, "rule evaluation failed: {}", e);
                    errors.push(StageError::new(Stage::Detection, 1, &e));
                }
            }
        }

        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.block_indices.cmp(&b.block_indices))
        });

        debug!(
            findings = findings.len(),
            rule_errors = errors.len(),
            "detection complete"
        );
        (findings, errors)
    }

    fn eval_rule(
        &self,
        compiled: &CompiledRule,
        blocks: &[TextBlock],
    ) -> Result<Vec<Finding>, PipelineError> {
        let rule = &compiled.rule;
        let mut findings = Vec::new();

        for block in blocks {
            let matched = match &compiled.matcher {
                Compiled::Regex(regex) => regex.find(&block.text).map(|m| m.as_str().to_string()),
                Compiled::Script(ast) => {
                    let mut scope = Scope::new();
                    scope.push("text", block.text.clone());
                    scope.push("confidence", block.confidence as f64);
                    scope.push("index", block.index as i64);

                    let hit = self
                        .engine
                        .eval_ast_with_scope::<bool>(&mut scope, ast)
                        .map_err(|e| PipelineError::Rule {
                            rule_id: rule.id.clone(),
                            message: e.to_string(),
                        })?;
                    hit.then(|| block.text.clone())
                }
            };

            if let Some(snippet) = matched {
                findings.push(Finding {
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    block_indices: vec![block.index],
                    snippet,
                    confidence: block.confidence,
                });
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::Severity;
    use crate::vision::Bounds;

    fn block(index: usize, text: &str, confidence: f32) -> TextBlock {
        TextBlock {
            index,
            text: text.to_string(),
            bounds: Bounds::new(10, 20 + index as u32 * 30, 100, 14),
            confidence,
            low_confidence: confidence < 0.5,
        }
    }

    fn pattern_rule(id: &str, severity: Severity, pattern: &str) -> DetectionRule {
        DetectionRule {
            id: id.to_string(),
            description: None,
            severity,
            enabled: true,
            matcher: RuleMatcher::Pattern {
                pattern: pattern.to_string(),
            },
        }
    }

    fn script_rule(id: &str, severity: Severity, script: &str) -> DetectionRule {
        DetectionRule {
            id: id.to_string(),
            description: None,
            severity,
            enabled: true,
            matcher: RuleMatcher::Script {
                script: script.to_string(),
            },
        }
    }

    #[test]
    fn test_invoice_pattern_matches_first_block_only() {
        let engine = DetectionEngine::new(vec![pattern_rule(
            "invoice",
            Severity::High,
            r"INVOICE #\d+",
        )])
        .unwrap();

        let blocks = vec![block(0, "INVOICE #123", 0.95), block(1, "TOTAL: $50", 0.9)];
        let (findings, errors) = engine.evaluate(&blocks);

        assert!(errors.is_empty());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "invoice");
        assert_eq!(findings[0].block_indices, vec![0]);
        assert_eq!(findings[0].snippet, "INVOICE #123");
    }

    #[test]
    fn test_script_rule_sees_confidence_and_index() {
        let engine = DetectionEngine::new(vec![script_rule(
            "shaky-total",
            Severity::Low,
            r#"text.contains("TOTAL") && confidence < 0.6"#,
        )])
        .unwrap();

        let blocks = vec![
            block(0, "TOTAL: $50", 0.4),
            block(1, "TOTAL: $99", 0.9),
        ];
        let (findings, errors) = engine.evaluate(&blocks);

        assert!(errors.is_empty());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].block_indices, vec![0]);
        assert_eq!(findings[0].snippet, "TOTAL: $50");
    }

    #[test]
    fn test_failing_rule_is_isolated() {
        let engine = DetectionEngine::new(vec![
            // R1 fails at runtime: the function does not exist
            script_rule("R1", Severity::High, "no_such_function(text)"),
            pattern_rule("R2", Severity::Medium, "TOTAL"),
        ])
        .unwrap();

        let blocks = vec![block(0, "TOTAL: $50", 0.9)];
        let (findings, errors) = engine.evaluate(&blocks);

        // R2 still produced its finding
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "R2");

        // Exactly one error, attributed to R1
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, Stage::Detection);
        assert!(errors[0].message.contains("R1"));
    }

    #[test]
    fn test_findings_ordered_by_severity_then_rule_id() {
        let engine = DetectionEngine::new(vec![
            pattern_rule("b-low", Severity::Low, "alpha"),
            pattern_rule("z-critical", Severity::Critical, "alpha"),
            pattern_rule("a-critical", Severity::Critical, "alpha"),
        ])
        .unwrap();

        let blocks = vec![block(0, "alpha", 0.9)];
        let (findings, _) = engine.evaluate(&blocks);

        let order: Vec<&str> = findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(order, vec!["a-critical", "z-critical", "b-low"]);
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let mut rule = pattern_rule("off", Severity::High, "TOTAL");
        rule.enabled = false;
        let engine = DetectionEngine::new(vec![rule]).unwrap();

        let (findings, errors) = engine.evaluate(&[block(0, "TOTAL", 0.9)]);
        assert!(findings.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_invalid_pattern_fails_at_compile() {
        let result = DetectionEngine::new(vec![pattern_rule("bad", Severity::Low, "(unclosed")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_findings_reference_existing_blocks() {
        let engine =
            DetectionEngine::new(vec![pattern_rule("any", Severity::Medium, r"\w+")]).unwrap();

        let blocks = vec![block(0, "one", 0.9), block(1, "two", 0.8), block(2, "three", 0.7)];
        let (findings, _) = engine.evaluate(&blocks);

        assert_eq!(findings.len(), 3);
        for finding in &findings {
            assert!(!finding.block_indices.is_empty());
            for idx in &finding.block_indices {
                assert!(blocks.iter().any(|b| b.index == *idx));
            }
        }
    }
}
