//! Detection rule definitions
//!
//! Rules live in a TOML file and are compiled once at startup: regex patterns
//! to `regex::Regex`, script predicates to rhai ASTs.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Finding severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// How a rule matches against extracted text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleMatcher {
    /// Regex applied to each block's text; one finding per matching block
    Pattern { pattern: String },
    /// rhai predicate run per block with `text`, `confidence` and `index`
    /// in scope; a truthy result produces a finding for that block
    Script { script: String },
}

/// A rule definition from the rules file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    /// Rule identifier, unique within the rule set
    pub id: String,
    /// Display description
    #[serde(default)]
    pub description: Option<String>,
    /// Severity assigned to findings from this rule
    #[serde(default)]
    pub severity: Severity,
    /// Whether this rule is evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Matcher definition
    #[serde(flatten)]
    pub matcher: RuleMatcher,
}

fn default_enabled() -> bool {
    true
}

/// On-disk rules file layout (`[[rules]]` tables)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<DetectionRule>,
}

/// Load rule definitions from a TOML file, validating id uniqueness
pub fn load_rules(path: &Path) -> Result<Vec<DetectionRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {:?}", path))?;
    let file: RuleFile =
        toml::from_str(&content).with_context(|| format!("invalid rules file {:?}", path))?;

    let mut seen = HashSet::new();
    for rule in &file.rules {
        if rule.id.is_empty() {
            bail!("rule with empty id in {:?}", path);
        }
        if !seen.insert(rule.id.clone()) {
            bail!("duplicate rule id '{}' in {:?}", rule.id, path);
        }
    }

    Ok(file.rules)
}
