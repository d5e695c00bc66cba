//! Application Configuration
//!
//! Service settings stored in TOML format, with environment variable
//! overrides for deployment (`PORT`, `DETECTAR_*`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Virtual display pool settings
    pub display: DisplayConfig,
    /// Capture settings
    pub capture: CaptureSettings,
    /// OCR settings
    pub ocr: OcrSettings,
    /// Detection settings
    pub detection: DetectionSettings,
    /// Storage settings
    pub storage: StorageConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Virtual display pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Display server binary (Xvfb)
    pub server_command: String,
    /// First display number to allocate (`:base_display`, `:base_display+1`, ...)
    pub base_display: u32,
    /// Number of display slots in the pool
    pub slots: u32,
    /// Maximum concurrent leases sharing one display
    pub max_leases_per_slot: u32,
    /// Screen geometry passed to the display server
    pub screen: String,
    /// How long acquire() waits for a free slot before failing
    pub acquire_timeout_ms: u64,
    /// Wait for the X socket to appear after spawning the server.
    /// Disabled in tests that substitute a dummy server command.
    pub wait_for_socket: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            server_command: "Xvfb".to_string(),
            base_display: 90,
            slots: 4,
            max_leases_per_slot: 4,
            screen: "1280x1024x24".to_string(),
            acquire_timeout_ms: 10_000,
            wait_for_socket: true,
        }
    }
}

/// Capture-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Screenshot binary invoked against the virtual display
    pub tool: String,
    /// Deadline for one screenshot attempt
    pub timeout_ms: u64,
    /// Retry policy for flaky screenshot attempts
    pub retry: RetryPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            tool: "scrot".to_string(),
            timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry with exponential backoff, expressed as configuration
/// rather than ad hoc loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Backoff multiplier applied per retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff delay before retry `n` (1-based)
    pub fn backoff(&self, retry: u32) -> std::time::Duration {
        let ms =
            self.initial_backoff_ms as f64 * self.multiplier.powi(retry.saturating_sub(1) as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

/// OCR settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Tesseract binary
    pub binary: String,
    /// Recognition language
    pub language: String,
    /// Page segmentation mode passed as `--psm`
    pub page_seg_mode: u32,
    /// Deadline for one OCR run
    pub timeout_ms: u64,
    /// Blocks below this confidence are flagged low-confidence (never dropped)
    pub low_confidence_threshold: f32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
            page_seg_mode: 3,
            timeout_ms: 30_000,
            low_confidence_threshold: 0.5,
        }
    }
}

/// Detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Path to the TOML rules file; None loads no rules
    pub rules_file: Option<PathBuf>,
    /// Orchestrator-level attempts for display acquisition
    pub display_attempts: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            rules_file: None,
            display_attempts: 3,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; None uses the per-user data directory
    pub database_path: Option<PathBuf>,
    /// Disable persistence entirely
    pub disabled: bool,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Apply environment variable overrides on top of file/default configuration.
///
/// `PORT` matches the container convention; everything else is namespaced
/// under `DETECTAR_`.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            config.server.port = port;
        }
    }
    if let Ok(host) = std::env::var("DETECTAR_HOST") {
        config.server.host = host;
    }
    if let Ok(rules) = std::env::var("DETECTAR_RULES_FILE") {
        config.detection.rules_file = Some(PathBuf::from(rules));
    }
    if let Ok(db) = std::env::var("DETECTAR_DATABASE") {
        config.storage.database_path = Some(PathBuf::from(db));
    }
    if let Ok(base) = std::env::var("DETECTAR_BASE_DISPLAY") {
        if let Ok(base) = base.parse() {
            config.display.base_display = base;
        }
    }
}
