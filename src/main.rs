//! detectar - Headless capture-to-detection service
//!
//! Captures visual content from a virtual display (or accepts uploaded
//! images), extracts text via OCR, applies detection rules and exposes the
//! structured results over an HTTP API.

mod analysis;
mod capture;
mod config;
mod display;
mod error;
mod pipeline;
mod server;
mod storage;
mod vision;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::analysis::DetectionEngine;
use crate::config::AppConfig;
use crate::pipeline::{DetectionRequest, Orchestrator};
use crate::server::AppState;
use crate::storage::Database;
use crate::vision::TesseractOcr;

/// detectar - headless screen/document detection service
#[derive(Parser, Debug)]
#[command(name = "detectar")]
#[command(about = "Capture-to-detection pipeline: virtual display, OCR, rules, HTTP API")]
struct Args {
    /// Path to the configuration file (defaults to the per-user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the detection rules file
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Run the pipeline once on an image file, print the result JSON and exit
    #[arg(long)]
    scan: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = load_or_create_config(args.config.as_deref())?;
    config::apply_env_overrides(&mut config);
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(rules) = args.rules {
        config.detection.rules_file = Some(rules);
    }

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("detectar starting...");

    let rules: Vec<analysis::DetectionRule> = match &config.detection.rules_file {
        Some(path) => {
            let rules = analysis::rules::load_rules(path)?;
            info!("loaded {} detection rule(s) from {:?}", rules.len(), path);
            rules
        }
        None => {
            info!("no rules file configured, running with an empty rule set");
            Vec::new()
        }
    };
    let detector = Arc::new(DetectionEngine::new(rules)?);
    info!("detection engine ready with {} rule(s)", detector.rule_count());

    let store = if config.storage.disabled {
        None
    } else {
        let path = match &config.storage.database_path {
            Some(path) => path.clone(),
            None => storage::get_data_dir()?.join("results.db"),
        };
        Some(Arc::new(Database::open(&path)?))
    };

    let recognizer = Arc::new(TesseractOcr::new(config.ocr.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        recognizer,
        detector,
        store.clone(),
    ));

    // One-shot mode: scan a file and print the result
    if let Some(path) = args.scan {
        let bytes = std::fs::read(&path).with_context(|| format!("failed to read {:?}", path))?;
        let result = orchestrator
            .run(DetectionRequest::Upload(bytes), CancellationToken::new())
            .await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let router = server::create_router(AppState {
        orchestrator,
        db: store,
    });

    // A bind failure propagates out of serve() and exits the process non-zero
    server::serve(addr, router).await?;

    info!("detectar shutdown complete");
    Ok(())
}

/// Load configuration from an explicit path, the per-user config dir, or
/// defaults, in that order.
fn load_or_create_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)
            .with_context(|| format!("failed to load config from {:?}", path))?;
        info!("loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            if let Ok(config) = config::load_config(&config_path) {
                info!("loaded configuration from {:?}", config_path);
                return Ok(config);
            }
        } else if config::save_config(&AppConfig::default(), &config_path).is_ok() {
            info!("wrote default configuration to {:?}", config_path);
        }
    }

    info!("using default configuration");
    Ok(AppConfig::default())
}
