//! CLI configuration management.
//!
//! This module defines the complete CLI configuration hierarchy:
//!
//! ```text
//! Cli
//! ├── input: InputConfig        # Webhooks file, events source
//! ├── dispatch: DispatchArgs    # Batching, idle TTL, shutdown timeout
//! └── http: ReqwestConfig       # HTTP client timeouts, user agent
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.
//! Use `--help` to see all available options.
//!
//! # Example
//!
//! ```bash
//! hookwire --webhooks webhooks.json --events events.ndjson --batching
//!
//! # Or via environment variables
//! WEBHOOKS_FILE=webhooks.json BATCHING_ENABLED=true hookwire < events.ndjson
//! ```

mod input;

use std::process;

use anyhow::Context;
use clap::Parser;
use hookwire_dispatch::{DispatchArgs, DispatchConfig};
use hookwire_webhook::reqwest::ReqwestConfig;
pub use input::InputConfig;
use serde::{Deserialize, Serialize};

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_STARTUP};

/// Complete CLI configuration.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "hookwire")]
#[command(about = "Webhook dispatch and batching engine")]
#[command(version)]
pub struct Cli {
    /// Webhook and event input sources.
    #[clap(flatten)]
    pub input: InputConfig,

    /// Dispatch engine configuration.
    #[clap(flatten)]
    pub dispatch: DispatchArgs,

    /// HTTP client configuration.
    #[clap(flatten)]
    pub http: ReqwestConfig,
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    ///
    /// The .env file is loaded before clap parses arguments so that its
    /// variables act as defaults.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    /// No-op when dotenv feature is disabled.
    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Validates all configuration values and builds the engine configuration.
    pub fn dispatch_config(&self) -> anyhow::Result<DispatchConfig> {
        self.input.validate().context("invalid input configuration")?;
        DispatchConfig::try_from(&self.dispatch).context("invalid dispatch configuration")
    }

    /// Logs configuration (no sensitive information).
    pub fn log(&self) {
        tracing::debug!(
            target: TRACING_TARGET_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );

        self.input.log();

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            batching = self.dispatch.batching,
            batch_max_size = self.dispatch.batch_max_size,
            batch_max_wait_ms = self.dispatch.batch_max_wait_ms,
            batch_idle_ttl_secs = self.dispatch.batch_idle_ttl,
            shutdown_timeout_secs = self.dispatch.shutdown_timeout,
            max_parked = self.dispatch.max_parked,
            "Dispatch configuration"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            timeout_secs = self.http.timeout().as_secs(),
            connect_timeout_secs = self.http.connect_timeout().as_secs(),
            user_agent = %self.http.effective_user_agent(),
            "HTTP client configuration"
        );
    }

    /// Returns a list of enabled compile-time features.
    fn enabled_features() -> Vec<&'static str> {
        [cfg!(feature = "dotenv").then_some("dotenv")]
            .into_iter()
            .flatten()
            .collect()
    }
}
