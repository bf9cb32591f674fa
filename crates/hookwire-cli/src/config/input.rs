//! Input sources configuration.

use std::path::PathBuf;

use anyhow::{Result as AnyhowResult, anyhow};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET_CONFIG;

/// Path value that selects standard input for events.
pub const STDIN: &str = "-";

/// Where webhooks and events are read from.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct InputConfig {
    /// JSON file with the array of registered webhooks
    #[arg(long, env = "WEBHOOKS_FILE")]
    pub webhooks: PathBuf,

    /// NDJSON file with one event per line, or `-` for stdin
    #[arg(long, env = "EVENTS_FILE", default_value = STDIN)]
    #[serde(default = "default_events")]
    pub events: PathBuf,

    /// Shut down once every event of the input was read
    #[arg(long, env = "EXIT_AFTER_INPUT")]
    #[serde(default)]
    pub exit_after_input: bool,
}

fn default_events() -> PathBuf {
    PathBuf::from(STDIN)
}

impl InputConfig {
    /// Returns whether events are read from standard input.
    pub fn events_from_stdin(&self) -> bool {
        self.events.as_os_str() == STDIN
    }

    /// Validates that the input files exist.
    pub fn validate(&self) -> AnyhowResult<()> {
        if !self.webhooks.is_file() {
            return Err(anyhow!(
                "Webhooks file '{}' does not exist",
                self.webhooks.display()
            ));
        }

        if !self.events_from_stdin() && !self.events.is_file() {
            return Err(anyhow!(
                "Events file '{}' does not exist",
                self.events.display()
            ));
        }

        Ok(())
    }

    pub fn log(&self) {
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            webhooks = %self.webhooks.display(),
            events = %self.events.display(),
            exit_after_input = self.exit_after_input,
            "Input configuration"
        );
    }
}
