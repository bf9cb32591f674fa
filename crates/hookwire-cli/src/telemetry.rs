//! Structured logging to stderr.

use std::io::IsTerminal;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset; HTTP internals only log warnings.
const DEFAULT_FILTER: &str = "info,hyper_util=warn,reqwest=warn";

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` replaces [`DEFAULT_FILTER`], for example
/// `RUST_LOG=hookwire_dispatch=debug`. Logs go to stderr so events can be
/// piped through stdin, with colors only when stderr is a terminal.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}
