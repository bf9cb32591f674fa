#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod input;
mod signal;
mod telemetry;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use hookwire_dispatch::{
    DispatchEngine, DispatchHandle, InMemoryEventStore, InMemoryWebhookDirectory, WebhookError,
    WebhookEventStatus,
};
use hookwire_webhook::reqwest::ReqwestClient;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Cli;
use crate::signal::stop_signal;

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "hookwire_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "hookwire_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "hookwire_cli::config";
pub const TRACING_TARGET_INPUT: &str = "hookwire_cli::input";
pub const TRACING_TARGET_ERRORS: &str = "hookwire_cli::errors";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            "application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %error,
            "application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::init();

    telemetry::init_tracing()?;
    cli.log();
    let dispatch_config = cli.dispatch_config()?;

    let webhooks = input::load_webhooks(&cli.input.webhooks).await?;
    let directory = Arc::new(InMemoryWebhookDirectory::from_webhooks(webhooks));
    let store = Arc::new(InMemoryEventStore::new());
    let client = ReqwestClient::new(cli.http.clone())
        .context("failed to create HTTP client")?
        .into_service();

    let engine = DispatchEngine::new(directory, store.clone(), client, dispatch_config);
    tokio::spawn(log_errors(engine.subscribe_errors()));
    let handle = engine
        .start()
        .await
        .context("failed to start dispatch engine")?;

    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        version = env!("CARGO_PKG_VERSION"),
        "hookwire started"
    );

    let feed = input::feed_events(&cli.input.events, cli.input.events_from_stdin(), &store);
    tokio::select! {
        result = feed => {
            let summary = result?;
            tracing::info!(
                target: TRACING_TARGET_INPUT,
                accepted = summary.accepted,
                rejected = summary.rejected,
                "Finished reading events"
            );
            if !cli.input.exit_after_input {
                wait_for_stop(&handle).await;
            }
        }
        _ = stop_signal() => {}
        () = handle.stopped() => {}
    }

    handle
        .shutdown()
        .await
        .context("dispatch engine stopped with an error")?;
    log_summary(&store).await;

    Ok(())
}

/// Waits for a shutdown signal or for the engine to stop on its own.
async fn wait_for_stop(handle: &DispatchHandle) {
    tokio::select! {
        _ = stop_signal() => {}
        () = handle.stopped() => {}
    }
}

/// Logs every operational error reported by the engine.
async fn log_errors(mut errors: broadcast::Receiver<WebhookError>) {
    loop {
        match errors.recv().await {
            Ok(WebhookError::MissingWebhook { webhook_id }) => {
                tracing::warn!(
                    target: TRACING_TARGET_ERRORS,
                    webhook_id = %webhook_id,
                    "Event references an unknown webhook"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    target: TRACING_TARGET_ERRORS,
                    skipped,
                    "Error log fell behind, errors skipped"
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Logs how many events ended in each status.
async fn log_summary(store: &InMemoryEventStore) {
    let counts = store.count_by_status().await;
    let count = |status: WebhookEventStatus| counts.get(&status).copied().unwrap_or_default();

    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        new = count(WebhookEventStatus::New),
        delivering = count(WebhookEventStatus::Delivering),
        delivered = count(WebhookEventStatus::Delivered),
        failed = count(WebhookEventStatus::Failed),
        "Event status summary"
    );
}
