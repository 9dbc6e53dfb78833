
//! # Sitewatch Main Entry Point
//!
//! Loads configuration, initializes logging, and launches the watcher, the
//! build loop, and the optional site server with its live-reload hub.

use anyhow::Result;
use sitewatch::builder::CommandBuilder;
use sitewatch::config::AppConfig;
use sitewatch::event::ChangeEvent;
use sitewatch::rebuild::BuildLoop;
use sitewatch::reload::BrowserReloader;
use sitewatch::{watcher, web};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The main entry point for Sitewatch.
///
/// 1. Loads the application configuration from CLI, file, and environment.
/// 2. Initializes the tracing subscriber for logging.
/// 3. Starts the watcher, the web server (unless disabled), and the build loop.
/// 4. Runs until Ctrl-C, or until the build loop stops on a build failure
///    under the `exit` policy.
#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed");

    tracing::info!("Sitewatch starting with configuration: {:?}", app_config);

    if app_config.watch_paths.is_empty() {
        tracing::error!("No paths to watch. Please specify paths via CLI or in sitewatch.toml.");
        std::process::exit(1);
    }

    let builder = match CommandBuilder::new(&app_config.build_command) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Invalid build command: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Build command: {}", builder.command_line());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (change_tx, change_rx) = mpsc::channel::<ChangeEvent>(100);
    let reloader = BrowserReloader::default();

    let mut tasks = Vec::new();

    watcher::run_watcher(Arc::clone(&app_config), change_tx).await?;

    if app_config.serve {
        let web_config = Arc::clone(&app_config);
        let web_reloader = reloader.clone();
        let web_shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = web::start_server(web_config, web_reloader, web_shutdown_rx).await {
                tracing::error!("Web server exited with error: {}", e);
            }
        }));
    } else {
        tracing::info!("Site server disabled; builds will not reload any browser.");
    }

    let build_loop = Arc::new(
        BuildLoop::new(Arc::new(builder), Arc::new(reloader))
            .with_failure_policy(app_config.on_build_error),
    );
    let mut build_task = tokio::spawn(build_loop.run(change_rx, shutdown_rx.clone()));

    let build_outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Ctrl-C received, initiating shutdown..."),
                Err(err) => tracing::error!("Failed to listen for Ctrl-C signal: {}", err),
            }
            None
        }
        joined = &mut build_task => Some(joined),
    };

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }

    let build_result = match build_outcome {
        Some(joined) => joined,
        None => build_task.await,
    };

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A task panicked or exited with error: {}", e);
        }
    }

    match build_result {
        Ok(Ok(())) => {
            tracing::info!("Sitewatch shut down gracefully.");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("Build loop stopped: {:#}", e);
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("Build loop task failed: {}", e)),
    }
}
