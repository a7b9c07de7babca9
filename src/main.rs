//! Charbot CLI entry point.

use anyhow::Context as _;
use charbot::messaging::ChatPlatform;
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "charbot")]
#[command(about = "A persona-driven Discord chat bot backed by an OpenAI-compatible API")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting charbot...");

    let config = if let Some(config_path) = cli.config {
        charbot::config::Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        charbot::config::Config::load().with_context(|| "failed to load configuration")?
    };
    let config = Arc::new(config);

    tracing::info!(model = %config.llm.model, "Configuration loaded");

    let personas = Arc::new(
        charbot::persona::PersonaLibrary::load(
            config.personas.dir.clone(),
            config.personas.default_persona.clone(),
        )
        .await
        .with_context(|| "failed to load persona library")?,
    );

    let executor = Arc::new(
        charbot::llm::CompletionExecutor::new(config.llm.clone(), &config.rate, &config.health)
            .with_context(|| "failed to initialize completion executor")?,
    );

    let gate = Arc::new(charbot::dispatch::DispatchGate::new(&config.limits));
    let platform = Arc::new(charbot::messaging::DiscordPlatform::new(&config.discord));

    let bot = Arc::new(charbot::bot::Bot::new(
        platform.clone(),
        executor.clone(),
        gate.clone(),
        personas,
        config,
    ));

    // Background loops stop when this flips to true.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let executor = executor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { executor.run_health_monitor(shutdown).await });
    }
    {
        let gate = gate.clone();
        let shutdown = shutdown_rx;
        tokio::spawn(async move { gate.run_reaper(shutdown).await });
    }

    let mut inbound = platform
        .start()
        .await
        .with_context(|| "failed to connect to Discord")?;

    tracing::info!("charbot started successfully");

    loop {
        tokio::select! {
            maybe_message = inbound.next() => match maybe_message {
                Some(message) => {
                    tokio::spawn(bot.clone().handle_message(message));
                }
                None => {
                    tracing::warn!("inbound stream ended");
                    break;
                }
            },
            () = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    bot.shutdown().await;

    tracing::info!("charbot stopped");
    Ok(())
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
