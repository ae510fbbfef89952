use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use parley_assistant::setup::prepare_assistant;
use parley_assistant::OpenAiAssistants;
use parley_bridge::Bridge;
use parley_core::config::ParleyConfig;
use parley_telegram::TelegramClient;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Telegram bot bridged to an OpenAI assistant")]
struct Cli {
    /// Verbose logging and a periodic state report.
    #[arg(short, long)]
    debug: bool,

    /// Upload the reference files and enable file search.
    #[arg(short, long)]
    files: bool,

    /// Config file (default: $PARLEY_CONFIG or ./parley.toml).
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "parley=debug" } else { "parley=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // config: --config > PARLEY_CONFIG env > ./parley.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("PARLEY_CONFIG").ok());
    let config = match ParleyConfig::load(config_path.as_deref())
        .and_then(|config| config.validate().map(|()| config))
    {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.code(), error = %e, "invalid configuration");
            return Err(e.into());
        }
    };

    let proxy = config.network.proxy.as_deref();
    let platform = Arc::new(TelegramClient::new(
        &config.telegram.bot_token,
        config.telegram.poll_timeout(),
        proxy,
    )?);
    let backend = Arc::new(OpenAiAssistants::new(&config.assistant, proxy)?);

    let ingest_files = cli.files || config.assistant.ingest_files;
    let assistant_id = prepare_assistant(&backend, &config.assistant, ingest_files).await?;

    let report = Bridge::new(platform, backend, assistant_id, config)
        .with_state_log(cli.debug)
        .run(shutdown_signal())
        .await?;
    if report.graceful {
        info!("parley stopped");
    } else {
        warn!(aborted = report.aborted, remaining = ?report.remaining, "parley stopped after grace period");
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
