//! `lodestone` binary entry point.
//!
//! Parses arguments, initializes logging, loads configuration and runs one
//! command. Ctrl-C cancels the running operation.

use anyhow::Result;
use clap::Parser;
use lodestone_cli::{App, AppConfig, Cli, LogFormat};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_format);

    let config = AppConfig::load(cli.global.config.as_deref(), &cli.global.overrides(None))?;
    tracing::debug!(
        store = %config.cas.root.display(),
        data = %config.content.data_root.display(),
        workspaces = %config.workspace.root.display(),
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let timeout = cli.global.timeout.map(Duration::from_secs);
    let app = App::open(&config, cli.global.format, cancel, timeout)?;
    app.run(cli.command).await
}
