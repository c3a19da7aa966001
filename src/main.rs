use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use portcullis::cli::{self, Cli, Command, ConfigCommand};
use portcullis::config;
use portcullis::logging::{init_logging, LogConfig};
use portcullis::providers::ProviderRegistry;
use portcullis::server::ws::frames::CloseCause;
use portcullis::server::{run_server, ServerConfig};
use portcullis::state::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    match args.command {
        // No subcommand or explicit `start` both launch the gateway.
        None | Some(Command::Start) => start_gateway().await,

        Some(Command::Status { host, port }) => cli::handle_status(&host, port).await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Path => cli::handle_config_path(),
                ConfigCommand::Check => cli::handle_config_check()?,
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn start_gateway() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::default())?;

    let snapshot = config::read_config_snapshot();
    let Some(gateway_config) = snapshot.config else {
        error!(target: "gateway", path = %snapshot.path.display(), "config is invalid");
        for issue in &snapshot.issues {
            error!(target: "gateway", "config issue: {issue}");
        }
        return Err("invalid config".into());
    };
    for issue in &snapshot.issues {
        info!(target: "gateway", "config warning: {issue}");
    }

    let state = Arc::new(GatewayState::new(gateway_config));
    let handle = run_server(ServerConfig {
        state,
        config_path: snapshot.path,
        providers: Arc::new(ProviderRegistry::new()),
        spawn_background_tasks: true,
    })
    .await?;

    info!(
        target: "gateway",
        addr = %handle.local_addr(),
        version = env!("CARGO_PKG_VERSION"),
        "portcullis started"
    );

    wait_for_stop_signal().await;
    info!(target: "gateway", "stop signal received, shutting down");
    handle.shutdown(CloseCause::Normal).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(target: "gateway", "failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
