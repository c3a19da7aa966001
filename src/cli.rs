//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the gateway server
//! - `status` -- query a running instance's health endpoint
//! - `config path|check` -- locate and validate the config file
//! - `version` -- print version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config;

/// Personal-assistant gateway.
#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version = env!("CARGO_PKG_VERSION"),
    about = "Portcullis — personal-assistant gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Query a running instance for health/status information.
    Status {
        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port of the running instance (default: from config).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Locate or validate the config file.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the config file path.
    Path,

    /// Parse and validate the config file, printing any issues.
    Check,
}

pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run `config check`: parse and validate, listing every issue found.
/// Returns an error (nonzero exit) when the config is unusable.
pub fn handle_config_check() -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = config::read_config_snapshot();
    println!("Config: {}", snapshot.path.display());
    if snapshot.valid {
        println!("OK");
        return Ok(());
    }
    for issue in &snapshot.issues {
        println!("  issue: {issue}");
    }
    Err("config is invalid".into())
}

/// Resolve the status port: explicit flag first, then the config file,
/// then the built-in default.
fn resolve_port(port: Option<u16>) -> u16 {
    if let Some(port) = port {
        return port;
    }
    let snapshot = config::read_config_snapshot();
    snapshot
        .config
        .map(|c| c.gateway.port)
        .unwrap_or_else(|| config::schema::GatewayConfig::default().gateway.port)
}

/// Run the `status` subcommand against a running instance's health endpoint.
pub async fn handle_status(host: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{host}:{port}/health");

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to portcullis at {host}:{port}");
            eprintln!("  Error: {e}");
            eprintln!();
            eprintln!("Is the server running? Start it with: portcullis start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;

    println!("Portcullis gateway status");
    println!("=========================");
    if let Some(version) = body["server"]["version"].as_str() {
        println!("  Version:     {version}");
    }
    println!("  Address:     {host}:{port}");
    if let Some(status) = body["status"].as_str() {
        println!("  Status:      {status}");
    }
    if let Some(uptime) = body["uptimeMs"].as_u64() {
        println!("  Uptime:      {}", format_duration(uptime / 1000));
    }
    if let Some(connections) = body["connections"].as_u64() {
        println!("  Connections: {connections}");
    }
    if let Some(nodes) = body["nodes"].as_u64() {
        println!("  Nodes:       {nodes}");
    }
    Ok(())
}

pub fn handle_version() {
    println!("portcullis {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn format_duration(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
        assert_eq!(format_duration(90_061), "1d 1h 1m");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["portcullis"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["portcullis", "status", "--port", "4242"]);
        match cli.command {
            Some(Command::Status { host, port }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, Some(4242));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["portcullis", "config", "check"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Check))
        ));
    }
}
