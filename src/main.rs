//! Main entry point for the Rust Intercept Proxy

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_intercept_proxy::{
    cli::{start_server, CertCommand, ServerArgs},
    init_logger_with_config, log_error, log_info,
    runtime::run_with_runtime,
    ProxyConfig,
};

#[derive(Parser)]
#[command(name = "rust-intercept-proxy")]
#[command(about = "An HTTP/HTTPS forward proxy with pluggable request and response interception")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    #[command(name = "server")]
    Server(ServerArgs),

    /// Certificate management commands
    #[command(name = "cert")]
    #[command(subcommand)]
    Cert(CertCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match server_config(&cli.command) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level
            .clone()
            .or_else(|| config.as_ref().map(|c| c.log_level.clone()))
            .unwrap_or_else(|| "info".to_string())
    };
    init_logger_with_config(&level);

    let runtime_config = config.as_ref().map(|c| c.runtime.clone()).unwrap_or_default();
    run_with_runtime(&runtime_config, async_main(cli, config))
}

/// Configuration for the `server` command; certificate commands never read it
fn server_config(command: &Option<Commands>) -> anyhow::Result<Option<ProxyConfig>> {
    match command {
        Some(Commands::Cert(_)) => Ok(None),
        Some(Commands::Server(args)) => args.to_config().map(Some),
        None => ServerArgs::default().to_config().map(Some),
    }
}

async fn async_main(cli: Cli, config: Option<ProxyConfig>) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Cert(cert_cmd)) => {
            if let Err(e) = cert_cmd.execute().await {
                log_error!("Certificate operation failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Server(_)) | None => {
            let config = config.context("server configuration was not loaded")?;
            log_info!("🚀 Starting Rust Intercept Proxy");
            log_info!("📋 Version: {}", env!("CARGO_PKG_VERSION"));
            log_info!("Test with: curl -x http://{} http://httpbin.org/get", config.listen_addr);

            if let Err(e) = start_server(config).await {
                log_error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_commands_skip_server_config() {
        let cli = Cli::try_parse_from([
            "rust-intercept-proxy",
            "cert",
            "inspect",
            "--cert-path",
            "/tmp/root.crt",
        ])
        .unwrap();
        assert!(server_config(&cli.command).unwrap().is_none());
    }

    #[test]
    fn test_server_reports_broken_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "listen_addr: [not, an, address]\n").unwrap();

        let cli = Cli::try_parse_from([
            "rust-intercept-proxy",
            "server",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        assert!(server_config(&cli.command).is_err());
    }
}
