//! Server management CLI commands

use crate::config::{ProxyConfig, UpstreamProxyConfig};
use crate::intercept::{InterceptChain, LoggingIntercept};
use crate::proxy::ProxyListener;
use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Args, Default)]
pub struct ServerArgs {
    /// Configuration file (defaults to ./config.yml when present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Proxy listening address
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Upstream proxy URL (http://, socks4://, socks5://, credentials allowed)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Enable HTTPS interception
    #[arg(long)]
    pub mitm: bool,

    /// Root CA certificate file path
    #[arg(long)]
    pub ca_cert: Option<String>,

    /// Root CA private key file path
    #[arg(long)]
    pub ca_key: Option<String>,

    /// Skip upstream certificate verification (insecure)
    #[arg(long)]
    pub skip_cert_verify: bool,

    /// Upstream connect timeout in seconds (0 disables it)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Maximum aggregated body size in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,
}

impl ServerArgs {
    /// Load the configuration file and apply command line overrides on top
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::load_config(self.config.as_deref())?;
        self.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut ProxyConfig) -> Result<()> {
        debug!("Applying CLI overrides to ProxyConfig");

        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid listen address '{}'", addr))?;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream_proxy = Some(UpstreamProxyConfig::from_url(upstream)?);
        }
        if self.mitm {
            config.mitm.enabled = true;
        }
        if let Some(path) = &self.ca_cert {
            config.mitm.ca_cert_path = path.clone();
        }
        if let Some(path) = &self.ca_key {
            config.mitm.ca_key_path = path.clone();
        }
        if self.skip_cert_verify {
            config.mitm.skip_upstream_cert_verify = true;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout_secs = timeout;
        }
        if let Some(max) = self.max_body_size {
            config.full_object.max_body_size = max;
        }
        Ok(())
    }
}

/// Run the proxy with the built-in logging stage installed
pub async fn start_server(config: ProxyConfig) -> Result<()> {
    info!("📋 Server Configuration:");
    info!("   Listen: {}", config.listen_addr);
    match &config.upstream_proxy {
        Some(upstream) => info!("   Upstream: {:?} proxy {}", upstream.kind, upstream.authority()),
        None => info!("   Upstream: direct"),
    }
    if config.mitm.enabled {
        info!("   Interception: enabled");
        info!("   Root CA: {}", config.mitm.ca_cert_path);
    } else {
        info!("   Interception: disabled");
    }
    info!("   Connect timeout: {}s", config.connect_timeout_secs);
    info!("   Max body size: {} bytes", config.full_object.max_body_size);

    let initializer = Arc::new(|chain: &mut InterceptChain| chain.add_last(LoggingIntercept::new()));
    let listener = ProxyListener::from_config(&config, initializer)?;
    let bound = listener.bind()?;

    listener
        .serve(bound, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Received Ctrl+C");
            }
        })
        .await?;
    Ok(())
}
