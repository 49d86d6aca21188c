//! Rust Intercept Proxy - an HTTP/HTTPS forward proxy with pluggable interception
//!
//! Clients talk HTTP/1.1 to the proxy. Plain requests are forwarded to their origin,
//! `CONNECT` tunnels are either relayed untouched or, with interception enabled,
//! decrypted with a certificate signed by the proxy's root CA. Every request and
//! response passes through a per-connection [`InterceptChain`] whose stages can
//! inspect, rewrite or answer messages; outbound connections can go through an
//! upstream HTTP or SOCKS proxy.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use intercept::{Intercept, InterceptChain, InterceptContext, InterceptInitializer};
pub use logging::{
    init_logger, init_logger_with_config, init_logger_with_env, log_debug, log_error, log_info, log_trace, log_warning,
};
pub use models::ExchangeLog;
pub use proxy::{ExceptionHandle, ProxyListener, UpstreamDialer};
pub use tls::CertificateBroker;

/// Runtime utilities for creating single-threaded vs multi-threaded Tokio runtimes
pub mod runtime {
    use crate::config::RuntimeConfig;
    use anyhow::{Context, Result};
    use tokio::runtime::{Builder, Runtime};

    /// Create a Tokio runtime based on the configuration
    pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
        match config.mode.as_str() {
            "single_threaded" => {
                tracing::info!("🧵 Initializing single-threaded runtime");
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create single-threaded runtime")
            }
            "multi_threaded" => {
                let mut builder = Builder::new_multi_thread();
                builder.enable_all();

                match config.worker_threads {
                    Some(threads) if threads > 0 => {
                        tracing::info!("🧵 Initializing multi-threaded runtime with {} worker threads", threads);
                        builder.worker_threads(threads);
                    }
                    _ => tracing::info!("🧵 Initializing multi-threaded runtime with auto-detected CPU cores"),
                }

                builder.build().context("Failed to create multi-threaded runtime")
            }
            _ => {
                tracing::warn!("⚠️  Unknown runtime mode '{}', defaulting to multi-threaded", config.mode);
                Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create default multi-threaded runtime")
            }
        }
    }

    /// Execute an async function with the configured runtime
    pub fn run_with_runtime<F, T>(config: &RuntimeConfig, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let runtime = create_runtime(config)?;
        runtime.block_on(future)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_single_threaded_runtime_runs_future() {
            let config = RuntimeConfig {
                mode: "single_threaded".to_string(),
                ..RuntimeConfig::default()
            };
            let value = run_with_runtime(&config, async { Ok(7) }).unwrap();
            assert_eq!(value, 7);
        }
    }
}
