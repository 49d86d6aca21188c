//! Proxy listener: accepts client connections and hands each one to a session

use socket2::{Domain, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::exception::{DefaultExceptionHandle, ExceptionHandle};
use super::session::{ClientSession, SessionSettings};
use super::UpstreamDialer;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::intercept::InterceptInitializer;
use crate::tls::{CertificateAuthority, CertificateBroker};
use crate::{log_debug, log_error, log_info, log_warning};

/// Create a listening socket with SO_REUSEADDR and, if requested, SO_REUSEPORT
fn create_reusable_socket(addr: SocketAddr, use_reuseport: bool) -> Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;

    if use_reuseport {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            socket.set_reuse_port(true)?;
            log_info!("✅ SO_REUSEPORT enabled");
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            log_warning!("⚠️  SO_REUSEPORT requested but not supported on this platform");
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket)
}

pub struct ProxyListener {
    listen_addr: SocketAddr,
    use_reuseport: bool,
    settings: SessionSettings,
}

impl ProxyListener {
    pub fn new(listen_addr: SocketAddr, settings: SessionSettings) -> Self {
        Self {
            listen_addr,
            use_reuseport: false,
            settings,
        }
    }

    /// Listener wired from the configuration file: upstream dialer, and a
    /// certificate broker over the configured root CA when interception is enabled.
    pub fn from_config(config: &ProxyConfig, initializer: Arc<dyn InterceptInitializer>) -> Result<Self> {
        let dialer = UpstreamDialer::from_config(config)?;

        let broker = if config.mitm.enabled {
            let ca = CertificateAuthority::load_or_generate(&config.mitm)?;
            log_info!("🔐 HTTPS interception enabled");
            Some(CertificateBroker::new(Arc::new(ca), config.mitm.leaf_validity_days))
        } else {
            log_info!("🚇 HTTPS interception disabled, CONNECT tunnels are relayed as is");
            None
        };

        let settings = SessionSettings {
            dialer,
            broker,
            initializer,
            exception: Arc::new(DefaultExceptionHandle),
            max_body_size: config.full_object.max_body_size,
        };
        Ok(Self::new(config.listen_addr, settings).with_reuseport(config.runtime.use_reuseport))
    }

    pub fn with_reuseport(mut self, use_reuseport: bool) -> Self {
        self.use_reuseport = use_reuseport;
        self
    }

    pub fn with_exception_handle(mut self, exception: Arc<dyn ExceptionHandle>) -> Self {
        self.settings.exception = exception;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Bind the listening socket without accepting yet
    pub fn bind(&self) -> Result<TcpListener> {
        let socket = create_reusable_socket(self.listen_addr, self.use_reuseport)?;
        let listener = TcpListener::from_std(socket.into())?;
        log_info!("🚀 Proxy listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the process is stopped
    pub async fn start(self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, std::future::pending::<()>()).await
    }

    /// Accept connections on `listener` until `shutdown` completes.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_port = listener.local_addr()?.port();
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown => {
                    log_info!("🛑 Listener on port {} shutting down", local_port);
                    return Ok(());
                }
            };

            let (stream, client_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log_error!("Accept error: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                log_warning!("Could not set TCP_NODELAY for {}: {}", client_addr, e);
            }
            log_debug!("New connection from: {}", client_addr);

            let settings = self.settings.clone();
            tokio::spawn(async move {
                let session = ClientSession::new(settings, Box::new(stream), client_addr, local_port);
                match session.run().await {
                    Ok(()) => log_debug!("Connection from {} closed", client_addr),
                    Err(e) if e.is_disconnect() => log_debug!("Connection from {} dropped: {}", client_addr, e),
                    Err(e) => log_error!("❌ Connection from {} failed: {}", client_addr, e),
                }
            });
        }
    }
}
