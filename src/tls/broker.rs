//! Per-host certificate cache in front of the root CA

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::ca::{CertificateAuthority, IssuedCertificate};
use crate::error::{Error, Result};

type Slot = Arc<OnceCell<Arc<IssuedCertificate>>>;

/// Issues and caches one certificate per intercepted host.
///
/// Concurrent first requests for the same host share a single generation; later
/// requests are cache hits. Entries live until evicted.
#[derive(Clone)]
pub struct CertificateBroker {
    ca: Arc<CertificateAuthority>,
    cache: Arc<DashMap<String, Slot>>,
    validity_days: u32,
}

impl CertificateBroker {
    pub fn new(ca: Arc<CertificateAuthority>, validity_days: u32) -> Self {
        debug!("Creating certificate broker (leaf validity: {} days)", validity_days);
        Self {
            ca,
            cache: Arc::new(DashMap::new()),
            validity_days,
        }
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Certificate for `host`, generated on first use.
    ///
    /// `local_port` identifies the listener the lookup came through; it is recorded
    /// in the logs only, all listeners share one identity.
    pub async fn certificate_for(&self, host: &str, local_port: u16) -> Result<Arc<IssuedCertificate>> {
        let key = host.to_ascii_lowercase();
        let slot = self.cache.entry(key.clone()).or_default().clone();

        let ca = self.ca.clone();
        let validity_days = self.validity_days;
        let result = slot
            .get_or_try_init(|| async move {
                info!("📜 Issuing certificate for {} (listener port {})", key, local_port);
                let issued = tokio::task::spawn_blocking(move || ca.issue(&key, validity_days))
                    .await
                    .map_err(|e| Error::Certificate(format!("certificate task failed: {}", e)))??;
                Ok::<_, Error>(Arc::new(issued))
            })
            .await;

        match result {
            Ok(issued) => {
                debug!("Certificate for {} ready", host);
                Ok(issued.clone())
            }
            Err(e) => {
                warn!("⚠️  Failed to issue certificate for {}: {}", host, e);
                Err(e)
            }
        }
    }

    /// Drop the cached certificate for `host`. Returns whether one was cached.
    pub fn evict(&self, host: &str) -> bool {
        self.cache.remove(&host.to_ascii_lowercase()).is_some()
    }

    /// Number of hosts with a cached (or in-flight) certificate
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
