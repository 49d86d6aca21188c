//! Configuration loading

pub mod settings;

pub use settings::{FullObjectConfig, MitmConfig, ProxyConfig, RuntimeConfig, UpstreamProxyConfig, UpstreamProxyKind};
