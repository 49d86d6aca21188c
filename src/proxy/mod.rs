//! Proxy server module

pub mod dialer;
pub mod exception;
pub mod io;
pub mod pending;
pub mod server;
pub mod session;
pub mod target;

// Re-exports
pub use dialer::UpstreamDialer;
pub use exception::{DefaultExceptionHandle, ExceptionHandle};
pub use io::{AsyncStream, BoxedStream, PrefixedIo};
pub use pending::{DialState, PendingFrameQueue, PendingUnit};
pub use server::ProxyListener;
pub use session::{ClientSession, SessionSettings, SessionState};
pub use target::TargetDescriptor;
