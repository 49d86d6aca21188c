use std::net::SocketAddr;

use super::target::TargetDescriptor;
use crate::error::{Error, Result};

/// Hooks invoked when a client session fails.
///
/// `before_catch` covers failures before an upstream link exists (dial errors,
/// certificate failures, client I/O); `after_catch` covers failures once both
/// sides are connected. Returning `Ok(())` swallows the error and the session
/// closes quietly; the default hands the cause back to the listener.
pub trait ExceptionHandle: Send + Sync {
    fn before_catch(&self, _client: SocketAddr, cause: Error) -> Result<()> {
        Err(cause)
    }

    fn after_catch(&self, _client: SocketAddr, _upstream: &TargetDescriptor, cause: Error) -> Result<()> {
        Err(cause)
    }
}

pub struct DefaultExceptionHandle;

impl ExceptionHandle for DefaultExceptionHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Swallow;

    impl ExceptionHandle for Swallow {
        fn before_catch(&self, _client: SocketAddr, _cause: Error) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_reraises() {
        let client: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let upstream = TargetDescriptor::new("origin.test", 80, false);
        let handle = DefaultExceptionHandle;
        assert!(matches!(
            handle.before_catch(client, Error::UpstreamConnection("refused".into())),
            Err(Error::UpstreamConnection(_))
        ));
        assert!(handle.after_catch(client, &upstream, Error::Intercept("boom".into())).is_err());
    }

    #[test]
    fn test_custom_handle_can_swallow() {
        let client: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(Swallow.before_catch(client, Error::Unknown("x".into())).is_ok());
        let upstream = TargetDescriptor::new("origin.test", 80, false);
        assert!(Swallow.after_catch(client, &upstream, Error::Unknown("x".into())).is_err());
    }
}
