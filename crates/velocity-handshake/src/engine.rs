use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::{Descriptor, RawConnection};
use crate::hello::{HelloError, SniffError};
use crate::info::SecurityType;

/// Read-only view of what a completed handshake negotiated.
pub trait NegotiatedTransport {
    fn application_protocol(&self) -> Option<String>;

    fn server_name(&self) -> Option<String> {
        None
    }

    /// Protocol-extension parameter agreed during the handshake, if any.
    fn negotiated_extension_param(&self) -> Option<u8> {
        None
    }

    fn protocol_version(&self) -> Option<String> {
        None
    }

    fn cipher_suite(&self) -> Option<String> {
        None
    }
}

/// Cause reported by an engine when its handshake cannot complete.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid client hello: {0}")]
    Hello(#[from] HelloError),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("descriptor changed across fallback: expected {expected}, found {actual}")]
    DescriptorMismatch {
        expected: Descriptor,
        actual: Descriptor,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::Protocol(msg.into())
    }

    /// True when the failure came from the transport rather than the handshake itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_) | EngineError::Timeout(_) | EngineError::DescriptorMismatch { .. }
        )
    }
}

impl From<io::Error> for EngineError {
    /// TLS stacks surface handshake failures as `io::Error`s wrapping a
    /// `rustls::Error`; unwrap those so they are not mistaken for I/O trouble.
    fn from(err: io::Error) -> Self {
        let wraps_tls = err
            .get_ref()
            .is_some_and(|inner| inner.is::<rustls::Error>());
        if wraps_tls {
            if let Some(inner) = err.into_inner() {
                if let Ok(tls) = inner.downcast::<rustls::Error>() {
                    return EngineError::Tls(*tls);
                }
            }
            return EngineError::Protocol("tls engine reported an unknown failure".into());
        }
        EngineError::Io(err)
    }
}

impl From<SniffError> for EngineError {
    fn from(err: SniffError) -> Self {
        match err {
            SniffError::Io(err) => err.into(),
            SniffError::Hello(err) => EngineError::Hello(err),
        }
    }
}

/// Terminal failure from an engine, handing back the connection when the
/// engine still owned it.
pub struct EngineFailure<S> {
    pub cause: EngineError,
    pub connection: Option<RawConnection<S>>,
}

impl<S> EngineFailure<S> {
    pub fn new(cause: impl Into<EngineError>, connection: RawConnection<S>) -> Self {
        Self {
            cause: cause.into(),
            connection: Some(connection),
        }
    }

    /// Failure after the engine already lost the connection.
    pub fn detached(cause: impl Into<EngineError>) -> Self {
        Self {
            cause: cause.into(),
            connection: None,
        }
    }
}

impl<S> fmt::Debug for EngineFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFailure")
            .field("cause", &self.cause)
            .field("connection", &self.connection)
            .finish()
    }
}

/// The modern engine found the client incompatible and gives the connection back.
///
/// `buffered` holds every byte the engine consumed from the client, in order.
pub struct FallbackRequest<S> {
    pub connection: RawConnection<S>,
    pub buffered: Bytes,
}

impl<S> fmt::Debug for FallbackRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRequest")
            .field("connection", &self.connection)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

/// Single notification produced by a modern handshake attempt.
pub enum ModernOutcome<T, S> {
    Success(T),
    Failure(EngineFailure<S>),
    Fallback(FallbackRequest<S>),
}

/// Single notification produced by a classic handshake attempt.
pub type ClassicOutcome<T, S> = Result<T, EngineFailure<S>>;

/// Engine that attempts the preferred handshake first.
///
/// `accept` takes ownership of the connection; the returned future resolving
/// is the engine's one and only notification.
pub trait ModernEngine<S>: Send + Sync {
    type Transport: NegotiatedTransport + Send + 'static;

    fn accept(
        &self,
        connection: RawConnection<S>,
    ) -> BoxFuture<'static, ModernOutcome<Self::Transport, S>>;
}

/// Engine that performs the compatibility handshake, replaying any
/// pre-received bytes queued on the connection.
pub trait ClassicEngine<S>: Send + Sync {
    type Transport: NegotiatedTransport + Send + 'static;

    fn accept(
        &self,
        connection: RawConnection<S>,
    ) -> BoxFuture<'static, ClassicOutcome<Self::Transport, S>>;
}

/// Secure transport produced by whichever engine completed.
#[derive(Debug)]
pub enum SecureTransport<M, C> {
    Modern(M),
    Classic(C),
}

impl<M, C> SecureTransport<M, C> {
    pub fn security_type(&self) -> SecurityType {
        match self {
            SecureTransport::Modern(_) => SecurityType::ModernTls,
            SecureTransport::Classic(_) => SecurityType::ClassicTls,
        }
    }
}

impl<T> SecureTransport<T, T> {
    /// Collapse into the inner transport when both paths share a type.
    pub fn into_inner(self) -> T {
        match self {
            SecureTransport::Modern(inner) | SecureTransport::Classic(inner) => inner,
        }
    }
}

impl<M, C> NegotiatedTransport for SecureTransport<M, C>
where
    M: NegotiatedTransport,
    C: NegotiatedTransport,
{
    fn application_protocol(&self) -> Option<String> {
        match self {
            SecureTransport::Modern(inner) => inner.application_protocol(),
            SecureTransport::Classic(inner) => inner.application_protocol(),
        }
    }

    fn server_name(&self) -> Option<String> {
        match self {
            SecureTransport::Modern(inner) => inner.server_name(),
            SecureTransport::Classic(inner) => inner.server_name(),
        }
    }

    fn negotiated_extension_param(&self) -> Option<u8> {
        match self {
            SecureTransport::Modern(inner) => inner.negotiated_extension_param(),
            SecureTransport::Classic(_) => None,
        }
    }

    fn protocol_version(&self) -> Option<String> {
        match self {
            SecureTransport::Modern(inner) => inner.protocol_version(),
            SecureTransport::Classic(inner) => inner.protocol_version(),
        }
    }

    fn cipher_suite(&self) -> Option<String> {
        match self {
            SecureTransport::Modern(inner) => inner.cipher_suite(),
            SecureTransport::Classic(inner) => inner.cipher_suite(),
        }
    }
}

impl<M, C> AsyncRead for SecureTransport<M, C>
where
    M: AsyncRead + Unpin,
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureTransport::Modern(inner) => Pin::new(inner).poll_read(cx, buf),
            SecureTransport::Classic(inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl<M, C> AsyncWrite for SecureTransport<M, C>
where
    M: AsyncWrite + Unpin,
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureTransport::Modern(inner) => Pin::new(inner).poll_write(cx, data),
            SecureTransport::Classic(inner) => Pin::new(inner).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureTransport::Modern(inner) => Pin::new(inner).poll_flush(cx),
            SecureTransport::Classic(inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureTransport::Modern(inner) => Pin::new(inner).poll_shutdown(cx),
            SecureTransport::Classic(inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_tls_errors_from_io() {
        let io_err = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        let err = EngineError::from(io_err);
        assert!(matches!(err, EngineError::Tls(rustls::Error::DecryptError)));
        assert!(!err.is_transport());
    }

    #[test]
    fn plain_io_errors_are_transport() {
        let err = EngineError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.is_transport());
        assert!(EngineError::Timeout(Duration::from_secs(1)).is_transport());
    }

    #[test]
    fn hello_errors_are_handshake_failures() {
        let err = EngineError::from(SniffError::Hello(HelloError::Truncated));
        assert!(matches!(err, EngineError::Hello(HelloError::Truncated)));
        assert!(!err.is_transport());
    }
}
