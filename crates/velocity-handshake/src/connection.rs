//! Raw accepted connections and the bookkeeping that travels with them.
//!
//! A [`RawConnection`] is the single owner of an accepted socket until a
//! handshake engine turns it into a secure transport. It carries three things
//! across an engine handoff:
//! - the OS-level [`Descriptor`] identity, which must not change;
//! - bytes already read by an earlier engine, replayed before any new read;
//! - shared byte counters for the raw traffic on the wire.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Identity of the OS-level socket behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Snapshot of raw traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteCounts {
    pub received: u64,
    pub sent: u64,
}

/// Raw traffic counters shared by every owner of a connection.
#[derive(Debug, Default)]
pub struct ByteCounters {
    received: AtomicU64,
    sent: AtomicU64,
}

impl ByteCounters {
    pub fn snapshot(&self) -> ByteCounts {
        ByteCounts {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }

    fn add_received(&self, len: usize) {
        self.received.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn add_sent(&self, len: usize) {
        self.sent.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// An accepted, not-yet-secured connection.
///
/// Reads first drain the pre-received buffer and only then touch the
/// underlying I/O. Only bytes that cross the underlying I/O are counted, so
/// replayed bytes are never counted twice.
pub struct RawConnection<S> {
    io: S,
    descriptor: Descriptor,
    accepted_at: Instant,
    prereceived: Bytes,
    counters: Arc<ByteCounters>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S> RawConnection<S> {
    /// Wrap an accepted stream, stamping the accept time as now.
    pub fn new(io: S, descriptor: Descriptor) -> Self {
        Self {
            io,
            descriptor,
            accepted_at: Instant::now(),
            prereceived: Bytes::new(),
            counters: Arc::new(ByteCounters::default()),
            local_addr: None,
            peer_addr: None,
        }
    }

    /// Override the accept instant, e.g. when the listener stamped it earlier.
    pub fn with_accept_time(mut self, accepted_at: Instant) -> Self {
        self.accepted_at = accepted_at;
        self
    }

    /// Cache the socket addresses so they remain available if the handshake fails.
    pub fn with_addresses(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn byte_counts(&self) -> ByteCounts {
        self.counters.snapshot()
    }

    /// Shared handle on the traffic counters; it outlives ownership changes.
    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }

    /// Number of pre-received bytes not yet handed to a reader.
    pub fn prereceived_len(&self) -> usize {
        self.prereceived.len()
    }

    /// Queue `bytes` so the next reads observe them before anything else.
    ///
    /// Bytes already queued and not yet consumed stay behind the new ones.
    pub fn prepend_prereceived(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        if self.prereceived.is_empty() {
            self.prereceived = bytes;
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.prereceived.len());
        merged.extend_from_slice(&bytes);
        merged.extend_from_slice(&self.prereceived);
        self.prereceived = merged.freeze();
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Release the underlying stream along with any unread pre-received bytes.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.io, self.prereceived)
    }
}

impl RawConnection<TcpStream> {
    /// Wrap a freshly accepted TCP stream, caching its addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let descriptor = tcp_descriptor(&stream);
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        Self::new(stream, descriptor).with_addresses(local, peer)
    }
}

#[cfg(unix)]
fn tcp_descriptor(stream: &TcpStream) -> Descriptor {
    use std::os::fd::AsRawFd;
    Descriptor::new(stream.as_raw_fd() as u64)
}

#[cfg(windows)]
fn tcp_descriptor(stream: &TcpStream) -> Descriptor {
    use std::os::windows::io::AsRawSocket;
    Descriptor::new(stream.as_raw_socket())
}

#[cfg(not(any(unix, windows)))]
fn tcp_descriptor(_stream: &TcpStream) -> Descriptor {
    Descriptor::new(0)
}

impl<S> fmt::Debug for RawConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("descriptor", &self.descriptor)
            .field("peer_addr", &self.peer_addr)
            .field("prereceived", &self.prereceived.len())
            .field("counts", &self.counters.snapshot())
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RawConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prereceived.is_empty() {
            let len = this.prereceived.len().min(buf.remaining());
            buf.put_slice(&this.prereceived[..len]);
            this.prereceived.advance(len);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let res = Pin::new(&mut this.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.counters.add_received(buf.filled().len() - before);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RawConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.io).poll_write(cx, data);
        if let Poll::Ready(Ok(written)) = res {
            this.counters.add_sent(written);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
