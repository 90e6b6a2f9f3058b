//! Stream and listener wrappers that consume PROXY protocol headers.
//!
//! [`ProxyStream`] wraps a raw stream and consumes the header lazily, on the
//! first read: bytes are staged in an internal buffer until a full header is
//! parsed, the configured [`Policy`] is applied, and everything past the
//! header is handed out unchanged. The staging buffer and the post-header
//! buffer are one and the same, so a segment carrying `header + partial
//! payload` never loses the payload bytes.
//!
//! If the stream does not start with a PROXY protocol signature, the staged
//! bytes are served as ordinary payload; wrapping a non-PROXY client is
//! harmless unless the policy is [`Policy::Require`].
//!
//! [`Listener`] wraps a [`tokio::net::TcpListener`], retries transient accept
//! errors with exponential backoff and evaluates a trust policy against each
//! peer before handing out a wrapped stream.
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use proxy_wrap::io::Listener;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let listener = Listener::new(tokio::net::TcpListener::bind("[::]:1234").await?);
//!
//! loop {
//!     let mut stream = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut buf = vec![0; 1024];
//!         loop {
//!             // The first read consumes the header; the original client
//!             // address is available afterwards.
//!             let n = stream.read(&mut buf).await.unwrap();
//!             if n == 0 {
//!                 return;
//!             }
//!             println!("from {:?}: {} bytes", stream.proxied_source(), n);
//!             stream.write_all(&buf[0..n]).await.unwrap();
//!         }
//!     });
//! }
//! # }
//! ```

use std::io::{self, BufRead, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

#[cfg(any(unix, target_os = "wasi"))]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

#[cfg(feature = "tokio")]
use std::future::Future;
#[cfg(feature = "tokio")]
use std::pin::Pin;
#[cfg(feature = "tokio")]
use std::task::{ready, Context, Poll};

#[cfg(feature = "tokio")]
use pin_project_lite::pin_project;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
#[cfg(feature = "tokio")]
use tokio::net::{TcpListener, TcpStream};
#[cfg(feature = "tokio")]
use tokio::time::Sleep;

#[cfg(feature = "tokio")]
use crate::policy::{ConnInfo, ConnPolicyFn, PolicyFn};
use crate::{Error, Header, ParseConfig, Policy};

/// Bound on how long a connection may take to deliver its header before the
/// first read fails, unless overridden.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(feature = "tokio")]
const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
#[cfg(feature = "tokio")]
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

const STAGING_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy)]
enum HeaderState {
    /// Header not yet consumed; staged bytes live in `buf`.
    Reading,
    /// Header phase over; `buf` holds post-header bytes.
    Done,
    /// Header phase failed; the stream is unusable.
    Failed(Error),
}

#[cfg(feature = "tokio")]
pin_project! {
    /// Wrapper around a stream that may start with a PROXY protocol header.
    ///
    /// See the [module level documentation](`crate::io`).
    #[derive(Debug)]
    pub struct ProxyStream<IO> {
        #[pin]
        io: IO,
        buf: Vec<u8>,
        header: Option<Header>,
        state: HeaderState,
        policy: Policy,
        config: ParseConfig,
        timeout: Option<Duration>,
        deadline: Option<Pin<Box<Sleep>>>,
    }
}

/// Wrapper around a stream that may start with a PROXY protocol header.
///
/// See the [module level documentation](`crate::io`).
#[cfg(not(feature = "tokio"))]
#[derive(Debug)]
pub struct ProxyStream<IO> {
    io: IO,
    buf: Vec<u8>,
    header: Option<Header>,
    state: HeaderState,
    policy: Policy,
    config: ParseConfig,
}

impl<IO> ProxyStream<IO> {
    /// Wrap a stream with the default [`Policy::Use`]: a header, if present,
    /// is consumed and its addresses are honored.
    pub fn new(io: IO) -> Self {
        Self::with_policy(io, Policy::Use)
    }

    /// Wrap a stream with an explicit policy.
    pub fn with_policy(io: IO, policy: Policy) -> Self {
        let state = if policy == Policy::Skip {
            HeaderState::Done
        } else {
            HeaderState::Reading
        };

        #[cfg(feature = "tokio")]
        return ProxyStream {
            io,
            buf: Vec::new(),
            header: None,
            state,
            policy,
            config: ParseConfig::default(),
            timeout: Some(DEFAULT_READ_HEADER_TIMEOUT),
            deadline: None,
        };

        #[cfg(not(feature = "tokio"))]
        return ProxyStream {
            io,
            buf: Vec::new(),
            header: None,
            state,
            policy,
            config: ParseConfig::default(),
        };
    }

    /// Wrap a stream that does not speak the PROXY protocol, without ever
    /// looking for a header.
    ///
    /// Useful when proxied and direct connections share one stream type.
    pub fn passthrough(io: IO) -> Self {
        Self::with_policy(io, Policy::Skip)
    }

    /// True if this stream was wrapped with [`Policy::Skip`] and exposes the
    /// raw byte stream.
    pub fn is_passthrough(&self) -> bool {
        self.policy == Policy::Skip
    }

    /// The policy this stream was wrapped with.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_parse_config(&mut self, config: ParseConfig) {
        self.config = config;
    }

    /// Bound the time the peer may take to deliver its header, measured from
    /// the first read. `None` disables the bound.
    ///
    /// When the timer fires, the read fails with [`io::ErrorKind::TimedOut`]
    /// (source [`Error::NoProxyProtocol`]) and the stream is left in an
    /// undefined state; it should be dropped.
    #[cfg(feature = "tokio")]
    pub fn set_read_header_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The parsed header, if one has been consumed and kept.
    ///
    /// `None` until the first read (or [`ProxyStream::read_header`]) has
    /// completed, when the peer sent no header, or when the policy was
    /// [`Policy::Ignore`].
    pub fn proxy_header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Original source address carried by the header, if any.
    ///
    /// `None` for `LOCAL` headers, Unix address families, absent headers and
    /// ignored headers; callers should fall back to the socket's peer
    /// address.
    pub fn proxied_source(&self) -> Option<SocketAddr> {
        self.header.as_ref().and_then(|h| h.addresses.source())
    }

    /// Original destination address carried by the header, if any.
    pub fn proxied_destination(&self) -> Option<SocketAddr> {
        self.header.as_ref().and_then(|h| h.addresses.destination())
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    /// Gets a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Gets a pinned mutable reference to the underlying stream.
    #[cfg(feature = "tokio")]
    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut IO> {
        self.project().io
    }

    /// Consumes this wrapper, returning the underlying stream.
    ///
    /// Bytes already pulled into the staging buffer are lost.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl ProxyStream<std::net::TcpStream> {
    /// The peer address: the header's source when one was consumed and
    /// carries addresses, the socket's peer address otherwise.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        match self.proxied_source() {
            Some(addr) => Ok(addr),
            None => self.io.peer_addr(),
        }
    }

    /// The local address: the header's destination when one was consumed and
    /// carries addresses, the socket's local address otherwise.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.proxied_destination() {
            Some(addr) => Ok(addr),
            None => self.io.local_addr(),
        }
    }
}

#[cfg(feature = "tokio")]
impl ProxyStream<TcpStream> {
    /// The peer address: the header's source when one was consumed and
    /// carries addresses, the socket's peer address otherwise.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        match self.proxied_source() {
            Some(addr) => Ok(addr),
            None => self.io.peer_addr(),
        }
    }

    /// The local address: the header's destination when one was consumed and
    /// carries addresses, the socket's local address otherwise.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.proxied_destination() {
            Some(addr) => Ok(addr),
            None => self.io.local_addr(),
        }
    }
}

/// Outcome of one parse attempt over the staged bytes.
enum Consume {
    /// More bytes are needed.
    More,
    /// Header phase finished; the header is kept if the policy says so.
    Done(Option<Header>),
}

fn try_consume(buf: &mut Vec<u8>, config: &ParseConfig, policy: Policy) -> Result<Consume, Error> {
    match Header::parse(buf, *config) {
        Ok((header, consumed)) => {
            buf.drain(..consumed);
            match policy {
                Policy::Reject => Err(Error::SuperfluousProxyHeader),
                Policy::Ignore => Ok(Consume::Done(None)),
                _ => Ok(Consume::Done(Some(header))),
            }
        }
        Err(Error::Incomplete) => Ok(Consume::More),
        Err(Error::NoProxyProtocol) if policy != Policy::Require => Ok(Consume::Done(None)),
        Err(err) => Err(err),
    }
}

/// Maps end-of-stream during the header phase onto the stage it interrupted.
fn eof_error(buf: &[u8], policy: Policy) -> Option<Error> {
    match buf.first() {
        None => (policy == Policy::Require).then_some(Error::NoProxyProtocol),
        Some(&b'P') => Some(Error::TruncatedV1Header),
        Some(&0x0D) if buf.len() < 16 => Some(Error::TruncatedV2Header),
        Some(&0x0D) => Some(Error::InvalidLength),
        Some(_) => Some(Error::NoProxyProtocol),
    }
}

fn codec_error(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl<IO: Read> ProxyStream<IO> {
    fn fill_header(&mut self) -> io::Result<()> {
        loop {
            match self.state {
                HeaderState::Done => return Ok(()),
                HeaderState::Failed(err) => return Err(codec_error(err)),
                HeaderState::Reading => {}
            }

            match try_consume(&mut self.buf, &self.config, self.policy) {
                Ok(Consume::Done(header)) => {
                    self.header = header;
                    self.state = HeaderState::Done;
                }
                Ok(Consume::More) => {
                    let mut chunk = [0u8; STAGING_CHUNK];
                    let n = self.io.read(&mut chunk)?;
                    if n == 0 {
                        match eof_error(&self.buf, self.policy) {
                            Some(err) => {
                                self.state = HeaderState::Failed(err);
                                return Err(codec_error(err));
                            }
                            None => self.state = HeaderState::Done,
                        }
                    } else {
                        self.buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(err) => {
                    self.state = HeaderState::Failed(err);
                    return Err(codec_error(err));
                }
            }
        }
    }
}

impl<IO: Read> Read for ProxyStream<IO> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.fill_header()?;

        if !self.buf.is_empty() {
            let len = self.buf.len().min(out.len());
            out[..len].copy_from_slice(&self.buf[..len]);
            self.buf.drain(..len);
            return Ok(len);
        }

        self.io.read(out)
    }
}

impl<IO: BufRead> BufRead for ProxyStream<IO> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.fill_header()?;

        if !self.buf.is_empty() {
            return Ok(&self.buf);
        }
        self.io.fill_buf()
    }

    fn consume(&mut self, mut amt: usize) {
        let n = self.buf.len().min(amt);
        self.buf.drain(..n);
        amt -= n;
        if amt > 0 {
            self.io.consume(amt);
        }
    }
}

impl<IO: Write> Write for ProxyStream<IO> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(buf)
    }

    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.io.write_vectored(bufs)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

#[cfg(feature = "tokio")]
impl<IO: AsyncRead> ProxyStream<IO> {
    fn poll_fill_header(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            match this.state {
                HeaderState::Done => return Poll::Ready(Ok(())),
                HeaderState::Failed(err) => return Poll::Ready(Err(codec_error(*err))),
                HeaderState::Reading => {}
            }

            // The timer starts at the first read, not at wrap time.
            if this.deadline.is_none() {
                if let Some(timeout) = *this.timeout {
                    *this.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
                }
            }
            if let Some(deadline) = this.deadline.as_mut() {
                if deadline.as_mut().poll(cx).is_ready() {
                    *this.state = HeaderState::Failed(Error::NoProxyProtocol);
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        Error::NoProxyProtocol,
                    )));
                }
            }

            match try_consume(this.buf, this.config, *this.policy) {
                Ok(Consume::Done(header)) => {
                    *this.header = header;
                    *this.state = HeaderState::Done;
                }
                Ok(Consume::More) => {
                    let mut chunk = [0u8; STAGING_CHUNK];
                    let mut read_buf = ReadBuf::new(&mut chunk);
                    ready!(this.io.as_mut().poll_read(cx, &mut read_buf))?;

                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        match eof_error(this.buf, *this.policy) {
                            Some(err) => {
                                *this.state = HeaderState::Failed(err);
                                return Poll::Ready(Err(codec_error(err)));
                            }
                            None => *this.state = HeaderState::Done,
                        }
                    } else {
                        this.buf.extend_from_slice(filled);
                    }
                }
                Err(err) => {
                    *this.state = HeaderState::Failed(err);
                    return Poll::Ready(Err(codec_error(err)));
                }
            }
        }
    }

    /// Force header consumption without reading any payload.
    ///
    /// Consuming is idempotent: whichever of `read_header` and the first read
    /// happens first runs the parser, the other observes the stored outcome.
    /// Returns the header if one was consumed and kept.
    pub async fn read_header(&mut self) -> io::Result<Option<&Header>>
    where
        IO: Unpin,
    {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_fill_header(cx)).await?;
        Ok(self.header.as_ref())
    }
}

#[cfg(feature = "tokio")]
impl<IO: AsyncRead> AsyncRead for ProxyStream<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_fill_header(cx))?;

        let this = self.project();
        if !this.buf.is_empty() {
            let len = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..len]);
            this.buf.drain(..len);
            return Poll::Ready(Ok(()));
        }

        this.io.poll_read(cx, out)
    }
}

#[cfg(feature = "tokio")]
impl<IO: AsyncWrite> AsyncWrite for ProxyStream<IO> {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    #[inline]
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(any(unix, target_os = "wasi"))]
impl<IO: AsRawFd> AsRawFd for ProxyStream<IO> {
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

#[cfg(any(unix, target_os = "wasi"))]
impl<IO: AsFd> AsFd for ProxyStream<IO> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.as_fd()
    }
}

/// Wrapper around a [`tokio::net::TcpListener`] whose connections may carry a
/// PROXY protocol header.
///
/// Each accepted connection is classified by a per-address policy or a
/// per-connection policy (at most one of the two may be installed) and comes
/// back wrapped in a [`ProxyStream`], or raw when the policy is
/// [`Policy::Skip`].
#[cfg(feature = "tokio")]
pub struct Listener {
    inner: TcpListener,
    policy: Option<Box<PolicyFn>>,
    conn_policy: Option<Box<ConnPolicyFn>>,
    read_header_timeout: Option<Duration>,
    config: ParseConfig,
}

#[cfg(feature = "tokio")]
impl Listener {
    pub fn new(inner: TcpListener) -> Self {
        Listener {
            inner,
            policy: None,
            conn_policy: None,
            read_header_timeout: Some(DEFAULT_READ_HEADER_TIMEOUT),
            config: ParseConfig::default(),
        }
    }

    /// Install a per-address policy, consulted with the peer address of every
    /// accepted connection.
    ///
    /// # Panics
    /// Panics if a per-connection policy is already installed.
    pub fn with_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(SocketAddr) -> Result<Policy, Error> + Send + Sync + 'static,
    {
        assert!(
            self.conn_policy.is_none(),
            "cannot install both a policy and a connection policy"
        );
        self.policy = Some(Box::new(policy));
        self
    }

    /// Install a per-connection policy, consulted with both the peer and the
    /// local address of every accepted connection.
    ///
    /// # Panics
    /// Panics if a per-address policy is already installed.
    pub fn with_conn_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(ConnInfo) -> Result<Policy, Error> + Send + Sync + 'static,
    {
        assert!(
            self.policy.is_none(),
            "cannot install both a policy and a connection policy"
        );
        self.conn_policy = Some(Box::new(policy));
        self
    }

    /// Header timeout applied to every accepted connection; see
    /// [`ProxyStream::set_read_header_timeout`].
    pub fn with_read_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_header_timeout = timeout;
        self
    }

    pub fn with_parse_config(mut self, config: ParseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &TcpListener {
        &self.inner
    }

    pub fn into_inner(self) -> TcpListener {
        self.inner
    }

    /// Accept a connection and wrap it according to the policy.
    ///
    /// Transient socket-level accept errors are retried internally with
    /// exponential backoff; only persistent errors reach the caller. A policy
    /// returning [`Error::InvalidUpstream`] drops the connection and keeps
    /// accepting; any other policy error closes that connection and is
    /// returned, leaving the listener usable.
    pub async fn accept(&self) -> io::Result<ProxyStream<TcpStream>> {
        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        loop {
            let (stream, upstream) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(err) if is_transient_accept_error(&err) => {
                    tracing::warn!(
                        error = %err,
                        delay_ms = backoff.as_millis() as u64,
                        "transient accept error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                    continue;
                }
                Err(err) => return Err(err),
            };
            backoff = INITIAL_ACCEPT_BACKOFF;

            let policy = match self.evaluate_policy(&stream, upstream) {
                Ok(policy) => policy,
                Err(Error::InvalidUpstream) => {
                    tracing::debug!(%upstream, "connection dropped by policy");
                    continue;
                }
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, err));
                }
            };

            let mut wrapped = ProxyStream::with_policy(stream, policy);
            wrapped.set_parse_config(self.config);
            wrapped.set_read_header_timeout(self.read_header_timeout);
            return Ok(wrapped);
        }
    }

    fn evaluate_policy(&self, stream: &TcpStream, upstream: SocketAddr) -> Result<Policy, Error> {
        if let Some(policy) = &self.conn_policy {
            let downstream = stream.local_addr().map_err(|_| Error::InvalidUpstream)?;
            return policy(ConnInfo {
                upstream,
                downstream,
            });
        }
        if let Some(policy) = &self.policy {
            return policy(upstream);
        }
        Ok(Policy::Use)
    }
}

#[cfg(feature = "tokio")]
impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("inner", &self.inner)
            .field("read_header_timeout", &self.read_header_timeout)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tokio")]
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}
