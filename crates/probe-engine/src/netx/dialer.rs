//! Instrumented TCP dialers.
//!
//! Dialers are decorators around a [`Dialer`] trait object. The chain built
//! by [`StackConfig::new_dialer`](super::StackConfig::new_dialer) is, from
//! the outside in:
//!
//! ```text
//! ByteCounterDialer -> ProxyDialer -> DnsDialer -> SaverConnDialer
//!     -> SaverDialer -> ErrorWrapperDialer -> SystemDialer
//! ```
//!
//! so that `connect` events and per-connection `read`/`write`/`close`
//! events refer to concrete IP endpoints, while name resolution happens
//! once per dial through the configured resolver.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::bytecounter::ByteCounter;
use super::errorx::{ConfigError, NetError, failure, maybe_wrap, operation};
use super::resolver::SharedResolver;
use super::trace::{Event, EventName, SharedSaver};
use crate::context::Context;

/// Default TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A bidirectional byte stream returned by a dialer.
pub trait NetConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NetConn for T {}

/// Boxed connection.
pub type BoxConn = Box<dyn NetConn>;

/// Something that opens connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError>;
}

/// Shared handle to a dialer.
pub type SharedDialer = Arc<dyn Dialer>;

// ============================================================================
// Address helpers
// ============================================================================

/// Split `host:port` or `[v6]:port`.
#[must_use]
pub fn split_host_port(address: &str) -> Option<(String, String)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host.to_string(), port.to_string()));
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host.to_string(), port.to_string()))
}

/// Join a host and a port, bracketing IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn io_to_net(err: &io::Error) -> NetError {
    NetError::Io {
        kind: err.kind(),
        message: err.to_string(),
    }
}

// ============================================================================
// Base dialer
// ============================================================================

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct SystemDialer {
    pub timeout: Duration,
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        if network != "tcp" {
            return Err(NetError::other(format!("dial {network}: unknown network")));
        }
        let timeout = self.timeout;
        ctx.run(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => Ok(Box::new(stream) as BoxConn),
                Ok(Err(err)) => Err(NetError::from(err)),
                Err(_) => Err(NetError::other(format!("dial tcp {address}: i/o timeout"))),
            }
        })
        .await
    }
}

/// Tags dial failures with the `connect` operation.
pub struct ErrorWrapperDialer {
    pub dialer: SharedDialer,
}

#[async_trait]
impl Dialer for ErrorWrapperDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        maybe_wrap(
            self.dialer.dial_context(ctx, network, address).await,
            operation::CONNECT,
        )
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Records one `connect` event per dial attempt.
pub struct SaverDialer {
    pub dialer: SharedDialer,
    pub saver: SharedSaver,
}

#[async_trait]
impl Dialer for SaverDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let start = Instant::now();
        let res = self.dialer.dial_context(ctx, network, address).await;
        let duration = start.elapsed();
        debug!(address, network, ok = res.is_ok(), ?duration, "connect");
        self.saver.write(Event {
            address: address.to_string(),
            duration,
            err: res.as_ref().err().cloned(),
            proto: network.to_string(),
            ..Event::now(EventName::Connect)
        });
        res
    }
}

/// Wraps every successful connection in a [`SaverConn`].
pub struct SaverConnDialer {
    pub dialer: SharedDialer,
    pub saver: SharedSaver,
}

#[async_trait]
impl Dialer for SaverConnDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let conn = self.dialer.dial_context(ctx, network, address).await?;
        Ok(Box::new(SaverConn {
            inner: conn,
            saver: Arc::clone(&self.saver),
            address: address.to_string(),
            proto: network.to_string(),
        }))
    }
}

/// Connection that records `read`, `write` and `close` events.
pub struct SaverConn {
    inner: BoxConn,
    saver: SharedSaver,
    address: String,
    proto: String,
}

impl SaverConn {
    fn record(&self, name: EventName, num_bytes: usize, err: Option<NetError>, duration: Duration) {
        self.saver.write(Event {
            address: self.address.clone(),
            duration,
            err,
            num_bytes,
            proto: self.proto.clone(),
            ..Event::now(name)
        });
    }
}

impl AsyncRead for SaverConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let start = Instant::now();
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(outcome) = &res {
            let n = buf.filled().len() - before;
            let err = match outcome {
                Ok(()) if n == 0 && buf.remaining() > 0 => Some(NetError::other("EOF")),
                Ok(()) => None,
                Err(e) => Some(io_to_net(e)),
            };
            self.record(EventName::Read, n, err, start.elapsed());
        }
        res
    }
}

impl AsyncWrite for SaverConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let start = Instant::now();
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        match &res {
            Poll::Ready(Ok(n)) => self.record(EventName::Write, *n, None, start.elapsed()),
            Poll::Ready(Err(e)) => {
                self.record(EventName::Write, 0, Some(io_to_net(e)), start.elapsed());
            }
            Poll::Pending => {}
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for SaverConn {
    fn drop(&mut self) {
        self.record(EventName::Close, 0, None, Duration::ZERO);
    }
}

// ============================================================================
// Name resolution
// ============================================================================

/// Resolves the host part of the address and tries every returned address
/// in order until one connects.
pub struct DnsDialer {
    pub dialer: SharedDialer,
    pub resolver: SharedResolver,
}

#[async_trait]
impl Dialer for DnsDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let (host, port) = split_host_port(address).ok_or_else(|| {
            NetError::other(format!("address {address}: missing port in address"))
        })?;
        let addrs = if host.parse::<IpAddr>().is_ok() {
            vec![host]
        } else {
            self.resolver.lookup_host(ctx, &host).await?
        };
        let mut errors = Vec::new();
        for addr in addrs {
            let target = join_host_port(&addr, &port);
            match self.dialer.dial_context(ctx, network, &target).await {
                Ok(conn) => return Ok(conn),
                Err(err) => errors.push(err),
            }
        }
        Err(reduce_errors(errors))
    }
}

/// Pick the most informative error out of several dial attempts: the first
/// classified one, else the first one.
fn reduce_errors(errors: Vec<NetError>) -> NetError {
    let classified = errors.iter().position(|err| {
        matches!(err, NetError::Wrapped(w) if !w.failure.starts_with(failure::UNKNOWN_PREFIX))
    });
    let index = classified.unwrap_or(0);
    errors
        .into_iter()
        .nth(index)
        .unwrap_or_else(|| NetError::other("dns: no addresses to dial"))
}

// ============================================================================
// SOCKS5
// ============================================================================

/// Dials through a SOCKS5 proxy when one is configured.
pub struct ProxyDialer {
    pub dialer: SharedDialer,
    pub proxy_url: Option<Url>,
}

impl ProxyDialer {
    /// Validate the proxy scheme up front.
    pub fn new(dialer: SharedDialer, proxy_url: Option<Url>) -> Result<Self, ConfigError> {
        if let Some(url) = &proxy_url {
            if url.scheme() != "socks5" {
                return Err(ConfigError::UnsupportedProxyScheme(url.scheme().to_string()));
            }
        }
        Ok(Self { dialer, proxy_url })
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let Some(proxy) = &self.proxy_url else {
            return self.dialer.dial_context(ctx, network, address).await;
        };
        let host = proxy
            .host_str()
            .ok_or_else(|| NetError::other("socks5: proxy URL without host"))?;
        let proxy_address = join_host_port(
            host.trim_start_matches('[').trim_end_matches(']'),
            &proxy.port().unwrap_or(1080).to_string(),
        );
        let mut conn = self.dialer.dial_context(ctx, network, &proxy_address).await?;
        ctx.run(socks5_connect(&mut conn, address)).await?;
        debug!(proxy = %proxy_address, target = address, "socks5 connected");
        Ok(conn)
    }
}

async fn socks5_connect(conn: &mut BoxConn, target: &str) -> Result<(), NetError> {
    let (host, port) = split_host_port(target)
        .ok_or_else(|| NetError::other(format!("socks5: invalid target: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetError::other(format!("socks5: invalid port: {port}")))?;

    conn.write_all(&[5, 1, 0]).await?;
    let mut method = [0u8; 2];
    conn.read_exact(&mut method).await?;
    if method != [5, 0] {
        return Err(NetError::other("socks5: no acceptable authentication method"));
    }

    let mut request = vec![5, 1, 0];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(1);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(4);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| NetError::other("socks5: hostname too long"))?;
            request.push(3);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&request).await?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[1] != 0 {
        return Err(NetError::other(format!(
            "socks5: connect failed with code {}",
            head[1]
        )));
    }
    let addr_len = match head[3] {
        1 => 4,
        4 => 16,
        3 => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => return Err(NetError::other(format!("socks5: bad address type {other}"))),
    };
    let mut rest = vec![0u8; addr_len + 2];
    conn.read_exact(&mut rest).await?;
    Ok(())
}

// ============================================================================
// Byte counting
// ============================================================================

/// Counts the bytes moved by every connection into a session counter.
pub struct ByteCounterDialer {
    pub dialer: SharedDialer,
    pub counter: Arc<ByteCounter>,
}

#[async_trait]
impl Dialer for ByteCounterDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let conn = self.dialer.dial_context(ctx, network, address).await?;
        Ok(Box::new(CountingConn {
            inner: conn,
            counter: Arc::clone(&self.counter),
        }))
    }
}

struct CountingConn {
    inner: BoxConn,
    counter: Arc<ByteCounter>,
}

impl AsyncRead for CountingConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            self.counter.count_received(buf.filled().len() - before);
        }
        res
    }
}

impl AsyncWrite for CountingConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            self.counter.count_sent(*n);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
