//! DNS transports: how an encoded query reaches a server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;
use url::Url;

use crate::context::Context;
use crate::netx::dialer::SharedDialer;
use crate::netx::errorx::NetError;
use crate::netx::httpx::{HttpRequest, SharedHttpTransport};
use crate::netx::trace::{Event, EventName, SharedSaver};

/// Per-exchange timeout for UDP queries.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_UDP_REPLY: usize = 1 << 17;
const DNS_MESSAGE: &str = "application/dns-message";

/// Sends one encoded query and returns the encoded reply.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, NetError>;

    /// Name of the transport (`udp`, `tcp`, `dot`, `doh`).
    fn network(&self) -> &str;

    /// Server address or URL.
    fn address(&self) -> &str;
}

pub type SharedTransport = Arc<dyn DnsTransport>;

// ============================================================================
// UDP
// ============================================================================

/// Plain DNS over UDP.
#[derive(Debug, Clone)]
pub struct DnsOverUdp {
    address: String,
}

impl DnsOverUdp {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl DnsTransport for DnsOverUdp {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, NetError> {
        let address = self.address.as_str();
        ctx.run(async move {
            let local = if address.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(address).await?;
            socket.send(query).await?;
            let mut buf = vec![0u8; MAX_UDP_REPLY];
            let n = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
                .await
                .map_err(|_| NetError::other(format!("read udp {address}: i/o timeout")))??;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }

    fn network(&self) -> &str {
        "udp"
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// TCP and TLS
// ============================================================================

/// DNS over a stream connection with two-byte length framing. Used both for
/// plain TCP and, given a TLS dialer, for DNS-over-TLS.
pub struct DnsOverTcp {
    dialer: SharedDialer,
    address: String,
    network: &'static str,
}

impl DnsOverTcp {
    #[must_use]
    pub fn new_tcp(dialer: SharedDialer, address: impl Into<String>) -> Self {
        Self {
            dialer,
            address: address.into(),
            network: "tcp",
        }
    }

    /// `dialer` must perform the TLS handshake itself.
    #[must_use]
    pub fn new_tls(dialer: SharedDialer, address: impl Into<String>) -> Self {
        Self {
            dialer,
            address: address.into(),
            network: "dot",
        }
    }
}

#[async_trait]
impl DnsTransport for DnsOverTcp {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, NetError> {
        let len = u16::try_from(query.len())
            .map_err(|_| NetError::other("dns: query too long"))?;
        let mut conn = self.dialer.dial_context(ctx, "tcp", &self.address).await?;
        ctx.run(async move {
            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(query);
            conn.write_all(&framed).await?;
            let mut header = [0u8; 2];
            conn.read_exact(&mut header).await?;
            let mut reply = vec![0u8; usize::from(u16::from_be_bytes(header))];
            conn.read_exact(&mut reply).await?;
            Ok(reply)
        })
        .await
    }

    fn network(&self) -> &str {
        self.network
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// HTTPS
// ============================================================================

/// DNS over HTTPS (RFC 8484, POST) through an instrumented HTTP transport.
pub struct DnsOverHttps {
    transport: SharedHttpTransport,
    url: Url,
    address: String,
}

impl DnsOverHttps {
    #[must_use]
    pub fn new(transport: SharedHttpTransport, url: Url) -> Self {
        Self {
            transport,
            address: url.to_string(),
            url,
        }
    }
}

#[async_trait]
impl DnsTransport for DnsOverHttps {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, NetError> {
        let mut req = HttpRequest::new("POST", self.url.clone());
        req.set_header("Content-Type", DNS_MESSAGE);
        req.set_header("Accept", DNS_MESSAGE);
        req.body = query.to_vec();
        let resp = self.transport.round_trip(ctx, &req).await?;
        if resp.status != 200 {
            return Err(NetError::other("doh: server returned error"));
        }
        if resp.header("Content-Type") != Some(DNS_MESSAGE.as_bytes()) {
            return Err(NetError::other("doh: invalid content-type"));
        }
        Ok(resp.body)
    }

    fn network(&self) -> &str {
        "doh"
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Records a `dns_round_trip_done` event with the raw query and reply.
pub struct SaverDnsTransport {
    pub transport: SharedTransport,
    pub saver: SharedSaver,
}

#[async_trait]
impl DnsTransport for SaverDnsTransport {
    async fn round_trip(&self, ctx: &Context, query: &[u8]) -> Result<Vec<u8>, NetError> {
        let start = Instant::now();
        let res = self.transport.round_trip(ctx, query).await;
        let duration = start.elapsed();
        debug!(
            network = self.network(),
            address = self.address(),
            ok = res.is_ok(),
            "dns round trip"
        );
        self.saver.write(Event {
            address: self.address().to_string(),
            proto: self.network().to_string(),
            duration,
            dns_query: query.to_vec(),
            dns_reply: res.as_ref().map(Clone::clone).unwrap_or_default(),
            err: res.as_ref().err().cloned(),
            ..Event::now(EventName::DnsRoundTripDone)
        });
        res
    }

    fn network(&self) -> &str {
        self.transport.network()
    }

    fn address(&self) -> &str {
        self.transport.address()
    }
}
