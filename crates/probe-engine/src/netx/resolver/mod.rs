//! Composable, instrumented name resolution.
//!
//! Every resolver implements [`Resolver`]. Decorators add caching, bogon
//! filtering, error classification and tracing on top of either the
//! system resolver or a [`SerialResolver`] speaking the DNS wire format
//! over one of the [`transport`]s.
//!
//! # Architecture
//!
//! ```text
//! SaverResolver -> ErrorWrapperResolver -> BogonResolver
//!     -> CacheResolver (static DNS cache) -> CacheResolver (memo)
//!     -> SystemResolver | SerialResolver -> SaverDnsTransport -> transport
//! ```

pub mod transport;
pub mod wire;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::bogon::is_bogon;
use super::errorx::{NetError, maybe_wrap, operation};
use super::trace::{Event, EventName, SharedSaver};
use crate::context::Context;

pub use transport::{
    DnsOverHttps, DnsOverTcp, DnsOverUdp, DnsTransport, SaverDnsTransport, SharedTransport,
};

/// Maps a hostname onto textual IP addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError>;

    /// Kind of resolver, e.g. `system`, `udp`, `dot`, `doh`.
    fn network(&self) -> &str;

    /// Address of the server, empty for the system resolver.
    fn address(&self) -> &str;
}

pub type SharedResolver = Arc<dyn Resolver>;

// ============================================================================
// Base resolvers
// ============================================================================

/// The operating system's resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        let target = format!("{hostname}:0");
        ctx.run(async move {
            let addrs = tokio::net::lookup_host(target)
                .await
                .map_err(|err| system_error(hostname, err))?;
            let mut out: Vec<String> = Vec::new();
            for addr in addrs {
                let ip = addr.ip().to_string();
                if !out.contains(&ip) {
                    out.push(ip);
                }
            }
            Ok(out)
        })
        .await
    }

    fn network(&self) -> &str {
        "system"
    }

    fn address(&self) -> &str {
        ""
    }
}

fn system_error(hostname: &str, err: std::io::Error) -> NetError {
    let message = err.to_string();
    let nxdomain = [
        "Name or service not known",
        "nodename nor servname provided",
        "No address associated with hostname",
        "No such host is known",
    ];
    if nxdomain.iter().any(|needle| message.contains(needle)) {
        return NetError::NoSuchHost(hostname.to_string());
    }
    NetError::from(err)
}

/// Issues an A query and then an AAAA query over a [`DnsTransport`].
pub struct SerialResolver {
    transport: SharedTransport,
}

impl SerialResolver {
    #[must_use]
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    async fn query(&self, ctx: &Context, hostname: &str, qtype: u16) -> Result<Vec<String>, NetError> {
        let id = rand::random::<u16>();
        let query = wire::encode_query(hostname, qtype, id)?;
        let reply = self.transport.round_trip(ctx, &query).await?;
        wire::decode_response(&reply, id, hostname)
    }
}

#[async_trait]
impl Resolver for SerialResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        let res_a = self.query(ctx, hostname, wire::TYPE_A).await;
        let res_aaaa = self.query(ctx, hostname, wire::TYPE_AAAA).await;
        let mut addrs = Vec::new();
        let mut first_err = None;
        for res in [res_a, res_aaaa] {
            match res {
                Ok(found) => addrs.extend(found),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if !addrs.is_empty() {
            return Ok(addrs);
        }
        Err(first_err.unwrap_or_else(|| NetError::other("dns: no response returned")))
    }

    fn network(&self) -> &str {
        self.transport.network()
    }

    fn address(&self) -> &str {
        self.transport.address()
    }
}

// ============================================================================
// Decorators
// ============================================================================

/// Returns IP literals as they are, without a lookup.
pub struct AddressResolver {
    pub resolver: SharedResolver,
}

#[async_trait]
impl Resolver for AddressResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        if hostname.parse::<IpAddr>().is_ok() {
            return Ok(vec![hostname.to_string()]);
        }
        self.resolver.lookup_host(ctx, hostname).await
    }

    fn network(&self) -> &str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}

/// Answers from a local table before asking the wrapped resolver.
///
/// A read-only cache never learns new entries; it is how a static
/// `dns_cache` override is applied.
pub struct CacheResolver {
    resolver: SharedResolver,
    cache: Mutex<HashMap<String, Vec<String>>>,
    read_only: bool,
}

impl CacheResolver {
    /// A cache that memoises successful lookups.
    #[must_use]
    pub fn new(resolver: SharedResolver) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
            read_only: false,
        }
    }

    /// A cache preloaded with `entries` that never learns new ones.
    #[must_use]
    pub fn read_only(resolver: SharedResolver, entries: HashMap<String, Vec<String>>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(entries),
            read_only: true,
        }
    }

    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<Vec<String>> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hostname)
            .cloned()
    }

    pub fn set(&self, hostname: &str, addrs: Vec<String>) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname.to_string(), addrs);
    }
}

#[async_trait]
impl Resolver for CacheResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        if let Some(addrs) = self.get(hostname) {
            debug!(hostname, "dns cache hit");
            return Ok(addrs);
        }
        let addrs = self.resolver.lookup_host(ctx, hostname).await?;
        if !self.read_only {
            self.set(hostname, addrs.clone());
        }
        Ok(addrs)
    }

    fn network(&self) -> &str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}

/// Fails with [`NetError::DnsBogon`] when any returned address is a bogon.
pub struct BogonResolver {
    pub resolver: SharedResolver,
}

#[async_trait]
impl Resolver for BogonResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        let addrs = self.resolver.lookup_host(ctx, hostname).await?;
        if let Some(bogon) = addrs.iter().find(|addr| is_bogon(addr)) {
            warn!(hostname, address = %bogon, "resolver returned a bogon");
            return Err(NetError::DnsBogon);
        }
        Ok(addrs)
    }

    fn network(&self) -> &str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}

/// Tags lookup failures with the `resolve` operation.
pub struct ErrorWrapperResolver {
    pub resolver: SharedResolver,
}

#[async_trait]
impl Resolver for ErrorWrapperResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        maybe_wrap(
            self.resolver.lookup_host(ctx, hostname).await,
            operation::RESOLVE,
        )
    }

    fn network(&self) -> &str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}

/// Records `resolve_start` and `resolve_done` events.
pub struct SaverResolver {
    pub resolver: SharedResolver,
    pub saver: SharedSaver,
}

#[async_trait]
impl Resolver for SaverResolver {
    async fn lookup_host(&self, ctx: &Context, hostname: &str) -> Result<Vec<String>, NetError> {
        let address = self.address().to_string();
        let proto = self.network().to_string();
        self.saver.write(Event {
            address: address.clone(),
            hostname: hostname.to_string(),
            proto: proto.clone(),
            ..Event::now(EventName::ResolveStart)
        });
        let start = Instant::now();
        let res = self.resolver.lookup_host(ctx, hostname).await;
        let duration = start.elapsed();
        debug!(hostname, resolver = %proto, ?res, ?duration, "resolve");
        self.saver.write(Event {
            address,
            addresses: res.as_ref().map(Clone::clone).unwrap_or_default(),
            duration,
            err: res.as_ref().err().cloned(),
            hostname: hostname.to_string(),
            proto,
            ..Event::now(EventName::ResolveDone)
        });
        res
    }

    fn network(&self) -> &str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}
