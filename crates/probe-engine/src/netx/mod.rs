//! Instrumented network stack.
//!
//! Everything a measurement touches on the wire goes through this module:
//! resolvers, dialers, TLS handshakers and the HTTP transport are all
//! decorator chains that push [`trace::Event`]s into a shared
//! [`trace::Saver`] and classify failures with [`errorx`].
//!
//! [`StackConfig`] assembles the chains from a handful of knobs.
//!
//! # Usage
//!
//! ```rust,ignore
//! let saver = Arc::new(Saver::new());
//! let stack = StackConfig {
//!     saver: Some(Arc::clone(&saver)),
//!     cache_resolutions: true,
//!     ..Default::default()
//! };
//! let client = HttpClient::new(stack.new_http_transport()?, true);
//! ```

pub mod bogon;
pub mod bytecounter;
pub mod dialer;
pub mod errorx;
pub mod httpx;
pub mod resolver;
pub mod tlsx;
pub mod trace;

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use self::bytecounter::ByteCounter;
use self::dialer::{
    ByteCounterDialer, DnsDialer, ErrorWrapperDialer, ProxyDialer, SaverConnDialer, SaverDialer,
    SharedDialer, SystemDialer, join_host_port,
};
use self::errorx::ConfigError;
use self::httpx::{ErrorWrapperTransport, SaverTransport, SharedHttpTransport, SystemTransport};
use self::resolver::{
    AddressResolver, BogonResolver, CacheResolver, DnsOverHttps, DnsOverTcp, DnsOverUdp,
    ErrorWrapperResolver, SaverDnsTransport, SaverResolver, SerialResolver, SharedResolver,
    SharedTransport, SystemResolver,
};
use self::tlsx::{
    ErrorWrapperTlsHandshaker, SaverTlsHandshaker, SharedHandshaker, SystemTlsHandshaker,
    TlsConfig, TlsDialer,
};
use self::trace::SharedSaver;

/// ALPN offered by the HTTP transport, which only speaks HTTP/1.1.
pub const HTTP_ALPN: &[&str] = &["http/1.1"];

/// Knobs for building an instrumented stack.
#[derive(Clone, Default)]
pub struct StackConfig {
    /// Resolver at the bottom of the chain; the system resolver if unset.
    pub base_resolver: Option<SharedResolver>,
    /// Fail lookups that return reserved addresses.
    pub bogon_is_error: bool,
    /// Memoise lookups for the lifetime of the stack.
    pub cache_resolutions: bool,
    /// Static hostname to addresses overrides.
    pub dns_cache: HashMap<String, Vec<String>>,
    /// Where events go. No tracing when unset.
    pub saver: Option<SharedSaver>,
    /// Session-wide byte accounting.
    pub byte_counter: Option<Arc<ByteCounter>>,
    /// Server name override and verification settings. ALPN is chosen by
    /// the constructor that builds the TLS dialer.
    pub tls_config: TlsConfig,
    /// `socks5://` proxy to dial through.
    pub proxy_url: Option<Url>,
}

impl StackConfig {
    /// Build the resolver chain.
    #[must_use]
    pub fn new_resolver(&self) -> SharedResolver {
        let mut r: SharedResolver = self
            .base_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(SystemResolver));
        if self.cache_resolutions {
            r = Arc::new(CacheResolver::new(r));
        }
        if !self.dns_cache.is_empty() {
            r = Arc::new(CacheResolver::read_only(r, self.dns_cache.clone()));
        }
        if self.bogon_is_error {
            r = Arc::new(BogonResolver { resolver: r });
        }
        r = Arc::new(ErrorWrapperResolver { resolver: r });
        if let Some(saver) = &self.saver {
            r = Arc::new(SaverResolver {
                resolver: r,
                saver: Arc::clone(saver),
            });
        }
        Arc::new(AddressResolver { resolver: r })
    }

    /// Build the TCP dialer chain on top of a fresh resolver chain.
    pub fn new_dialer(&self) -> Result<SharedDialer, ConfigError> {
        self.dialer_with(self.new_resolver())
    }

    fn dialer_with(&self, resolver: SharedResolver) -> Result<SharedDialer, ConfigError> {
        let mut d: SharedDialer = Arc::new(SystemDialer::default());
        d = Arc::new(ErrorWrapperDialer { dialer: d });
        if let Some(saver) = &self.saver {
            d = Arc::new(SaverDialer {
                dialer: d,
                saver: Arc::clone(saver),
            });
            d = Arc::new(SaverConnDialer {
                dialer: d,
                saver: Arc::clone(saver),
            });
        }
        d = Arc::new(DnsDialer {
            dialer: d,
            resolver,
        });
        d = Arc::new(ProxyDialer::new(d, self.proxy_url.clone())?);
        if let Some(counter) = &self.byte_counter {
            d = Arc::new(ByteCounterDialer {
                dialer: d,
                counter: Arc::clone(counter),
            });
        }
        Ok(d)
    }

    fn new_handshaker(&self) -> SharedHandshaker {
        let mut h: SharedHandshaker = Arc::new(SystemTlsHandshaker::default());
        h = Arc::new(ErrorWrapperTlsHandshaker { handshaker: h });
        if let Some(saver) = &self.saver {
            h = Arc::new(SaverTlsHandshaker {
                handshaker: h,
                saver: Arc::clone(saver),
            });
        }
        h
    }

    fn tls_dialer_over(&self, dialer: SharedDialer, alpn: &[&str]) -> TlsDialer {
        let mut config = self.tls_config.clone();
        config.alpn = alpn.iter().map(|p| (*p).to_string()).collect();
        TlsDialer {
            dialer,
            handshaker: self.new_handshaker(),
            config,
        }
    }

    /// Build a dialer that completes a TLS handshake offering `alpn`.
    pub fn new_tls_dialer(&self, alpn: &[&str]) -> Result<Arc<TlsDialer>, ConfigError> {
        Ok(Arc::new(self.tls_dialer_over(self.new_dialer()?, alpn)))
    }

    /// Build the HTTP transport chain. Plain and TLS connections share one
    /// resolver chain.
    pub fn new_http_transport(&self) -> Result<SharedHttpTransport, ConfigError> {
        let dialer = self.new_dialer()?;
        let tls_dialer: SharedDialer =
            Arc::new(self.tls_dialer_over(Arc::clone(&dialer), HTTP_ALPN));
        let mut t: SharedHttpTransport = Arc::new(SystemTransport { dialer, tls_dialer });
        t = Arc::new(ErrorWrapperTransport { transport: t });
        if let Some(saver) = &self.saver {
            t = Arc::new(SaverTransport::new(t, Arc::clone(saver)));
        }
        Ok(t)
    }

    /// Build a base resolver speaking to the server named by `url`.
    ///
    /// Supported schemes are `system`, `udp`, `tcp`, `dot` and `https`.
    /// The returned resolver is meant to be used as `base_resolver` of
    /// another config; its own connections are traced into this config's
    /// saver.
    pub fn new_base_resolver(&self, url: &Url) -> Result<SharedResolver, ConfigError> {
        let endpoint = |default_port: u16| -> Result<String, ConfigError> {
            let host = url
                .host_str()
                .ok_or_else(|| ConfigError::InvalidResolverUrl(url.to_string()))?;
            Ok(join_host_port(
                host.trim_start_matches('[').trim_end_matches(']'),
                &url.port().unwrap_or(default_port).to_string(),
            ))
        };
        let transport: SharedTransport = match url.scheme() {
            "system" => return Ok(Arc::new(SystemResolver)),
            "udp" => Arc::new(DnsOverUdp::new(endpoint(53)?)),
            "tcp" => Arc::new(DnsOverTcp::new_tcp(self.new_dialer()?, endpoint(53)?)),
            "dot" => {
                let tls: SharedDialer = self.new_tls_dialer(&["dot"])?;
                Arc::new(DnsOverTcp::new_tls(tls, endpoint(853)?))
            }
            "https" => Arc::new(DnsOverHttps::new(self.new_http_transport()?, url.clone())),
            _ => return Err(ConfigError::UnsupportedResolverScheme),
        };
        let transport: SharedTransport = match &self.saver {
            Some(saver) => Arc::new(SaverDnsTransport {
                transport,
                saver: Arc::clone(saver),
            }),
            None => transport,
        };
        Ok(Arc::new(SerialResolver::new(transport)))
    }
}
