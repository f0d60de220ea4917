//! Turns a [`Config`] into an instrumented [`StackConfig`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use super::config::Config;
use crate::netx::StackConfig;
use crate::netx::bytecounter::ByteCounter;
use crate::netx::errorx::ConfigError;
use crate::netx::tlsx::TlsConfig;
use crate::netx::trace::SharedSaver;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]+(-[a-z0-9]+)*\.)+[a-z]{2,}$")
        .unwrap_or_else(|e| panic!("domain pattern: {e}"))
});

/// Expand resolver shortcuts.
#[must_use]
pub fn expand_resolver_url(raw: &str) -> &str {
    match raw {
        "doh://google" => "https://dns.google/dns-query",
        "doh://cloudflare" => "https://cloudflare-dns.com/dns-query",
        "" => "system:///",
        other => other,
    }
}

/// Parse a `"IP domain"` entry.
pub fn parse_dns_cache(entry: &str) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let parts: Vec<&str> = entry.split(' ').collect();
    let [ip, domain] = parts.as_slice() else {
        return Err(ConfigError::InvalidDnsCache);
    };
    if ip.parse::<IpAddr>().is_err() {
        return Err(ConfigError::InvalidDnsCacheIp);
    }
    if !DOMAIN_RE.is_match(domain) {
        return Err(ConfigError::InvalidDnsCacheDomain);
    }
    Ok(HashMap::from([((*domain).to_string(), vec![(*ip).to_string()])]))
}

/// Everything needed to build the stack for one measurement.
pub struct Configurer<'a> {
    pub config: &'a Config,
    pub proxy_url: Option<Url>,
    pub saver: SharedSaver,
    pub byte_counter: Option<Arc<ByteCounter>>,
}

impl Configurer<'_> {
    /// Build the stack. Every event is traced into `saver`; resolutions
    /// are memoised for the lifetime of the stack.
    pub fn new_configuration(&self) -> Result<StackConfig, ConfigError> {
        let mut stack = StackConfig {
            bogon_is_error: self.config.reject_dns_bogons,
            cache_resolutions: true,
            saver: Some(Arc::clone(&self.saver)),
            byte_counter: self.byte_counter.clone(),
            tls_config: TlsConfig {
                server_name: self.config.tls_server_name.clone(),
                no_tls_verify: self.config.no_tls_verify,
                ..Default::default()
            },
            proxy_url: self.proxy_url.clone(),
            ..Default::default()
        };
        if !self.config.dns_cache.is_empty() {
            stack.dns_cache = parse_dns_cache(&self.config.dns_cache)?;
        }
        let raw = expand_resolver_url(&self.config.resolver_url);
        let resolver_url =
            Url::parse(raw).map_err(|e| ConfigError::InvalidResolverUrl(format!("{raw}: {e}")))?;
        stack.base_resolver = Some(stack.new_base_resolver(&resolver_url)?);
        debug!(resolver = %resolver_url, "configured resolver");
        Ok(stack)
    }
}
