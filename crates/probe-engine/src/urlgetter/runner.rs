//! Dispatches a target URL to the matching network operation.

use tracing::debug;
use url::Url;

use super::config::Config;
use crate::context::Context;
use crate::httpheader;
use crate::netx::StackConfig;
use crate::netx::dialer::join_host_port;
use crate::netx::errorx::{ConfigError, ErrWrapper, NetError, failure, operation};
use crate::netx::httpx::{HttpClient, HttpRequest, HttpResponse};

/// ALPN offered by bare TLS handshakes.
pub const TLS_HANDSHAKE_ALPN: &[&str] = &["h2", "http/1.1"];

/// Runs one operation against a configured stack.
pub struct Runner<'a> {
    pub config: &'a Config,
    pub stack: StackConfig,
    pub target: &'a str,
}

fn hostname(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// `host:port` when the URL has an explicit port, else just the host.
fn endpoint(url: &Url) -> String {
    let host = hostname(url);
    match url.port() {
        Some(port) => join_host_port(&host, &port.to_string()),
        None => host,
    }
}

impl Runner<'_> {
    pub async fn run(&self, ctx: &Context) -> Result<(), NetError> {
        let target = Url::parse(self.target)
            .map_err(|e| ConfigError::InvalidTargetUrl(format!("{}: {e}", self.target)))?;
        debug!(target = %target, "running");
        match target.scheme() {
            "http" | "https" => self.http_get(ctx, target).await.map(|_| ()),
            "dnslookup" => self.dns_lookup(ctx, &hostname(&target)).await,
            "tlshandshake" => self.tls_handshake(ctx, &endpoint(&target)).await,
            "tcpconnect" => self.tcp_connect(ctx, &endpoint(&target)).await,
            _ => Err(ConfigError::UnknownTargetScheme.into()),
        }
    }

    async fn http_get(&self, ctx: &Context, url: Url) -> Result<HttpResponse, NetError> {
        let mut req = HttpRequest::new(self.config.method(), url);
        req.set_header("Accept", httpheader::random_accept());
        req.set_header("Accept-Language", httpheader::random_accept_language());
        req.set_header("User-Agent", httpheader::random_user_agent());
        if !self.config.http_host.is_empty() {
            req.host = Some(self.config.http_host.clone());
        }
        let client = HttpClient::new(
            self.stack.new_http_transport()?,
            !self.config.no_follow_redirects,
        );
        let resp = client.do_request(ctx, req).await?;
        if self.config.fail_on_http_error && resp.status >= 400 {
            return Err(NetError::Wrapped(ErrWrapper {
                failure: failure::HTTP_REQUEST_FAILED.to_string(),
                operation: operation::HTTP_ROUND_TRIP.to_string(),
                wrapped: Some(Box::new(NetError::other(format!(
                    "http: status code {}",
                    resp.status
                )))),
            }));
        }
        Ok(resp)
    }

    async fn dns_lookup(&self, ctx: &Context, hostname: &str) -> Result<(), NetError> {
        let addrs = self.stack.new_resolver().lookup_host(ctx, hostname).await?;
        debug!(%hostname, ?addrs, "dns lookup done");
        Ok(())
    }

    async fn tls_handshake(&self, ctx: &Context, address: &str) -> Result<(), NetError> {
        let dialer = self.stack.new_tls_dialer(TLS_HANDSHAKE_ALPN)?;
        let (_conn, state) = dialer.dial_tls_context(ctx, "tcp", address).await?;
        debug!(%address, version = %state.version, "tls handshake done");
        Ok(())
    }

    async fn tcp_connect(&self, ctx: &Context, address: &str) -> Result<(), NetError> {
        let _conn = self.stack.new_dialer()?.dial_context(ctx, "tcp", address).await?;
        debug!(%address, "tcp connect done");
        Ok(())
    }
}
