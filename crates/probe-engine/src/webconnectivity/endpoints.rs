//! TCP and TLS endpoints derived from the target URL.

use url::Url;

use crate::netx::dialer::join_host_port;

/// Port and urlgetter scheme used to probe the endpoints of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    pub urlgetter_scheme: &'static str,
    pub port: String,
}

impl EndpointPort {
    /// `tcpconnect` on 80 for `http`, `tlshandshake` on 443 for `https`.
    /// An explicit port in the URL wins. `None` for any other scheme.
    #[must_use]
    pub fn new(url: &Url) -> Option<Self> {
        let (urlgetter_scheme, default_port) = match url.scheme() {
            "http" => ("tcpconnect", "80"),
            "https" => ("tlshandshake", "443"),
            _ => return None,
        };
        let port = url
            .port()
            .map_or_else(|| default_port.to_string(), |p| p.to_string());
        Some(Self {
            urlgetter_scheme,
            port,
        })
    }
}

/// One endpoint to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `ip:port`, bracketed for IPv6.
    pub address: String,
    /// Target to hand to urlgetter.
    pub urlgetter_url: String,
}

/// One endpoint per resolved address.
#[must_use]
pub fn new_endpoints(url: &Url, addrs: &[String]) -> Vec<Endpoint> {
    let Some(port) = EndpointPort::new(url) else {
        return Vec::new();
    };
    addrs
        .iter()
        .map(|addr| {
            let address = join_host_port(addr, &port.port);
            Endpoint {
                urlgetter_url: format!("{}://{address}", port.urlgetter_scheme),
                address,
            }
        })
        .collect()
}
