//! Per-measurement settings.

use serde::{Deserialize, Serialize};

/// Settings for one urlgetter measurement. Every field defaults to empty
/// or false, which means "use the default behaviour".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Static resolution in the form `"IP domain"`.
    pub dns_cache: String,

    /// Report a final status code >= 400 as a failure.
    pub fail_on_http_error: bool,

    /// Value of the `Host` header, if different from the URL's host.
    pub http_host: String,

    /// HTTP method. `GET` when empty.
    pub method: String,

    /// Stop at the first response instead of following redirects.
    pub no_follow_redirects: bool,

    /// Skip TLS certificate verification.
    pub no_tls_verify: bool,

    /// Fail resolutions that return bogon addresses.
    pub reject_dns_bogons: bool,

    /// Resolver to use: `system:///`, `udp://host:port`, `tcp://host:port`,
    /// `dot://host:port`, a DoH `https://` URL, `doh://google` or
    /// `doh://cloudflare`. The system resolver when empty.
    pub resolver_url: String,

    /// SNI to send instead of the target's host.
    pub tls_server_name: String,

    /// Tunnel to start before measuring, if any.
    pub tunnel: String,
}

impl Config {
    /// The HTTP method to use.
    #[must_use]
    pub fn method(&self) -> &str {
        if self.method.is_empty() {
            "GET"
        } else {
            &self.method
        }
    }
}
