//! Error classification for the instrumented network stack.
//!
//! Every error that can leave a transport is a [`NetError`]. Before an error
//! is archived it is wrapped into an [`ErrWrapper`] carrying one of the
//! fixed failure strings plus the operation that failed. Errors we cannot
//! classify become `unknown_failure: <message>` with any IP address in the
//! message replaced by `[scrubbed]`.

use std::io;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Fixed failure strings.
pub mod failure {
    pub const CONNECTION_REFUSED: &str = "connection_refused";
    pub const CONNECTION_RESET: &str = "connection_reset";
    pub const DNS_BOGON_ERROR: &str = "dns_bogon_error";
    pub const DNS_NXDOMAIN_ERROR: &str = "dns_nxdomain_error";
    pub const EOF_ERROR: &str = "eof_error";
    pub const GENERIC_TIMEOUT_ERROR: &str = "generic_timeout_error";
    pub const INTERRUPTED: &str = "interrupted";
    pub const SSL_INVALID_HOSTNAME: &str = "ssl_invalid_hostname";
    pub const SSL_UNKNOWN_AUTHORITY: &str = "ssl_unknown_authority";
    pub const SSL_INVALID_CERTIFICATE: &str = "ssl_invalid_certificate";
    pub const HTTP_REQUEST_FAILED: &str = "http_request_failed";
    /// Prefix of failures we could not classify.
    pub const UNKNOWN_PREFIX: &str = "unknown_failure";
}

/// Operation tags attached to wrapped errors.
pub mod operation {
    pub const RESOLVE: &str = "resolve";
    pub const CONNECT: &str = "connect";
    pub const TLS_HANDSHAKE: &str = "tls_handshake";
    pub const HTTP_ROUND_TRIP: &str = "http_round_trip";
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const CLOSE: &str = "close";
    /// Used when we fail before reaching any instrumented layer.
    pub const TOP_LEVEL: &str = "top_level";
}

/// Which certificate check rejected the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFailure {
    InvalidHostname,
    UnknownAuthority,
    InvalidCertificate,
}

/// Errors detected while building a measurement configuration. These are
/// returned before any network I/O takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid DNSCache string")]
    InvalidDnsCache,

    #[error("invalid IP in DNSCache")]
    InvalidDnsCacheIp,

    #[error("invalid domain in DNSCache")]
    InvalidDnsCacheDomain,

    #[error("invalid resolver URL: {0}")]
    InvalidResolverUrl(String),

    #[error("unsupported resolver scheme")]
    UnsupportedResolverScheme,

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedProxyScheme(String),

    #[error("urlgetter: invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("unknown targetURL scheme")]
    UnknownTargetScheme,

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
}

/// A failure classified into the measurement vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failure}")]
pub struct ErrWrapper {
    /// One of the [`failure`] strings or `unknown_failure: ...`.
    pub failure: String,
    /// One of the [`operation`] tags.
    pub operation: String,
    /// The underlying error.
    pub wrapped: Option<Box<NetError>>,
}

/// Errors produced by the instrumented stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error(transparent)]
    Wrapped(ErrWrapper),

    #[error("context canceled")]
    Interrupted,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("dns_bogon_error")]
    DnsBogon,

    #[error("lookup {0}: no such host")]
    NoSuchHost(String),

    #[error("{message}")]
    Certificate {
        kind: CertificateFailure,
        message: String,
    },

    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl NetError {
    /// Build an opaque error from a message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this error, or the error it wraps, is a cancellation.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Wrapped(w) => w.wrapped.as_deref().is_some_and(Self::is_interrupted),
            _ => false,
        }
    }

    /// The operation tag, if this error has been wrapped.
    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        match self {
            Self::Wrapped(w) => Some(w.operation.as_str()),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        if let Some(tls) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::from(tls.clone());
        }
        if let Some(net) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<NetError>())
        {
            return net.clone();
        }
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<rustls::Error> for NetError {
    fn from(err: rustls::Error) -> Self {
        let message = err.to_string();
        match &err {
            rustls::Error::InvalidCertificate(cert) => {
                let kind = match cert {
                    rustls::CertificateError::UnknownIssuer => CertificateFailure::UnknownAuthority,
                    rustls::CertificateError::NotValidForName => {
                        CertificateFailure::InvalidHostname
                    }
                    other if format!("{other:?}").starts_with("NotValidForName") => {
                        CertificateFailure::InvalidHostname
                    }
                    _ => CertificateFailure::InvalidCertificate,
                };
                Self::Certificate { kind, message }
            }
            _ => Self::Other(message),
        }
    }
}

impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io { kind, message } => io::Error::new(kind, message),
            other => io::Error::other(other),
        }
    }
}

/// Wrap `err` so that it carries a failure string and an operation.
///
/// When `err` is already wrapped, its failure is preserved, and so is its
/// operation if that is one of the four network-level operations.
#[must_use]
pub fn wrap_error(err: NetError, operation: &str) -> NetError {
    let failure = to_failure_string(&err);
    let operation = to_operation_string(&err, operation);
    NetError::Wrapped(ErrWrapper {
        failure,
        operation,
        wrapped: Some(Box::new(err)),
    })
}

/// Wrap the error contained in `res`, if any.
pub fn maybe_wrap<T>(res: Result<T, NetError>, operation: &str) -> Result<T, NetError> {
    res.map_err(|err| wrap_error(err, operation))
}

/// Map an error onto the failure vocabulary.
#[must_use]
pub fn to_failure_string(err: &NetError) -> String {
    match err {
        NetError::Wrapped(w) => return w.failure.clone(),
        NetError::DnsBogon => return failure::DNS_BOGON_ERROR.to_string(),
        NetError::Interrupted => return failure::INTERRUPTED.to_string(),
        NetError::DeadlineExceeded => return failure::GENERIC_TIMEOUT_ERROR.to_string(),
        NetError::NoSuchHost(_) => return failure::DNS_NXDOMAIN_ERROR.to_string(),
        NetError::Certificate { kind, .. } => {
            return match kind {
                CertificateFailure::InvalidHostname => failure::SSL_INVALID_HOSTNAME,
                CertificateFailure::UnknownAuthority => failure::SSL_UNKNOWN_AUTHORITY,
                CertificateFailure::InvalidCertificate => failure::SSL_INVALID_CERTIFICATE,
            }
            .to_string();
        }
        NetError::Io { kind, .. } => match kind {
            io::ErrorKind::ConnectionRefused => return failure::CONNECTION_REFUSED.to_string(),
            io::ErrorKind::ConnectionReset => return failure::CONNECTION_RESET.to_string(),
            io::ErrorKind::TimedOut => return failure::GENERIC_TIMEOUT_ERROR.to_string(),
            io::ErrorKind::UnexpectedEof => return failure::EOF_ERROR.to_string(),
            _ => {}
        },
        _ => {}
    }
    let s = err.to_string();
    let by_suffix: &[(&str, &str)] = &[
        ("operation was canceled", failure::INTERRUPTED),
        ("EOF", failure::EOF_ERROR),
        ("connection refused", failure::CONNECTION_REFUSED),
        ("connection reset by peer", failure::CONNECTION_RESET),
        ("context deadline exceeded", failure::GENERIC_TIMEOUT_ERROR),
        ("transaction is timed out", failure::GENERIC_TIMEOUT_ERROR),
        ("i/o timeout", failure::GENERIC_TIMEOUT_ERROR),
        ("TLS handshake timeout", failure::GENERIC_TIMEOUT_ERROR),
        ("no such host", failure::DNS_NXDOMAIN_ERROR),
    ];
    for (suffix, failure) in by_suffix {
        if s.ends_with(suffix) {
            return (*failure).to_string();
        }
    }
    scrub(&format!("unknown_failure: {s}"))
}

/// Pick the operation for a wrapped error.
#[must_use]
pub fn to_operation_string(err: &NetError, operation: &str) -> String {
    if let NetError::Wrapped(w) = err {
        match w.operation.as_str() {
            operation::CONNECT
            | operation::HTTP_ROUND_TRIP
            | operation::RESOLVE
            | operation::TLS_HANDSHAKE => return w.operation.clone(),
            _ => {}
        }
    }
    operation.to_string()
}

// ============================================================================
// Address scrubbing
// ============================================================================

const IPV4: &str = r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}";
const IPV6_ADDRESS: &str = r"([0-9a-fA-F]{0,4}:){5,7}([0-9a-fA-F]{0,4})?";
const IPV6_COMPRESSED: &str =
    r"([0-9a-fA-F]{0,4}:){0,5}([0-9a-fA-F]{0,4})?(::)([0-9a-fA-F]{0,4}:){0,5}([0-9a-fA-F]{0,4})?";
const OPTIONAL_PORT: &str = r"(:[0-9]{1,5})?";

fn address_pattern() -> String {
    let ipv6_full = format!(
        "({IPV6_ADDRESS}({IPV4}))|({IPV6_COMPRESSED}({IPV4}))|({IPV6_ADDRESS})|({IPV6_COMPRESSED})"
    );
    format!(r"(({IPV4})|(\[({ipv6_full})\])|({ipv6_full})){OPTIONAL_PORT}")
}

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&address_pattern()).unwrap_or_else(|e| panic!("address pattern: {e}"))
});

static FULL_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"(^|\s|[^0-9A-Za-z_:]){}(\s|(:\s)|[^0-9A-Za-z_:]|$)",
        address_pattern()
    );
    Regex::new(&pattern).unwrap_or_else(|e| panic!("full address pattern: {e}"))
});

/// Replace IP addresses (with optional port) in `s` with `[scrubbed]`.
#[must_use]
pub fn scrub(s: &str) -> String {
    FULL_ADDRESS_RE
        .replace_all(s, |caps: &regex::Captures<'_>| {
            ADDRESS_RE.replace_all(&caps[0], "[scrubbed]").into_owned()
        })
        .into_owned()
}
