//! Event trace shared by the instrumented transports.
//!
//! A [`Saver`] is an append-only ledger. Each Getter invocation owns one;
//! the resolver, dialer, TLS handshaker and HTTP transport all push
//! [`Event`]s into it, and the archival encoder drains it once at the end.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::errorx::NetError;

/// Kind of network sub-operation recorded in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventName {
    ResolveStart,
    #[default]
    ResolveDone,
    DnsRoundTripDone,
    Connect,
    TlsHandshakeStart,
    TlsHandshakeDone,
    HttpTransactionStart,
    HttpRequestMetadata,
    HttpRequestBodySnapshot,
    HttpResponseMetadata,
    HttpResponseBodySnapshot,
    HttpTransactionDone,
    Read,
    Write,
    Close,
}

impl EventName {
    /// Name used in archived network events.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveStart => "resolve_start",
            Self::ResolveDone => "resolve_done",
            Self::DnsRoundTripDone => "dns_round_trip_done",
            Self::Connect => "connect",
            Self::TlsHandshakeStart => "tls_handshake_start",
            Self::TlsHandshakeDone => "tls_handshake_done",
            Self::HttpTransactionStart => "http_transaction_start",
            Self::HttpRequestMetadata => "http_request_metadata",
            Self::HttpRequestBodySnapshot => "http_request_body_snapshot",
            Self::HttpResponseMetadata => "http_response_metadata",
            Self::HttpResponseBodySnapshot => "http_response_body_snapshot",
            Self::HttpTransactionDone => "http_transaction_done",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed network sub-operation.
///
/// Only the fields relevant to `name` are set. A done event carrying an
/// error still carries whatever partial data was gathered.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub name: EventName,
    pub time: DateTime<Utc>,
    pub duration: Duration,
    pub err: Option<NetError>,

    // Network
    pub address: String,
    pub proto: String,
    pub num_bytes: usize,

    // DNS
    pub hostname: String,
    pub addresses: Vec<String>,
    pub dns_query: Vec<u8>,
    pub dns_reply: Vec<u8>,

    // HTTP
    pub http_headers: Vec<(String, Vec<u8>)>,
    pub http_method: String,
    pub http_url: String,
    pub http_status_code: i64,
    pub data: Vec<u8>,
    pub data_is_truncated: bool,

    // TLS
    pub no_tls_verify: bool,
    pub tls_server_name: String,
    pub tls_cipher_suite: String,
    pub tls_negotiated_proto: String,
    pub tls_next_protos: Vec<String>,
    pub tls_peer_certs: Vec<Vec<u8>>,
    pub tls_version: String,
}

impl Event {
    /// A new event stamped with the current time.
    #[must_use]
    pub fn now(name: EventName) -> Self {
        Self {
            name,
            time: Utc::now(),
            ..Default::default()
        }
    }
}

/// Append-only, internally synchronised event ledger.
#[derive(Debug, Default)]
pub struct Saver {
    events: Mutex<Vec<Event>>,
}

/// Shared handle to a [`Saver`].
pub type SharedSaver = Arc<Saver>;

impl Saver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn write(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    /// Copy of every event recorded so far.
    #[must_use]
    pub fn read(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take every event recorded so far, leaving the ledger empty.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
