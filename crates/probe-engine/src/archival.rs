//! Conversion of event traces into the archival measurement format.
//!
//! The `new_*_list` functions take the beginning of a measurement and the
//! events drained from a [`Saver`](crate::netx::trace::Saver) and produce
//! the stable JSON sub-documents stored inside test keys. Each entry
//! carries `t`, the number of seconds elapsed since the beginning.
//!
//! Strings that may contain arbitrary bytes are [`MaybeBinaryValue`]s:
//! plain JSON strings when valid UTF-8, else a base64 envelope.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::geoip::AsnLookup;
use crate::model::Measurement;
use crate::netx::dialer::split_host_port;
use crate::netx::errorx::{NetError, scrub};
use crate::netx::trace::{Event, EventName};

/// Operation reported when an error carries none.
pub const UNKNOWN_OPERATION: &str = "unknown";

// ============================================================================
// Extensions
// ============================================================================

/// Version of a data format extension used by a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtSpec {
    pub name: &'static str,
    pub version: i64,
}

impl ExtSpec {
    /// Record this extension in the measurement.
    pub fn add_to<TK>(&self, measurement: &mut Measurement<TK>) {
        measurement
            .extensions
            .insert(self.name.to_string(), self.version);
    }
}

pub const EXT_DNS: ExtSpec = ExtSpec { name: "dnst", version: 0 };
pub const EXT_HTTP: ExtSpec = ExtSpec { name: "httpt", version: 0 };
pub const EXT_NETEVENTS: ExtSpec = ExtSpec { name: "netevents", version: 0 };
pub const EXT_TCP_CONNECT: ExtSpec = ExtSpec { name: "tcpconnect", version: 0 };
pub const EXT_TLS_HANDSHAKE: ExtSpec = ExtSpec { name: "tlshandshake", version: 0 };

// ============================================================================
// Failures
// ============================================================================

/// Archival failure string for `err`.
#[must_use]
pub fn new_failure(err: Option<&NetError>) -> Option<String> {
    match err? {
        NetError::Wrapped(w) if w.failure.is_empty() => {
            Some("unknown_failure: errWrapper.Failure is empty".to_string())
        }
        NetError::Wrapped(w) => Some(w.failure.clone()),
        other => Some(scrub(&format!("unknown_failure: {other}"))),
    }
}

/// Archival failed operation for `err`.
#[must_use]
pub fn new_failed_operation(err: Option<&NetError>) -> Option<String> {
    match err? {
        NetError::Wrapped(w) if !w.operation.is_empty() => Some(w.operation.clone()),
        _ => Some(UNKNOWN_OPERATION.to_string()),
    }
}

fn seconds_since(begin: DateTime<Utc>, time: DateTime<Utc>) -> f64 {
    let elapsed = time - begin;
    let secs = elapsed.num_seconds();
    let nanos = (elapsed - chrono::Duration::seconds(secs))
        .num_nanoseconds()
        .unwrap_or_default();
    secs as f64 + nanos as f64 / 1e9
}

// ============================================================================
// Binary-safe values
// ============================================================================

/// Bytes that serialise as a string when valid UTF-8 and as
/// `{"data": <base64>, "format": "base64"}` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaybeBinaryValue(pub Vec<u8>);

impl MaybeBinaryValue {
    /// The value as text, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for MaybeBinaryValue {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for MaybeBinaryValue {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl fmt::Display for MaybeBinaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for MaybeBinaryValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_str() {
            Some(s) => serializer.serialize_str(s),
            None => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("data", &STANDARD.encode(&self.0))?;
                map.serialize_entry("format", "base64")?;
                map.end()
            }
        }
    }
}

fn decode_maybe_binary(value: Value) -> Result<MaybeBinaryValue, String> {
    match value {
        Value::String(s) => Ok(MaybeBinaryValue(s.into_bytes())),
        Value::Object(map) => {
            match map.get("format") {
                Some(Value::String(f)) if f == "base64" => {}
                Some(Value::String(f)) => return Err(format!("invalid format: {f}")),
                Some(_) => return Err("format is not a string".to_string()),
                None => return Err("missing format".to_string()),
            }
            let data = match map.get("data") {
                Some(Value::String(d)) => d,
                Some(_) => return Err("data is not a string".to_string()),
                None => return Err("missing data".to_string()),
            };
            STANDARD
                .decode(data)
                .map(MaybeBinaryValue)
                .map_err(|e| format!("invalid base64: {e}"))
        }
        _ => Err("expected a string or a base64 object".to_string()),
    }
}

impl<'de> Deserialize<'de> for MaybeBinaryValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        decode_maybe_binary(Value::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// One header serialised as a `[key, value]` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeader {
    pub key: String,
    pub value: MaybeBinaryValue,
}

impl Serialize for HttpHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.key)?;
        seq.serialize_element(&self.value)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for HttpHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut pair = Vec::<Value>::deserialize(deserializer)?;
        if pair.len() != 2 {
            return Err(de::Error::custom("invalid header: expected two elements"));
        }
        let value = pair.pop().unwrap_or_default();
        let Some(Value::String(key)) = pair.pop() else {
            return Err(de::Error::custom("invalid header: key is not a string"));
        };
        let value = decode_maybe_binary(value).map_err(de::Error::custom)?;
        Ok(Self { key, value })
    }
}

// ============================================================================
// Archival types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectStatus {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blocked: Option<bool>,
    pub failure: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectEntry {
    pub ip: String,
    pub port: u16,
    pub status: TcpConnectStatus,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswerEntry {
    pub asn: u32,
    pub as_org_name: String,
    pub answer_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ipv4: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ipv6: String,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsQueryEntry {
    pub answers: Vec<DnsAnswerEntry>,
    pub engine: String,
    pub failure: Option<String>,
    pub hostname: String,
    pub query_type: String,
    pub resolver_hostname: Option<String>,
    pub resolver_port: Option<String>,
    pub resolver_address: String,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpTor {
    pub exit_ip: Option<String>,
    pub exit_name: Option<String>,
    pub is_tor: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestEntry {
    pub body: MaybeBinaryValue,
    pub body_is_truncated: bool,
    pub headers_list: Vec<HttpHeader>,
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    pub method: String,
    pub tor: HttpTor,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseEntry {
    pub body: MaybeBinaryValue,
    pub body_is_truncated: bool,
    pub code: i64,
    pub headers_list: Vec<HttpHeader>,
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    /// `Location` header values; not archived.
    #[serde(skip)]
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub failure: Option<String>,
    pub request: HttpRequestEntry,
    pub response: HttpResponseEntry,
    pub t: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub address: String,
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub num_bytes: i64,
    pub operation: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub proto: String,
    pub t: f64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsHandshake {
    pub cipher_suite: String,
    pub failure: Option<String>,
    pub negotiated_protocol: String,
    pub no_tls_verify: bool,
    pub peer_certificates: Vec<MaybeBinaryValue>,
    pub server_name: String,
    pub t: f64,
    pub tls_version: String,
}

// ============================================================================
// Builders
// ============================================================================

/// One entry per `connect` over TCP. Entries whose address cannot be split
/// into IP and numeric port are skipped.
#[must_use]
pub fn new_tcp_connect_list(begin: DateTime<Utc>, events: &[Event]) -> Vec<TcpConnectEntry> {
    events
        .iter()
        .filter(|ev| ev.name == EventName::Connect && ev.proto == "tcp")
        .filter_map(|ev| {
            let (ip, port) = split_host_port(&ev.address)?;
            let port = port.parse::<u16>().ok()?;
            Some(TcpConnectEntry {
                ip,
                port,
                status: TcpConnectStatus {
                    blocked: None,
                    failure: new_failure(ev.err.as_ref()),
                    success: ev.err.is_none(),
                },
                t: seconds_since(begin, ev.time),
            })
        })
        .collect()
}

fn ip_of_type(query_type: &str, addr: &str) -> bool {
    match query_type {
        "A" => addr.parse::<Ipv4Addr>().is_ok(),
        "AAAA" => addr.parse::<Ipv6Addr>().is_ok(),
        _ => false,
    }
}

/// One `A` and one `AAAA` entry per `resolve_done`, each present only if it
/// has answers or the resolution failed.
#[must_use]
pub fn new_dns_queries_list(
    begin: DateTime<Utc>,
    events: &[Event],
    asn: &dyn AsnLookup,
) -> Vec<DnsQueryEntry> {
    let mut out = Vec::new();
    for ev in events.iter().filter(|ev| ev.name == EventName::ResolveDone) {
        for query_type in ["A", "AAAA"] {
            let answers: Vec<DnsAnswerEntry> = ev
                .addresses
                .iter()
                .filter(|addr| ip_of_type(query_type, addr))
                .map(|addr| {
                    let (number, org) = match asn.lookup_asn(addr) {
                        Ok(info) => (info.number, info.organization),
                        Err(err) => {
                            debug!(address = %addr, %err, "asn lookup failed");
                            (0, String::new())
                        }
                    };
                    let mut answer = DnsAnswerEntry {
                        asn: number,
                        as_org_name: org,
                        answer_type: query_type.to_string(),
                        ..Default::default()
                    };
                    if query_type == "A" {
                        answer.ipv4 = addr.clone();
                    } else {
                        answer.ipv6 = addr.clone();
                    }
                    answer
                })
                .collect();
            if answers.is_empty() && ev.err.is_none() {
                continue;
            }
            out.push(DnsQueryEntry {
                answers,
                engine: ev.proto.clone(),
                failure: new_failure(ev.err.as_ref()),
                hostname: ev.hostname.clone(),
                query_type: query_type.to_string(),
                resolver_address: ev.address.clone(),
                t: seconds_since(begin, ev.time),
                ..Default::default()
            });
        }
    }
    out
}

fn add_headers(
    source: &[(String, Vec<u8>)],
    list: &mut Vec<HttpHeader>,
    map: &mut BTreeMap<String, MaybeBinaryValue>,
) {
    for (key, value) in source {
        let value = MaybeBinaryValue(value.clone());
        map.entry(key.clone()).or_insert_with(|| value.clone());
        list.push(HttpHeader {
            key: key.clone(),
            value,
        });
    }
    list.sort_by(|a, b| a.key.cmp(&b.key));
}

/// Rebuild HTTP transactions from their events, most recent first.
#[must_use]
pub fn new_request_list(begin: DateTime<Utc>, events: &[Event]) -> Vec<RequestEntry> {
    let mut out = Vec::new();
    let mut entry = RequestEntry::default();
    for ev in events {
        match ev.name {
            EventName::HttpTransactionStart => {
                entry = RequestEntry {
                    t: seconds_since(begin, ev.time),
                    ..Default::default()
                };
            }
            EventName::HttpRequestBodySnapshot => {
                entry.request.body = MaybeBinaryValue(ev.data.clone());
                entry.request.body_is_truncated = ev.data_is_truncated;
            }
            EventName::HttpRequestMetadata => {
                add_headers(
                    &ev.http_headers,
                    &mut entry.request.headers_list,
                    &mut entry.request.headers,
                );
                entry.request.method = ev.http_method.clone();
                entry.request.url = ev.http_url.clone();
            }
            EventName::HttpResponseMetadata => {
                add_headers(
                    &ev.http_headers,
                    &mut entry.response.headers_list,
                    &mut entry.response.headers,
                );
                entry.response.code = ev.http_status_code;
                entry.response.locations = ev
                    .http_headers
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case("location"))
                    .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                    .collect();
            }
            EventName::HttpResponseBodySnapshot => {
                entry.response.body = MaybeBinaryValue(ev.data.clone());
                entry.response.body_is_truncated = ev.data_is_truncated;
            }
            EventName::HttpTransactionDone => {
                entry.failure = new_failure(ev.err.as_ref());
                out.insert(0, std::mem::take(&mut entry));
            }
            _ => {}
        }
    }
    out
}

/// One network event per trace event.
#[must_use]
pub fn new_network_events_list(begin: DateTime<Utc>, events: &[Event]) -> Vec<NetworkEvent> {
    events
        .iter()
        .map(|ev| {
            let mut out = NetworkEvent {
                failure: new_failure(ev.err.as_ref()),
                operation: ev.name.as_str().to_string(),
                t: seconds_since(begin, ev.time),
                ..Default::default()
            };
            match ev.name {
                EventName::Connect => {
                    out.address = ev.address.clone();
                    out.proto = ev.proto.clone();
                }
                EventName::Read | EventName::Write => {
                    out.address = ev.address.clone();
                    out.proto = ev.proto.clone();
                    out.num_bytes = i64::try_from(ev.num_bytes).unwrap_or(i64::MAX);
                }
                _ => {}
            }
            out
        })
        .collect()
}

/// One entry per completed TLS handshake.
#[must_use]
pub fn new_tls_handshakes_list(begin: DateTime<Utc>, events: &[Event]) -> Vec<TlsHandshake> {
    events
        .iter()
        .filter(|ev| ev.name == EventName::TlsHandshakeDone)
        .map(|ev| TlsHandshake {
            cipher_suite: ev.tls_cipher_suite.clone(),
            failure: new_failure(ev.err.as_ref()),
            negotiated_protocol: ev.tls_negotiated_proto.clone(),
            no_tls_verify: ev.no_tls_verify,
            peer_certificates: ev
                .tls_peer_certs
                .iter()
                .map(|cert| MaybeBinaryValue(cert.clone()))
                .collect(),
            server_name: ev.tls_server_name.clone(),
            t: seconds_since(begin, ev.time),
            tls_version: ev.tls_version.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::{AsnTable, NoAsnDatabase};
    use crate::netx::errorx::{ErrWrapper, failure};
    use chrono::Duration;

    fn at(begin: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        begin + Duration::milliseconds(millis)
    }

    fn eof() -> NetError {
        NetError::other("EOF")
    }

    fn nxdomain() -> NetError {
        NetError::Wrapped(ErrWrapper {
            failure: failure::DNS_NXDOMAIN_ERROR.into(),
            operation: String::new(),
            wrapped: None,
        })
    }

    fn connect_events(begin: DateTime<Utc>) -> Vec<Event> {
        vec![
            Event {
                addresses: vec!["8.8.8.8".into(), "8.8.4.4".into()],
                hostname: "dns.google.com".into(),
                time: at(begin, 100),
                ..Event::now(EventName::ResolveDone)
            },
            Event {
                address: "8.8.8.8:853".into(),
                proto: "tcp".into(),
                time: at(begin, 130),
                ..Event::now(EventName::Connect)
            },
            Event {
                address: "8.8.4.4:53".into(),
                err: Some(eof()),
                proto: "tcp".into(),
                time: at(begin, 180),
                ..Event::now(EventName::Connect)
            },
        ]
    }

    #[test]
    fn test_tcp_connect_list() {
        let begin = Utc::now();
        assert!(new_tcp_connect_list(begin, &[]).is_empty());
        let got = new_tcp_connect_list(begin, &connect_events(begin));
        assert_eq!(
            got,
            vec![
                TcpConnectEntry {
                    ip: "8.8.8.8".into(),
                    port: 853,
                    status: TcpConnectStatus {
                        success: true,
                        ..Default::default()
                    },
                    t: 0.13,
                },
                TcpConnectEntry {
                    ip: "8.8.4.4".into(),
                    port: 53,
                    status: TcpConnectStatus {
                        blocked: None,
                        failure: Some("unknown_failure: EOF".into()),
                        success: false,
                    },
                    t: 0.18,
                },
            ]
        );
    }

    #[test]
    fn test_tcp_connect_list_skips_malformed() {
        let begin = Utc::now();
        let events = vec![
            Event {
                address: "8.8.8.8".into(),
                proto: "tcp".into(),
                ..Event::now(EventName::Connect)
            },
            Event {
                address: "8.8.8.8:https".into(),
                proto: "tcp".into(),
                ..Event::now(EventName::Connect)
            },
            Event {
                address: "[2001:4860:4860::8888]:443".into(),
                proto: "tcp".into(),
                ..Event::now(EventName::Connect)
            },
        ];
        let got = new_tcp_connect_list(begin, &events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ip, "2001:4860:4860::8888");
    }

    #[test]
    fn test_request_list_most_recent_first() {
        let begin = Utc::now();
        let ua = vec![("User-Agent".to_string(), b"miniooni/0.1.0-dev".to_vec())];
        let events = vec![
            Event {
                time: at(begin, 10),
                ..Event::now(EventName::HttpTransactionStart)
            },
            Event {
                data: b"deadbeef".to_vec(),
                ..Event::now(EventName::HttpRequestBodySnapshot)
            },
            Event {
                http_headers: ua.clone(),
                http_method: "POST".into(),
                http_url: "https://www.example.com/submit".into(),
                ..Event::now(EventName::HttpRequestMetadata)
            },
            Event {
                http_headers: vec![("Server".to_string(), b"orchestra/0.1.0-dev".to_vec())],
                http_status_code: 200,
                ..Event::now(EventName::HttpResponseMetadata)
            },
            Event {
                data: b"{}".to_vec(),
                ..Event::now(EventName::HttpResponseBodySnapshot)
            },
            Event::now(EventName::HttpTransactionDone),
            Event {
                time: at(begin, 20),
                ..Event::now(EventName::HttpTransactionStart)
            },
            Event {
                http_headers: ua,
                http_method: "GET".into(),
                http_url: "https://www.example.com/result".into(),
                ..Event::now(EventName::HttpRequestMetadata)
            },
            Event {
                err: Some(eof()),
                ..Event::now(EventName::HttpTransactionDone)
            },
        ];
        let got = new_request_list(begin, &events);
        assert_eq!(got.len(), 2);

        assert_eq!(got[0].failure.as_deref(), Some("unknown_failure: EOF"));
        assert_eq!(got[0].request.method, "GET");
        assert_eq!(got[0].request.url, "https://www.example.com/result");
        assert_eq!(got[0].t, 0.02);
        assert_eq!(got[0].response.code, 0);

        assert!(got[1].failure.is_none());
        assert_eq!(got[1].request.method, "POST");
        assert_eq!(got[1].request.body, MaybeBinaryValue::from("deadbeef"));
        assert_eq!(
            got[1].request.headers_list,
            vec![HttpHeader {
                key: "User-Agent".into(),
                value: "miniooni/0.1.0-dev".into(),
            }]
        );
        assert_eq!(got[1].response.code, 200);
        assert_eq!(got[1].response.body, MaybeBinaryValue::from("{}"));
        assert_eq!(
            got[1].response.headers.get("Server"),
            Some(&MaybeBinaryValue::from("orchestra/0.1.0-dev"))
        );
        assert_eq!(got[1].t, 0.01);
    }

    #[test]
    fn test_headers_sorted_and_first_value_in_map() {
        let mut list = Vec::new();
        let mut map = BTreeMap::new();
        let source = vec![
            ("Set-Cookie".to_string(), b"a=1".to_vec()),
            ("Location".to_string(), b"/x".to_vec()),
            ("Set-Cookie".to_string(), b"b=2".to_vec()),
        ];
        add_headers(&source, &mut list, &mut map);
        let keys: Vec<_> = list.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["Location", "Set-Cookie", "Set-Cookie"]);
        assert_eq!(map.get("Set-Cookie"), Some(&MaybeBinaryValue::from("a=1")));
    }

    #[test]
    fn test_dns_queries_list() {
        let begin = Utc::now();
        let mut events = connect_events(begin);
        events[0].address = "1.1.1.1:853".into();
        events[0].proto = "dot".into();
        let got = new_dns_queries_list(begin, &events, &NoAsnDatabase);
        assert_eq!(
            got,
            vec![DnsQueryEntry {
                answers: vec![
                    DnsAnswerEntry {
                        answer_type: "A".into(),
                        ipv4: "8.8.8.8".into(),
                        ..Default::default()
                    },
                    DnsAnswerEntry {
                        answer_type: "A".into(),
                        ipv4: "8.8.4.4".into(),
                        ..Default::default()
                    },
                ],
                engine: "dot".into(),
                hostname: "dns.google.com".into(),
                query_type: "A".into(),
                resolver_address: "1.1.1.1:853".into(),
                t: 0.1,
                ..Default::default()
            }]
        );
    }

    #[test]
    fn test_dns_queries_list_ipv6_with_asn() {
        let begin = Utc::now();
        let events = vec![Event {
            addresses: vec!["2001:4860:4860::8888".into()],
            hostname: "dns.google.com".into(),
            time: at(begin, 200),
            ..Event::now(EventName::ResolveDone)
        }];
        let mut table = AsnTable::default();
        table
            .insert("2001:4860::/32", 15169, "GOOGLE")
            .unwrap();
        let got = new_dns_queries_list(begin, &events, &table);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].query_type, "AAAA");
        assert_eq!(got[0].t, 0.2);
        assert_eq!(got[0].answers[0].asn, 15169);
        assert_eq!(got[0].answers[0].as_org_name, "GOOGLE");
        assert_eq!(got[0].answers[0].ipv6, "2001:4860:4860::8888");
    }

    #[test]
    fn test_dns_queries_list_with_errors() {
        let begin = Utc::now();
        let events = vec![Event {
            err: Some(nxdomain()),
            hostname: "dns.google.com".into(),
            time: at(begin, 200),
            ..Event::now(EventName::ResolveDone)
        }];
        let got = new_dns_queries_list(begin, &events, &NoAsnDatabase);
        let types: Vec<_> = got.iter().map(|q| q.query_type.as_str()).collect();
        assert_eq!(types, vec!["A", "AAAA"]);
        for entry in &got {
            assert!(entry.answers.is_empty());
            assert_eq!(entry.failure.as_deref(), Some(failure::DNS_NXDOMAIN_ERROR));
        }
    }

    #[test]
    fn test_network_events_list() {
        let begin = Utc::now();
        let events = vec![
            Event {
                address: "8.8.8.8:853".into(),
                err: Some(eof()),
                proto: "tcp".into(),
                time: at(begin, 7),
                ..Event::now(EventName::Connect)
            },
            Event {
                address: "8.8.8.8:853".into(),
                err: Some(NetError::Interrupted),
                num_bytes: 7117,
                proto: "tcp".into(),
                time: at(begin, 11),
                ..Event::now(EventName::Read)
            },
            Event {
                time: at(begin, 17),
                ..Event::now(EventName::Close)
            },
        ];
        let got = new_network_events_list(begin, &events);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].operation, "connect");
        assert_eq!(got[0].failure.as_deref(), Some("unknown_failure: EOF"));
        assert_eq!(got[0].t, 0.007);
        assert_eq!(got[1].num_bytes, 7117);
        assert_eq!(
            got[1].failure.as_deref(),
            Some("unknown_failure: context canceled")
        );
        assert_eq!(got[2].operation, "close");
        assert!(got[2].address.is_empty());
        assert!(got[2].failure.is_none());
    }

    #[test]
    fn test_tls_handshakes_list() {
        let begin = Utc::now();
        let events = vec![
            Event {
                time: at(begin, 17),
                ..Event::now(EventName::Close)
            },
            Event {
                err: Some(eof()),
                tls_cipher_suite: "SUITE".into(),
                tls_negotiated_proto: "h2".into(),
                tls_peer_certs: vec![b"deadbeef".to_vec(), b"abad1dea".to_vec()],
                tls_server_name: "x.org".into(),
                tls_version: "TLSv1.3".into(),
                time: at(begin, 55),
                ..Event::now(EventName::TlsHandshakeDone)
            },
        ];
        let got = new_tls_handshakes_list(begin, &events);
        assert_eq!(
            got,
            vec![TlsHandshake {
                cipher_suite: "SUITE".into(),
                failure: Some("unknown_failure: EOF".into()),
                negotiated_protocol: "h2".into(),
                no_tls_verify: false,
                peer_certificates: vec!["deadbeef".into(), "abad1dea".into()],
                server_name: "x.org".into(),
                t: 0.055,
                tls_version: "TLSv1.3".into(),
            }]
        );
    }

    #[test]
    fn test_ext_spec_add_to() {
        let mut m = Measurement::<()>::default();
        EXT_DNS.add_to(&mut m);
        assert_eq!(m.extensions.get("dnst"), Some(&0));
    }

    #[test]
    fn test_new_failure() {
        assert_eq!(new_failure(None), None);
        let refused = NetError::Wrapped(ErrWrapper {
            failure: failure::CONNECTION_REFUSED.into(),
            operation: String::new(),
            wrapped: None,
        });
        assert_eq!(
            new_failure(Some(&refused)).as_deref(),
            Some(failure::CONNECTION_REFUSED)
        );
        let empty = NetError::Wrapped(ErrWrapper {
            failure: String::new(),
            operation: String::new(),
            wrapped: None,
        });
        assert_eq!(
            new_failure(Some(&empty)).as_deref(),
            Some("unknown_failure: errWrapper.Failure is empty")
        );
        let raw = NetError::other("use of closed socket 127.0.0.1:8080->10.0.0.1:22");
        let once = new_failure(Some(&raw));
        assert_eq!(
            once.as_deref(),
            Some("unknown_failure: use of closed socket [scrubbed]->[scrubbed]")
        );
        assert_eq!(new_failure(Some(&raw)), once);
    }

    #[test]
    fn test_new_failed_operation() {
        assert_eq!(new_failed_operation(None), None);
        assert_eq!(
            new_failed_operation(Some(&NetError::Interrupted)).as_deref(),
            Some(UNKNOWN_OPERATION)
        );
        let wrapped = crate::netx::errorx::wrap_error(NetError::Interrupted, "top_level");
        assert_eq!(
            new_failed_operation(Some(&wrapped)).as_deref(),
            Some("top_level")
        );
    }

    #[test]
    fn test_maybe_binary_value_json() {
        let text = MaybeBinaryValue::from("text/plain");
        assert_eq!(serde_json::to_string(&text).unwrap(), r#""text/plain""#);

        let binary = MaybeBinaryValue(vec![0x57, 0xe5, 0x79, 0xfb, 0x00, 0xff]);
        let encoded = serde_json::to_string(&binary).unwrap();
        assert_eq!(encoded, r#"{"data":"V+V5+wD/","format":"base64"}"#);
        let decoded: MaybeBinaryValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, binary);
    }

    #[test]
    fn test_maybe_binary_value_rejects_bad_envelopes() {
        for input in [
            r#"{"data":"V+V5+wD/"}"#,
            r#"{"data":"V+V5+wD/","format":"antani"}"#,
            r#"{"format":"base64"}"#,
            r#"{"data":10,"format":"base64"}"#,
            r#"{"data":"!!!","format":"base64"}"#,
            r#"10"#,
        ] {
            assert!(
                serde_json::from_str::<MaybeBinaryValue>(input).is_err(),
                "{input}"
            );
        }
    }

    #[test]
    fn test_http_header_json() {
        let header = HttpHeader {
            key: "Content-Type".into(),
            value: "text/plain".into(),
        };
        let encoded = serde_json::to_string(&header).unwrap();
        assert_eq!(encoded, r#"["Content-Type","text/plain"]"#);
        let decoded: HttpHeader = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, header);

        for input in [
            "{}",
            "[]",
            "[0,0]",
            r#"["x",[]]"#,
            r#"["x",{}]"#,
            r#"["x",{"format":1}]"#,
            r#"["x","y","z"]"#,
        ] {
            assert!(serde_json::from_str::<HttpHeader>(input).is_err(), "{input}");
        }
    }
}
