//! Client for the Web Connectivity control service.
//!
//! The control measures the same target from an uncensored vantage point.
//! Its answer is the baseline every probe-side observation is compared to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::Context;
use crate::geoip::AsnLookup;
use crate::netx::dialer::join_host_port;
use crate::netx::errorx::{NetError, maybe_wrap, operation};
use crate::session::ExperimentSession;
use crate::urlgetter;

/// Failure string the control uses when the domain does not exist.
pub const CONTROL_DNS_NAME_ERROR: &str = "NXDOMAIN";

/// Headers the control accepts, in their canonical form.
const FORWARDED_HEADERS: &[&str] = &["User-Agent", "Accept", "Accept-Language"];

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid control URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("control returned HTTP status {0}")]
    Status(u16),

    #[error("cannot parse control response: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ControlError> for NetError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Http(e) if e.is_timeout() => NetError::DeadlineExceeded,
            other => NetError::other(other.to_string()),
        }
    }
}

/// What we ask the control to measure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub http_request: String,
    pub http_request_headers: BTreeMap<String, Vec<String>>,
    pub tcp_connect: Vec<String>,
}

impl ControlRequest {
    /// Build the request for `target` from what the probe measured: the
    /// headers of the first request and every distinct TCP endpoint.
    #[must_use]
    pub fn new(target: &str, result: &urlgetter::TestKeys) -> Self {
        let mut out = Self {
            http_request: target.to_string(),
            ..Default::default()
        };
        if let Some(first) = result.requests.first() {
            for key in FORWARDED_HEADERS {
                if let Some(value) = first.request.headers.get(*key) {
                    out.http_request_headers
                        .insert((*key).to_string(), vec![value.to_string()]);
                }
            }
        }
        let endpoints: BTreeSet<String> = result
            .tcp_connect
            .iter()
            .map(|entry| join_host_port(&entry.ip, &entry.port.to_string()))
            .collect();
        out.tcp_connect = endpoints.into_iter().collect();
        out
    }
}

/// The control's view of one TCP endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTcpConnectResult {
    pub status: bool,
    pub failure: Option<String>,
}

/// The control's view of the HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlHttpRequestResult {
    pub body_length: i64,
    pub failure: Option<String>,
    pub title: String,
    pub headers: BTreeMap<String, String>,
    pub status_code: i64,
}

/// The control's view of the DNS resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlDnsResult {
    pub failure: Option<String>,
    pub addrs: Vec<String>,
    /// ASNs of `addrs` according to the probe's database.
    #[serde(rename = "x_asns")]
    pub asns: Vec<i64>,
}

impl ControlDnsResult {
    /// Replace `asns` with one entry per address, zero when unknown.
    pub fn fill_asns(&mut self, lookup: &dyn AsnLookup) {
        self.asns = self
            .addrs
            .iter()
            .map(|ip| lookup.lookup_asn(ip).map_or(0, |info| i64::from(info.number)))
            .collect();
    }
}

/// Everything the control reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlResponse {
    pub tcp_connect: BTreeMap<String, ControlTcpConnectResult>,
    pub http_request: ControlHttpRequestResult,
    pub dns: ControlDnsResult,
}

async fn post_json(
    client: &reqwest::Client,
    address: &str,
    request: &ControlRequest,
) -> Result<ControlResponse, ControlError> {
    let url = url::Url::parse(address)?.join("/")?;
    let resp = client.post(url).json(request).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ControlError::Status(status.as_u16()));
    }
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Ask the control at `address` to measure `request`.
///
/// The response is returned even on failure, as far as it got, with
/// ASNs filled from the session's database. The error is always wrapped
/// at the `top_level` operation.
pub async fn control(
    ctx: &Context,
    session: &dyn ExperimentSession,
    address: &str,
    request: &ControlRequest,
) -> (ControlResponse, Result<(), NetError>) {
    let client = session.default_http_client();
    debug!(%address, endpoints = request.tcp_connect.len(), "contacting control");
    let res = ctx
        .run(async {
            post_json(&client, address, request)
                .await
                .map_err(NetError::from)
        })
        .await;
    let (mut out, res) = match maybe_wrap(res, operation::TOP_LEVEL) {
        Ok(out) => (out, Ok(())),
        Err(err) => {
            warn!(%address, error = %err, "control request failed");
            (ControlResponse::default(), Err(err))
        }
    };
    out.dns.fill_asns(session.asn_lookup().as_ref());
    (out, res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archival::{MaybeBinaryValue, RequestEntry, TcpConnectEntry};
    use crate::geoip::AsnTable;
    use crate::netx::errorx::failure;
    use crate::session::MockableSession;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response with `status` and `body`, returning the
    /// base URL and a handle resolving to the raw request.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(idx) = text.find("\r\n\r\n") {
                    let length = text[..idx]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= idx + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_new_control_request_empty() {
        let req = ControlRequest::new("", &urlgetter::TestKeys::default());
        assert!(req.http_request.is_empty());
        assert!(req.http_request_headers.is_empty());
        assert!(req.tcp_connect.is_empty());
    }

    #[test]
    fn test_new_control_request() {
        let mut result = urlgetter::TestKeys::default();
        let mut entry = RequestEntry::default();
        for (k, v) in [
            ("User-Agent", "antani/1.0"),
            ("Accept", "*/*"),
            ("Accept-Language", "en_UK"),
            ("Host", "www.example.com"),
        ] {
            entry
                .request
                .headers
                .insert(k.to_string(), MaybeBinaryValue::from(v));
        }
        result.requests.push(entry);
        for (ip, port) in [("10.0.0.1", 80), ("10.0.0.2", 443), ("10.0.0.1", 80)] {
            result.tcp_connect.push(TcpConnectEntry {
                ip: ip.into(),
                port,
                ..Default::default()
            });
        }
        let req = ControlRequest::new("http://www.example.com/", &result);
        assert_eq!(req.http_request, "http://www.example.com/");
        assert_eq!(req.http_request_headers.len(), 3);
        assert_eq!(req.http_request_headers["User-Agent"], vec!["antani/1.0"]);
        assert!(!req.http_request_headers.contains_key("Host"));
        assert_eq!(req.tcp_connect, vec!["10.0.0.1:80", "10.0.0.2:443"]);
    }

    #[test]
    fn test_fill_asns() {
        let mut dns = ControlDnsResult::default();
        dns.fill_asns(&crate::geoip::NoAsnDatabase);
        assert!(dns.asns.is_empty());

        let mut table = AsnTable::default();
        table.insert("8.8.8.0/24", 15169, "Google LLC").unwrap();
        let mut dns = ControlDnsResult {
            addrs: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            ..Default::default()
        };
        dns.fill_asns(&table);
        assert_eq!(dns.asns, vec![15169, 0]);
        dns.fill_asns(&crate::geoip::NoAsnDatabase);
        assert_eq!(dns.asns, vec![0, 0]);
    }

    #[test]
    fn test_response_json() {
        let raw = r#"{
            "tcp_connect": {"10.0.0.1:443": {"status": true, "failure": null}},
            "http_request": {"body_length": 1024, "failure": null, "title": "Example",
                             "headers": {"Server": "nginx"}, "status_code": 200},
            "dns": {"failure": null, "addrs": ["10.0.0.1"]}
        }"#;
        let resp: ControlResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.tcp_connect["10.0.0.1:443"].status);
        assert_eq!(resp.http_request.status_code, 200);
        assert_eq!(resp.http_request.headers["Server"], "nginx");
        assert!(resp.dns.asns.is_empty());
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v["dns"]["x_asns"].is_array());
    }

    #[tokio::test]
    async fn test_control_success() {
        let (address, server) = serve_once(
            "200 OK",
            r#"{"tcp_connect":{},"http_request":{"status_code":200,"body_length":5},
               "dns":{"failure":null,"addrs":["8.8.8.8"]}}"#,
        )
        .await;
        let mut table = AsnTable::default();
        table.insert("8.8.8.0/24", 15169, "Google LLC").unwrap();
        let session = MockableSession {
            asn_lookup: Arc::new(table),
            ..Default::default()
        };
        let request = ControlRequest {
            http_request: "https://example.com/".into(),
            tcp_connect: vec!["93.184.216.34:443".into()],
            ..Default::default()
        };
        let (resp, res) = control(&Context::new(), &session, &address, &request).await;
        res.unwrap();
        assert_eq!(resp.http_request.status_code, 200);
        assert_eq!(resp.dns.asns, vec![15169]);
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST / HTTP/1.1"));
        assert!(raw.contains(r#""http_request":"https://example.com/""#));
    }

    #[tokio::test]
    async fn test_control_http_error() {
        let (address, _server) = serve_once("500 Internal Server Error", "{}").await;
        let session = MockableSession::default();
        let (resp, res) =
            control(&Context::new(), &session, &address, &ControlRequest::default()).await;
        let err = res.unwrap_err();
        assert_eq!(err.operation(), Some(operation::TOP_LEVEL));
        assert!(err.to_string().starts_with(failure::UNKNOWN_PREFIX));
        assert_eq!(resp, ControlResponse::default());
    }

    #[tokio::test]
    async fn test_control_cancelled() {
        let session = MockableSession::default();
        let (_, res) = control(
            &Context::cancelled(),
            &session,
            "https://wcth.example.org",
            &ControlRequest::default(),
        )
        .await;
        let err = res.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(
            crate::archival::new_failure(Some(&err)).as_deref(),
            Some(failure::INTERRUPTED)
        );
    }
}
