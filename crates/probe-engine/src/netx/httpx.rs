//! Instrumented HTTP/1.1 transport and redirect-following client.
//!
//! The transport speaks HTTP/1.1 with hyper over a connection obtained
//! from the instrumented dialers, so that DNS, TCP and TLS events produced
//! while serving a request land in the same trace as the HTTP events.
//!
//! # Usage
//!
//! ```rust,ignore
//! let txp = stack.new_http_transport()?;
//! let client = HttpClient::new(txp, true);
//! let resp = client.do_request(&ctx, HttpRequest::get(url)).await?;
//! ```

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HOST, HeaderValue};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use reqwest::cookie::{CookieStore, Jar};
use tracing::debug;
use url::Url;

use super::dialer::{BoxConn, SharedDialer, join_host_port};
use super::errorx::{ConfigError, NetError, maybe_wrap, operation};
use super::trace::{Event, EventName, SharedSaver};
use crate::context::Context;

/// Maximum number of body bytes kept in a trace snapshot.
pub const MAX_BODY_SNAPSHOT: usize = 1 << 17;

/// Maximum number of redirects followed by [`HttpClient`].
pub const MAX_REDIRECTS: usize = 10;

/// An HTTP request as seen by the instrumented stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// Overrides the `Host` header when set.
    pub host: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    #[must_use]
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Vec::new(),
            host: None,
            body: Vec::new(),
        }
    }

    /// First value of a header, case-insensitively.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.headers.push((key.to_string(), value.into()));
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Canonicalised header names in wire order.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First value of a header, case-insensitively.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }
}

/// Performs a single HTTP round trip.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn round_trip(&self, ctx: &Context, req: &HttpRequest) -> Result<HttpResponse, NetError>;
}

pub type SharedHttpTransport = Arc<dyn HttpTransport>;

/// `content-type` becomes `Content-Type`.
#[must_use]
pub fn canonical_header_key(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn hyper_error(err: hyper::Error) -> NetError {
    if err.is_incomplete_message() {
        return NetError::other("EOF");
    }
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return NetError::Io {
                kind: io_err.kind(),
                message: io_err.to_string(),
            };
        }
        source = inner.source();
    }
    NetError::other(err.to_string())
}

// ============================================================================
// Base transport
// ============================================================================

/// HTTP/1.1 over the given dialers. One connection per round trip.
pub struct SystemTransport {
    pub dialer: SharedDialer,
    pub tls_dialer: SharedDialer,
}

#[async_trait]
impl HttpTransport for SystemTransport {
    async fn round_trip(&self, ctx: &Context, req: &HttpRequest) -> Result<HttpResponse, NetError> {
        let host = req
            .url
            .host_str()
            .ok_or_else(|| NetError::other(format!("http: no Host in request URL: {}", req.url)))?;
        let port = req
            .url
            .port_or_known_default()
            .ok_or_else(|| NetError::other(format!("http: no port for URL: {}", req.url)))?;
        let address = join_host_port(
            host.trim_start_matches('[').trim_end_matches(']'),
            &port.to_string(),
        );
        let conn = match req.url.scheme() {
            "http" => self.dialer.dial_context(ctx, "tcp", &address).await?,
            "https" => self.tls_dialer.dial_context(ctx, "tcp", &address).await?,
            other => {
                return Err(NetError::other(format!(
                    "unsupported protocol scheme \"{other}\""
                )));
            }
        };
        ctx.run(exchange(conn, req)).await
    }
}

async fn exchange(conn: BoxConn, req: &HttpRequest) -> Result<HttpResponse, NetError> {
    let method = Method::from_bytes(req.method.as_bytes())
        .map_err(|_| ConfigError::InvalidMethod(req.method.clone()))?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn))
        .await
        .map_err(hyper_error)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(%err, "http connection terminated");
        }
    });

    let target = match req.url.query() {
        Some(query) => format!("{}?{query}", req.url.path()),
        None => req.url.path().to_string(),
    };
    let host = match &req.host {
        Some(host) => host.clone(),
        None => match (req.url.host_str(), req.url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        },
    };
    let mut builder = Request::builder().method(method).uri(target).header(HOST, host);
    for (key, value) in &req.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    let request = builder
        .body(Full::new(Bytes::from(req.body.clone())))
        .map_err(|e| NetError::other(format!("http: invalid request: {e}")))?;

    let response = sender.send_request(request).await.map_err(hyper_error)?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (canonical_header_key(k.as_str()), v.as_bytes().to_vec()))
        .collect();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(hyper_error)?
        .to_bytes();
    Ok(HttpResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

/// Tags failures with the `http_round_trip` operation.
///
/// A round trip that never started because the context was already done
/// returns the bare context error.
pub struct ErrorWrapperTransport {
    pub transport: SharedHttpTransport,
}

#[async_trait]
impl HttpTransport for ErrorWrapperTransport {
    async fn round_trip(&self, ctx: &Context, req: &HttpRequest) -> Result<HttpResponse, NetError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        maybe_wrap(
            self.transport.round_trip(ctx, req).await,
            operation::HTTP_ROUND_TRIP,
        )
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Records the transaction, its metadata and body snapshots.
pub struct SaverTransport {
    pub transport: SharedHttpTransport,
    pub saver: SharedSaver,
    pub snapshot_size: usize,
}

impl SaverTransport {
    #[must_use]
    pub fn new(transport: SharedHttpTransport, saver: SharedSaver) -> Self {
        Self {
            transport,
            saver,
            snapshot_size: MAX_BODY_SNAPSHOT,
        }
    }

    fn snapshot(&self, name: EventName, body: &[u8]) {
        let truncated = body.len() > self.snapshot_size;
        let data = body[..body.len().min(self.snapshot_size)].to_vec();
        self.saver.write(Event {
            data,
            data_is_truncated: truncated,
            ..Event::now(name)
        });
    }
}

#[async_trait]
impl HttpTransport for SaverTransport {
    async fn round_trip(&self, ctx: &Context, req: &HttpRequest) -> Result<HttpResponse, NetError> {
        self.saver.write(Event::now(EventName::HttpTransactionStart));
        self.saver.write(Event {
            http_headers: req
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
                .collect(),
            http_method: req.method.clone(),
            http_url: req.url.to_string(),
            ..Event::now(EventName::HttpRequestMetadata)
        });
        if !req.body.is_empty() {
            self.snapshot(EventName::HttpRequestBodySnapshot, &req.body);
        }
        let start = Instant::now();
        let res = self.transport.round_trip(ctx, req).await;
        if let Ok(resp) = &res {
            self.saver.write(Event {
                http_headers: resp.headers.clone(),
                http_status_code: i64::from(resp.status),
                ..Event::now(EventName::HttpResponseMetadata)
            });
            self.snapshot(EventName::HttpResponseBodySnapshot, &resp.body);
        }
        let duration = start.elapsed();
        debug!(
            method = %req.method,
            url = %req.url,
            status = res.as_ref().map(|r| r.status).unwrap_or_default(),
            ?duration,
            "http round trip"
        );
        self.saver.write(Event {
            duration,
            err: res.as_ref().err().cloned(),
            ..Event::now(EventName::HttpTransactionDone)
        });
        res
    }
}

// ============================================================================
// Client
// ============================================================================

/// Follows redirects and keeps a request-scoped cookie jar.
pub struct HttpClient {
    transport: SharedHttpTransport,
    follow_redirects: bool,
    max_redirects: usize,
}

impl HttpClient {
    #[must_use]
    pub fn new(transport: SharedHttpTransport, follow_redirects: bool) -> Self {
        Self {
            transport,
            follow_redirects,
            max_redirects: MAX_REDIRECTS,
        }
    }

    /// Perform `req`, following redirects if enabled. Every call starts
    /// with an empty cookie jar.
    pub async fn do_request(&self, ctx: &Context, req: HttpRequest) -> Result<HttpResponse, NetError> {
        let jar = Jar::default();
        let mut req = req;
        let mut hops = 0;
        loop {
            if let Some(cookies) = jar.cookies(&req.url) {
                if let Ok(value) = cookies.to_str() {
                    req.set_header("Cookie", value);
                }
            }
            let resp = self.transport.round_trip(ctx, &req).await?;
            let set_cookies: Vec<HeaderValue> = resp
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
                .filter_map(|(_, v)| HeaderValue::from_bytes(v).ok())
                .collect();
            jar.set_cookies(&mut set_cookies.iter(), &req.url);

            if !self.follow_redirects || !matches!(resp.status, 301 | 302 | 303 | 307 | 308) {
                return Ok(resp);
            }
            let Some(location) = resp
                .header("Location")
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_string)
            else {
                return Ok(resp);
            };
            if hops >= self.max_redirects {
                return Err(NetError::other(format!(
                    "stopped after {} redirects",
                    self.max_redirects
                )));
            }
            hops += 1;
            let next = req
                .url
                .join(&location)
                .map_err(|e| NetError::other(format!("failed to parse Location header: {e}")))?;
            debug!(from = %req.url, to = %next, status = resp.status, "following redirect");
            if matches!(resp.status, 301 | 302 | 303) && req.method != "HEAD" {
                req.method = "GET".to_string();
                req.body.clear();
            }
            req.url = next;
            req.host = None;
            req.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("cookie"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netx::dialer::SystemDialer;
    use crate::netx::trace::Saver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request(sock: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serves each connection with the response built from the request.
    async fn serve(respond: fn(&str) -> String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let request = read_request(&mut sock).await;
                    let _ = sock.write_all(respond(&request).as_bytes()).await;
                });
            }
        });
        addr
    }

    fn transport(saver: &SharedSaver) -> SharedHttpTransport {
        let system: SharedHttpTransport = Arc::new(SystemTransport {
            dialer: Arc::new(SystemDialer::default()),
            tls_dialer: Arc::new(SystemDialer::default()),
        });
        let wrapped: SharedHttpTransport = Arc::new(ErrorWrapperTransport { transport: system });
        Arc::new(SaverTransport::new(wrapped, Arc::clone(saver)))
    }

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("x-FRAME-options"), "X-Frame-Options");
        assert_eq!(canonical_header_key("etag"), "Etag");
    }

    #[tokio::test]
    async fn test_round_trip_events() {
        let addr = serve(|_| {
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Test: yes\r\nConnection: close\r\n\r\n{}"
                .to_string()
        })
        .await;
        let saver: SharedSaver = Arc::new(Saver::new());
        let url = Url::parse(&format!("http://{addr}/post")).unwrap();
        let mut req = HttpRequest::new("POST", url);
        req.body = b"deadbeef".to_vec();
        let resp = transport(&saver)
            .round_trip(&Context::new(), &req)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"{}");
        assert_eq!(resp.header("x-test"), Some(&b"yes"[..]));

        let names: Vec<_> = saver.read().iter().map(|ev| ev.name).collect();
        assert_eq!(
            names,
            vec![
                EventName::HttpTransactionStart,
                EventName::HttpRequestMetadata,
                EventName::HttpRequestBodySnapshot,
                EventName::HttpResponseMetadata,
                EventName::HttpResponseBodySnapshot,
                EventName::HttpTransactionDone,
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_round_trip_is_not_wrapped() {
        let saver: SharedSaver = Arc::new(Saver::new());
        let req = HttpRequest::get(Url::parse("https://www.example.com/").unwrap());
        let err = transport(&saver)
            .round_trip(&Context::cancelled(), &req)
            .await
            .unwrap_err();
        assert_eq!(err, NetError::Interrupted);
        let events = saver.read();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].name, EventName::HttpTransactionDone);
        assert_eq!(events[2].err, Some(NetError::Interrupted));
    }

    #[tokio::test]
    async fn test_eof_is_wrapped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut sock).await;
        });
        let saver: SharedSaver = Arc::new(Saver::new());
        let req = HttpRequest::get(Url::parse(&format!("http://{addr}/")).unwrap());
        let err = transport(&saver)
            .round_trip(&Context::new(), &req)
            .await
            .unwrap_err();
        assert_eq!(err.operation(), Some(operation::HTTP_ROUND_TRIP));
    }

    #[tokio::test]
    async fn test_snapshot_truncation() {
        let addr = serve(|_| {
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789"
                .to_string()
        })
        .await;
        let saver: SharedSaver = Arc::new(Saver::new());
        let system: SharedHttpTransport = Arc::new(SystemTransport {
            dialer: Arc::new(SystemDialer::default()),
            tls_dialer: Arc::new(SystemDialer::default()),
        });
        let txp = SaverTransport {
            transport: system,
            saver: Arc::clone(&saver),
            snapshot_size: 4,
        };
        let req = HttpRequest::get(Url::parse(&format!("http://{addr}/")).unwrap());
        let resp = txp.round_trip(&Context::new(), &req).await.unwrap();
        assert_eq!(resp.body.len(), 10);
        let snapshot = saver
            .read()
            .into_iter()
            .find(|ev| ev.name == EventName::HttpResponseBodySnapshot)
            .unwrap();
        assert_eq!(snapshot.data, b"0123");
        assert!(snapshot.data_is_truncated);
    }

    #[tokio::test]
    async fn test_redirect_with_cookie() {
        let addr = serve(|request| {
            if request.starts_with("GET /next") {
                let has_cookie = request
                    .lines()
                    .any(|l| l.to_ascii_lowercase().starts_with("cookie: session=1"));
                let body = if has_cookie { "yes" } else { "no" };
                format!("HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\n{body}")
            } else {
                "HTTP/1.1 302 Found\r\nLocation: /next\r\nSet-Cookie: session=1\r\n\
                 Content-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            }
        })
        .await;
        let saver: SharedSaver = Arc::new(Saver::new());
        let client = HttpClient::new(transport(&saver), true);
        let req = HttpRequest::new("POST", Url::parse(&format!("http://{addr}/start")).unwrap());
        let resp = client.do_request(&Context::new(), req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"yes");
        let metadata: Vec<_> = saver
            .read()
            .into_iter()
            .filter(|ev| ev.name == EventName::HttpRequestMetadata)
            .map(|ev| ev.http_method)
            .collect();
        assert_eq!(metadata, vec!["POST", "GET"]);
    }

    #[tokio::test]
    async fn test_no_follow_returns_redirect() {
        let addr = serve(|_| {
            "HTTP/1.1 301 Moved\r\nLocation: /x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string()
        })
        .await;
        let saver: SharedSaver = Arc::new(Saver::new());
        let client = HttpClient::new(transport(&saver), false);
        let req = HttpRequest::get(Url::parse(&format!("http://{addr}/")).unwrap());
        let resp = client.do_request(&Context::new(), req).await.unwrap();
        assert_eq!(resp.status, 301);
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let addr = serve(|_| {
            "HTTP/1.1 302 Found\r\nLocation: /again\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string()
        })
        .await;
        let saver: SharedSaver = Arc::new(Saver::new());
        let client = HttpClient::new(transport(&saver), true);
        let req = HttpRequest::get(Url::parse(&format!("http://{addr}/")).unwrap());
        let err = client.do_request(&Context::new(), req).await.unwrap_err();
        assert_eq!(err.to_string(), "stopped after 10 redirects");
    }
}
