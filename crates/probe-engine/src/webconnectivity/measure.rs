//! Probe-side measurement steps, each one a urlgetter run.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::{Host, Url};

use crate::context::Context;
use crate::model::ExperimentCallbacks;
use crate::netx::errorx::operation;
use crate::session::ExperimentSession;
use crate::urlgetter::{self, Getter, Multi, MultiInput};

/// Host of `url` without IPv6 brackets.
pub(crate) fn hostname(url: &Url) -> String {
    match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => String::new(),
    }
}

/// Result of resolving the target's host.
#[derive(Debug, Clone, Default)]
pub struct DnsLookupResult {
    pub test_keys: urlgetter::TestKeys,
    pub failure: Option<String>,
    /// Distinct addresses, in answer order.
    pub addrs: Vec<String>,
}

/// Resolve the host of `url` with the system resolver. An IP host is its
/// own only address.
pub async fn dns_lookup(
    ctx: &Context,
    session: Arc<dyn ExperimentSession>,
    begin: DateTime<Utc>,
    url: &Url,
) -> DnsLookupResult {
    let host = hostname(url);
    let target = match url.host() {
        Some(Host::Ipv6(addr)) => format!("dnslookup://[{addr}]"),
        _ => format!("dnslookup://{host}"),
    };
    let mut getter = Getter::new(session, target);
    getter.begin = Some(begin);
    let (test_keys, _) = getter.get(ctx).await;
    let mut addrs = Vec::new();
    if host.parse::<IpAddr>().is_ok() {
        addrs.push(host);
    }
    let mut seen = BTreeSet::new();
    for answer in test_keys.queries.iter().flat_map(|q| &q.answers) {
        for ip in [&answer.ipv4, &answer.ipv6] {
            if !ip.is_empty() && seen.insert(ip.clone()) {
                addrs.push(ip.clone());
            }
        }
    }
    DnsLookupResult {
        failure: test_keys.failure.clone(),
        test_keys,
        addrs,
    }
}

/// Result of probing every TCP or TLS endpoint.
#[derive(Debug, Clone, Default)]
pub struct ConnectsResult {
    pub attempts: i64,
    pub successes: i64,
    pub test_keys: Vec<urlgetter::TestKeys>,
}

/// Probe `urls` concurrently.
pub async fn connects(
    ctx: &Context,
    session: Arc<dyn ExperimentSession>,
    begin: DateTime<Utc>,
    urls: &[String],
    callbacks: Arc<dyn ExperimentCallbacks>,
) -> ConnectsResult {
    let inputs = urls
        .iter()
        .map(|target| MultiInput {
            config: urlgetter::Config::default(),
            target: target.clone(),
        })
        .collect();
    let multi = Multi {
        begin: Some(begin),
        session,
    };
    let mut outputs = multi.collect(ctx, inputs, "connect", callbacks);
    let mut out = ConnectsResult::default();
    while let Some(output) = outputs.recv().await {
        out.attempts += 1;
        if output.err.is_none() {
            out.successes += 1;
        }
        out.test_keys.push(output.test_keys);
    }
    out
}

/// Fetch `target` following redirects.
pub async fn measure(
    ctx: &Context,
    session: Arc<dyn ExperimentSession>,
    begin: DateTime<Utc>,
    target: &str,
) -> urlgetter::TestKeys {
    let mut getter = Getter::new(session, target);
    getter.begin = Some(begin);
    // The failure is already recorded in the test keys.
    let (test_keys, _) = getter.get(ctx).await;
    test_keys
}

/// The failure of `tk` if it happened while resolving.
#[must_use]
pub fn dns_experiment_failure(tk: &urlgetter::TestKeys) -> Option<String> {
    match tk.failed_operation.as_deref() {
        Some(operation::RESOLVE) => tk.failure.clone(),
        _ => None,
    }
}

/// The failure of `tk` if it happened while connecting, handshaking or
/// in the HTTP round trip.
#[must_use]
pub fn http_experiment_failure(tk: &urlgetter::TestKeys) -> Option<String> {
    match tk.failed_operation.as_deref() {
        Some(operation::CONNECT | operation::TLS_HANDSHAKE | operation::HTTP_ROUND_TRIP) => {
            tk.failure.clone()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterCallbacks;
    use crate::netx::errorx::failure;
    use crate::session::MockableSession;
    use tokio::net::TcpListener;

    fn session() -> Arc<dyn ExperimentSession> {
        Arc::new(MockableSession::default())
    }

    fn failed(op: Option<&str>, failure: Option<&str>) -> urlgetter::TestKeys {
        urlgetter::TestKeys {
            failed_operation: op.map(str::to_string),
            failure: failure.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_dns_experiment_failure() {
        assert_eq!(dns_experiment_failure(&failed(None, None)), None);
        assert_eq!(
            dns_experiment_failure(&failed(Some(operation::RESOLVE), None)),
            None
        );
        assert_eq!(
            dns_experiment_failure(&failed(
                Some(operation::CONNECT),
                Some(failure::CONNECTION_REFUSED)
            )),
            None
        );
        assert_eq!(
            dns_experiment_failure(&failed(
                Some(operation::RESOLVE),
                Some(failure::DNS_NXDOMAIN_ERROR)
            ))
            .as_deref(),
            Some(failure::DNS_NXDOMAIN_ERROR)
        );
    }

    #[test]
    fn test_http_experiment_failure() {
        for op in [
            operation::CONNECT,
            operation::TLS_HANDSHAKE,
            operation::HTTP_ROUND_TRIP,
        ] {
            assert_eq!(
                http_experiment_failure(&failed(Some(op), Some(failure::EOF_ERROR))).as_deref(),
                Some(failure::EOF_ERROR)
            );
        }
        assert_eq!(
            http_experiment_failure(&failed(
                Some(operation::RESOLVE),
                Some(failure::DNS_NXDOMAIN_ERROR)
            )),
            None
        );
        assert_eq!(
            http_experiment_failure(&failed(Some(operation::TOP_LEVEL), Some(failure::INTERRUPTED))),
            None
        );
    }

    #[test]
    fn test_hostname() {
        assert_eq!(hostname(&Url::parse("https://[::1]:443/").unwrap()), "::1");
        assert_eq!(hostname(&Url::parse("http://10.0.0.1/").unwrap()), "10.0.0.1");
        assert_eq!(
            hostname(&Url::parse("http://www.example.com/").unwrap()),
            "www.example.com"
        );
    }

    #[tokio::test]
    async fn test_dns_lookup_of_ip_host() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        let result = dns_lookup(&Context::new(), session(), Utc::now(), &url).await;
        assert!(result.failure.is_none());
        assert_eq!(result.addrs, vec!["127.0.0.1"]);
    }

    #[tokio::test]
    async fn test_dns_lookup_cancelled() {
        let url = Url::parse("http://www.example.com/").unwrap();
        let result = dns_lookup(&Context::cancelled(), session(), Utc::now(), &url).await;
        assert_eq!(result.failure.as_deref(), Some(failure::INTERRUPTED));
        assert!(result.addrs.is_empty());
    }

    #[tokio::test]
    async fn test_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let closed = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };
        let urls = vec![
            format!("tcpconnect://127.0.0.1:{open}"),
            format!("tcpconnect://127.0.0.1:{closed}"),
        ];
        let result = connects(
            &Context::new(),
            session(),
            Utc::now(),
            &urls,
            Arc::new(PrinterCallbacks),
        )
        .await;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.successes, 1);
        let entries: Vec<_> = result
            .test_keys
            .iter()
            .flat_map(|tk| &tk.tcp_connect)
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.port == open && e.status.success));
        assert!(
            entries
                .iter()
                .any(|e| e.port == closed && e.status.failure.as_deref() == Some(failure::CONNECTION_REFUSED))
        );
    }

    #[tokio::test]
    async fn test_measure_cancelled() {
        let tk = measure(
            &Context::cancelled(),
            session(),
            Utc::now(),
            "https://www.example.com/",
        )
        .await;
        assert_eq!(tk.failure.as_deref(), Some(failure::INTERRUPTED));
        assert_eq!(tk.agent, "redirect");
    }
}
