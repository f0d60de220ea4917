//! Final verdict of a Web Connectivity measurement.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use super::TestKeys;
use super::analysis::DnsConsistency;
use crate::netx::errorx::failure;

/// Why a website is considered blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingReason {
    #[serde(rename = "dns")]
    Dns,
    #[serde(rename = "tcp_ip")]
    TcpIp,
    #[serde(rename = "http-diff")]
    HttpDiff,
    #[serde(rename = "http-failure")]
    HttpFailure,
}

impl BlockingReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::TcpIp => "tcp_ip",
            Self::HttpDiff => "http-diff",
            Self::HttpFailure => "http-failure",
        }
    }
}

impl fmt::Display for BlockingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialised as `null`, `false` or the reason string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Blocking {
    /// Not enough data to decide.
    #[default]
    Unknown,
    NotBlocked,
    Blocked(BlockingReason),
}

impl Serialize for Blocking {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown => serializer.serialize_none(),
            Self::NotBlocked => serializer.serialize_bool(false),
            Self::Blocked(reason) => reason.serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockingRepr {
    Flag(bool),
    Reason(BlockingReason),
}

impl<'de> Deserialize<'de> for Blocking {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<BlockingRepr>::deserialize(deserializer)? {
            None => Ok(Self::Unknown),
            Some(BlockingRepr::Flag(false)) => Ok(Self::NotBlocked),
            Some(BlockingRepr::Flag(true)) => Err(serde::de::Error::custom(
                "blocking must be false, null or a reason",
            )),
            Some(BlockingRepr::Reason(reason)) => Ok(Self::Blocked(reason)),
        }
    }
}

impl fmt::Display for Blocking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("nil"),
            Self::NotBlocked => f.write_str("false"),
            Self::Blocked(reason) => reason.fmt(f),
        }
    }
}

/// Blocking verdict plus accessibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub blocking_reason: Option<BlockingReason>,
    #[serde(default)]
    pub blocking: Blocking,
    #[serde(default)]
    pub accessible: Option<bool>,
}

impl Summary {
    /// The website works as expected.
    #[must_use]
    pub fn accessible() -> Self {
        Self {
            blocking_reason: None,
            blocking: Blocking::NotBlocked,
            accessible: Some(true),
        }
    }

    /// The website is blocked for `reason`.
    #[must_use]
    pub fn blocked(reason: BlockingReason) -> Self {
        Self {
            blocking_reason: Some(reason),
            blocking: Blocking::Blocked(reason),
            accessible: Some(false),
        }
    }

    pub fn log(&self) {
        info!(blocking = %self.blocking, accessible = ?self.accessible, "web connectivity summary");
    }
}

/// Decide whether the target is blocked. Rules are tried in order and
/// the first that applies wins.
#[must_use]
pub fn summarize(tk: &TestKeys) -> Summary {
    let requests = &tk.urlgetter.requests;

    // An HTTPS fetch that worked means we talked with the real server,
    // unless a CA in our pool is compromised.
    if let Some(first) = requests.first() {
        if first.failure.is_none() && first.request.url.starts_with("https://") {
            return Summary::accessible();
        }
    }
    if tk.control_failure.is_some() {
        return Summary::default();
    }
    // The website does not exist anymore.
    if tk.dns_experiment_failure.as_deref() == Some(failure::DNS_NXDOMAIN_ERROR)
        && tk.dns_consistency == Some(DnsConsistency::Consistent)
    {
        return Summary::accessible();
    }
    if tk.tcp_connect_attempts > 0 && tk.tcp_connect_successes <= 0 {
        return match tk.dns_consistency {
            Some(DnsConsistency::Consistent) => Summary::blocked(BlockingReason::TcpIp),
            Some(DnsConsistency::Inconsistent) => Summary::blocked(BlockingReason::Dns),
            None => Summary::default(),
        };
    }
    if tk.control.http_request.failure.is_some() {
        return Summary::default();
    }
    let Some(first) = requests.first() else {
        return Summary::default();
    };

    if let Some(err) = &first.failure {
        let reason = match err.as_str() {
            failure::CONNECTION_REFUSED | failure::GENERIC_TIMEOUT_ERROR => {
                Some(BlockingReason::TcpIp)
            }
            failure::CONNECTION_RESET
            | failure::EOF_ERROR
            | failure::SSL_INVALID_HOSTNAME
            | failure::SSL_INVALID_CERTIFICATE
            | failure::SSL_UNKNOWN_AUTHORITY => Some(BlockingReason::HttpFailure),
            failure::DNS_NXDOMAIN_ERROR => Some(BlockingReason::Dns),
            _ => None,
        };
        // With a single hop and a lying resolver, blame the resolver.
        return match reason {
            Some(_)
                if requests.len() == 1
                    && tk.dns_consistency == Some(DnsConsistency::Inconsistent) =>
            {
                Summary::blocked(BlockingReason::Dns)
            }
            Some(reason) => Summary::blocked(reason),
            None => Summary::default(),
        };
    }

    let http = &tk.http_analysis;
    if http.status_code_match == Some(true)
        && (http.body_length_match == Some(true)
            || http.headers_match == Some(true)
            || http.title_match == Some(true))
    {
        return Summary::accessible();
    }
    if tk.dns_consistency == Some(DnsConsistency::Inconsistent) {
        return Summary::blocked(BlockingReason::Dns);
    }
    Summary::blocked(BlockingReason::HttpDiff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archival::RequestEntry;
    use crate::webconnectivity::analysis::HttpAnalysisResult;

    fn request(url: &str, failure: Option<&str>) -> RequestEntry {
        let mut entry = RequestEntry {
            failure: failure.map(str::to_string),
            ..Default::default()
        };
        entry.request.url = url.to_string();
        entry
    }

    fn with_requests(requests: Vec<RequestEntry>) -> TestKeys {
        let mut tk = TestKeys::default();
        tk.urlgetter.requests = requests;
        tk
    }

    fn failed_request(failure: &str) -> TestKeys {
        with_requests(vec![request("http://www.example.com/", Some(failure))])
    }

    #[test]
    fn test_https_success_is_accessible() {
        let mut tk = with_requests(vec![request("https://www.example.com/", None)]);
        tk.control_failure = Some("connection_refused".into());
        tk.tcp_connect_attempts = 7;
        tk.dns_consistency = Some(DnsConsistency::Inconsistent);
        let summary = summarize(&tk);
        assert_eq!(summary, Summary::accessible());
        assert_eq!(summary.blocking, Blocking::NotBlocked);
    }

    #[test]
    fn test_control_failure() {
        let mut tk = TestKeys::default();
        tk.control_failure = Some("connection_refused".into());
        assert_eq!(summarize(&tk), Summary::default());
    }

    #[test]
    fn test_non_existing_website() {
        let mut tk = TestKeys::default();
        tk.dns_experiment_failure = Some(failure::DNS_NXDOMAIN_ERROR.into());
        tk.dns_consistency = Some(DnsConsistency::Consistent);
        assert_eq!(summarize(&tk), Summary::accessible());
    }

    #[test]
    fn test_tcp_total_failure() {
        for (consistency, want) in [
            (
                Some(DnsConsistency::Consistent),
                Summary::blocked(BlockingReason::TcpIp),
            ),
            (
                Some(DnsConsistency::Inconsistent),
                Summary::blocked(BlockingReason::Dns),
            ),
            (None, Summary::default()),
        ] {
            let mut tk = TestKeys::default();
            tk.tcp_connect_attempts = 7;
            tk.tcp_connect_successes = 0;
            tk.dns_consistency = consistency;
            assert_eq!(summarize(&tk), want);
        }
    }

    #[test]
    fn test_control_http_failure_and_no_requests() {
        let mut tk = failed_request(failure::EOF_ERROR);
        tk.control.http_request.failure = Some("connection_refused".into());
        assert_eq!(summarize(&tk), Summary::default());
        assert_eq!(summarize(&TestKeys::default()), Summary::default());
    }

    #[test]
    fn test_request_failures() {
        let cases = [
            (failure::CONNECTION_REFUSED, Some(BlockingReason::TcpIp)),
            (failure::CONNECTION_RESET, Some(BlockingReason::HttpFailure)),
            (failure::DNS_NXDOMAIN_ERROR, Some(BlockingReason::Dns)),
            (failure::EOF_ERROR, Some(BlockingReason::HttpFailure)),
            (failure::GENERIC_TIMEOUT_ERROR, Some(BlockingReason::TcpIp)),
            (failure::SSL_INVALID_HOSTNAME, Some(BlockingReason::HttpFailure)),
            (failure::SSL_INVALID_CERTIFICATE, Some(BlockingReason::HttpFailure)),
            (failure::SSL_UNKNOWN_AUTHORITY, Some(BlockingReason::HttpFailure)),
            ("unknown_failure: antani", None),
        ];
        for (err, reason) in cases {
            let want = reason.map_or_else(Summary::default, Summary::blocked);
            assert_eq!(summarize(&failed_request(err)), want, "{err}");
        }
    }

    #[test]
    fn test_request_failure_with_untrustworthy_dns() {
        let mut tk = failed_request(failure::SSL_UNKNOWN_AUTHORITY);
        tk.dns_consistency = Some(DnsConsistency::Inconsistent);
        assert_eq!(summarize(&tk), Summary::blocked(BlockingReason::Dns));

        tk.urlgetter
            .requests
            .push(request("http://example.com/", None));
        assert_eq!(summarize(&tk), Summary::blocked(BlockingReason::HttpFailure));

        let mut tk = failed_request("unknown_failure: antani");
        tk.dns_consistency = Some(DnsConsistency::Inconsistent);
        assert_eq!(summarize(&tk), Summary::default());
    }

    #[test]
    fn test_http_matches() {
        let matching = [
            HttpAnalysisResult {
                status_code_match: Some(true),
                body_length_match: Some(true),
                ..Default::default()
            },
            HttpAnalysisResult {
                status_code_match: Some(true),
                headers_match: Some(true),
                ..Default::default()
            },
            HttpAnalysisResult {
                status_code_match: Some(true),
                title_match: Some(true),
                ..Default::default()
            },
        ];
        for http in matching {
            let mut tk = with_requests(vec![request("http://www.example.com/", None)]);
            tk.http_analysis = http;
            assert_eq!(summarize(&tk), Summary::accessible());
        }
    }

    #[test]
    fn test_http_diff() {
        let mut tk = with_requests(vec![request("http://www.example.com/", None)]);
        tk.http_analysis = HttpAnalysisResult {
            status_code_match: Some(false),
            body_length_match: Some(true),
            ..Default::default()
        };
        tk.dns_consistency = Some(DnsConsistency::Inconsistent);
        assert_eq!(summarize(&tk), Summary::blocked(BlockingReason::Dns));
        tk.dns_consistency = Some(DnsConsistency::Consistent);
        assert_eq!(summarize(&tk), Summary::blocked(BlockingReason::HttpDiff));
    }

    #[test]
    fn test_summary_json() {
        let v = serde_json::to_value(Summary::default()).unwrap();
        assert!(v["blocking"].is_null());
        assert!(v["accessible"].is_null());
        let v = serde_json::to_value(Summary::accessible()).unwrap();
        assert_eq!(v["blocking"], false);
        assert_eq!(v["accessible"], true);
        let v = serde_json::to_value(Summary::blocked(BlockingReason::TcpIp)).unwrap();
        assert_eq!(v["blocking"], "tcp_ip");
        assert_eq!(v["blocking_reason"], "tcp_ip");

        let back: Summary = serde_json::from_value(v).unwrap();
        assert_eq!(back, Summary::blocked(BlockingReason::TcpIp));
        let bad = serde_json::json!({"blocking": true, "accessible": null});
        assert!(serde_json::from_value::<Summary>(bad).is_err());
    }
}
