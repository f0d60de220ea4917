//! Comparison of the probe's measurement against the control.
//!
//! Every check returns `None` when there is not enough data to decide.
//! An undecided check never turns into a verdict on its own.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::TestKeys;
use super::control::{CONTROL_DNS_NAME_ERROR, ControlResponse};
use super::measure::hostname;
use super::summary::{Summary, summarize};
use crate::netx::dialer::join_host_port;
use crate::netx::errorx::failure;
use crate::urlgetter;

/// Minimum body proportion for bodies to be considered matching.
const BODY_PROPORTION_FACTOR: f64 = 0.7;

/// Title words shorter than this are ignored.
const MIN_TITLE_WORD_LENGTH: usize = 5;

/// Headers too common to tell two servers apart.
const COMMON_HEADERS: &[&str] = &[
    "date",
    "content-type",
    "server",
    "cache-control",
    "vary",
    "set-cookie",
    "location",
    "expires",
    "x-powered-by",
    "content-encoding",
    "last-modified",
    "accept-ranges",
    "pragma",
    "x-frame-options",
    "etag",
    "x-content-type-options",
    "age",
    "via",
    "p3p",
    "x-xss-protection",
    "content-language",
    "cf-ray",
    "strict-transport-security",
    "link",
    "x-varnish",
];

static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<title>([^<]{1,128})</title>")
        .unwrap_or_else(|e| panic!("title pattern: {e}"))
});

/// Whether the probe's resolver agrees with the control's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsConsistency {
    Consistent,
    Inconsistent,
}

/// Outcome of comparing the HTTP measurement with the control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpAnalysisResult {
    pub body_length_match: Option<bool>,
    pub body_proportion: Option<f64>,
    pub status_code_match: Option<bool>,
    #[serde(rename = "header_match")]
    pub headers_match: Option<bool>,
    pub title_match: Option<bool>,
}

/// Everything [`analyze`] concludes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisResult {
    pub dns_consistency: Option<DnsConsistency>,
    pub blocked_endpoints: Vec<String>,
    pub http: HttpAnalysisResult,
    pub summary: Summary,
}

/// Run every check on `tk` and summarize. An unparseable `target`
/// yields an empty result.
#[must_use]
pub fn analyze(target: &str, tk: &TestKeys) -> AnalysisResult {
    let Ok(url) = Url::parse(target) else {
        return AnalysisResult::default();
    };
    let mut scratch = tk.clone();
    scratch.dns_consistency = Some(dns_consistency(&url, tk));
    scratch.http_analysis = http_analysis(&tk.urlgetter, &tk.control);
    AnalysisResult {
        dns_consistency: scratch.dns_consistency,
        blocked_endpoints: blocked_endpoints(tk),
        http: scratch.http_analysis,
        summary: summarize(&scratch),
    }
}

/// Decide whether the probe's DNS answers can be trusted.
#[must_use]
pub fn dns_consistency(url: &Url, tk: &TestKeys) -> DnsConsistency {
    if hostname(url).parse::<IpAddr>().is_ok() {
        return DnsConsistency::Consistent;
    }
    let probe_failure = tk.dns_experiment_failure.as_deref();
    let control_failure = tk.control.dns.failure.as_deref();
    if probe_failure == Some(failure::DNS_NXDOMAIN_ERROR)
        && control_failure == Some(CONTROL_DNS_NAME_ERROR)
    {
        return DnsConsistency::Consistent;
    }
    if probe_failure.is_some() || control_failure.is_some() {
        return DnsConsistency::Inconsistent;
    }
    // Nothing to compare against.
    if tk.control.dns.addrs.is_empty() {
        return DnsConsistency::Consistent;
    }

    let answers = || tk.urlgetter.queries.iter().flat_map(|q| &q.answers);
    let probe_asns: HashSet<i64> = answers()
        .map(|a| i64::from(a.asn))
        .filter(|asn| *asn != 0)
        .collect();
    if tk
        .control
        .dns
        .asns
        .iter()
        .any(|asn| *asn != 0 && probe_asns.contains(asn))
    {
        return DnsConsistency::Consistent;
    }

    let probe_ips: HashSet<&str> = answers()
        .flat_map(|a| [a.ipv4.as_str(), a.ipv6.as_str()])
        .filter(|ip| !ip.is_empty())
        .collect();
    if tk
        .control
        .dns
        .addrs
        .iter()
        .any(|ip| probe_ips.contains(ip.as_str()))
    {
        return DnsConsistency::Consistent;
    }
    DnsConsistency::Inconsistent
}

/// Endpoints the control reached and the probe did not, sorted.
#[must_use]
pub fn blocked_endpoints(tk: &TestKeys) -> Vec<String> {
    let mut out = BTreeSet::new();
    for entry in &tk.urlgetter.tcp_connect {
        let endpoint = join_host_port(&entry.ip, &entry.port.to_string());
        let Some(control) = tk.control.tcp_connect.get(&endpoint) else {
            continue;
        };
        if control.failure.is_none() && entry.status.failure.is_some() {
            out.insert(endpoint);
        }
    }
    out.into_iter().collect()
}

/// Run all HTTP checks.
#[must_use]
pub fn http_analysis(tk: &urlgetter::TestKeys, ctrl: &ControlResponse) -> HttpAnalysisResult {
    let (body_length_match, body_proportion) = http_body_length_checks(tk, ctrl);
    HttpAnalysisResult {
        body_length_match,
        body_proportion,
        status_code_match: http_status_code_match(tk, ctrl),
        headers_match: http_headers_match(tk, ctrl),
        title_match: http_title_match(tk, ctrl),
    }
}

/// Whether the bodies have comparable lengths, and their proportion.
#[must_use]
pub fn http_body_length_checks(
    tk: &urlgetter::TestKeys,
    ctrl: &ControlResponse,
) -> (Option<bool>, Option<f64>) {
    let control = ctrl.http_request.body_length;
    if control <= 0 {
        return (None, None);
    }
    let Some(first) = tk.requests.first() else {
        return (None, None);
    };
    let response = &first.response;
    if response.body_is_truncated {
        return (None, None);
    }
    let measurement = response.body.as_bytes().len() as i64;
    if measurement <= 0 {
        return (None, None);
    }
    let proportion = if measurement >= control {
        control as f64 / measurement as f64
    } else {
        measurement as f64 / control as f64
    };
    (Some(proportion > BODY_PROPORTION_FACTOR), Some(proportion))
}

/// Whether the final status codes agree. A 5xx from the control is its
/// own problem and leaves the check undecided.
#[must_use]
pub fn http_status_code_match(tk: &urlgetter::TestKeys, ctrl: &ControlResponse) -> Option<bool> {
    let control = ctrl.http_request.status_code;
    let measurement = tk.requests.first()?.response.code;
    if control == 0 || measurement == 0 {
        return None;
    }
    if control == measurement {
        return Some(true);
    }
    if control / 100 == 5 {
        return None;
    }
    Some(false)
}

fn uncommon_header_keys<'a>(keys: impl Iterator<Item = &'a String>) -> BTreeSet<String> {
    keys.map(|k| k.to_ascii_lowercase())
        .filter(|k| !COMMON_HEADERS.contains(&k.as_str()))
        .collect()
}

/// Whether both sides saw the same set of uncommon header names.
#[must_use]
pub fn http_headers_match(tk: &urlgetter::TestKeys, ctrl: &ControlResponse) -> Option<bool> {
    let response = &tk.requests.first()?.response;
    if response.code == 0 || ctrl.http_request.status_code == 0 {
        return None;
    }
    let measurement = uncommon_header_keys(response.headers.keys());
    let control = uncommon_header_keys(ctrl.http_request.headers.keys());
    Some(measurement == control)
}

fn title_words(title: &str) -> BTreeSet<String> {
    title
        .split(' ')
        .filter(|w| w.len() >= MIN_TITLE_WORD_LENGTH)
        .map(str::to_lowercase)
        .collect()
}

/// Whether the page titles share all their significant words.
#[must_use]
pub fn http_title_match(tk: &urlgetter::TestKeys, ctrl: &ControlResponse) -> Option<bool> {
    let response = &tk.requests.first()?.response;
    if response.code == 0 || response.body_is_truncated || ctrl.http_request.status_code == 0 {
        return None;
    }
    let control = &ctrl.http_request.title;
    if control.is_empty() {
        return None;
    }
    let body = String::from_utf8_lossy(response.body.as_bytes());
    let measurement = TITLE_RE.captures(&body)?.get(1)?.as_str().to_string();
    Some(title_words(&measurement) == title_words(control))
}
