//! Web Connectivity: is a website reachable, and if not, why?
//!
//! The probe measures the target itself and asks a control service to do
//! the same from an uncensored network. Comparing the two views tells
//! DNS tampering, TCP/IP blocking, HTTP failures and content manipulation
//! apart.
//!
//! ```text
//!   input URL
//!      |
//!      v
//!   dns_lookup ---------> endpoints ---------> connects (Multi)
//!      |                                           |
//!      v                                           v
//!   measure (Getter) ----> ControlRequest ----> control
//!                                                  |
//!                                                  v
//!                     compute_tcp_blocking -> analyze -> summarize
//! ```

pub mod analysis;
pub mod control;
pub mod endpoints;
pub mod measure;
pub mod summary;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

pub use self::analysis::{AnalysisResult, DnsConsistency, HttpAnalysisResult, analyze};
pub use self::control::{ControlRequest, ControlResponse, ControlTcpConnectResult};
pub use self::summary::{Blocking, BlockingReason, Summary, summarize};

use crate::archival::{self, TcpConnectEntry};
use crate::context::Context;
use crate::model::{ExperimentCallbacks, ExperimentMeasurer, Measurement};
use crate::netx::dialer::join_host_port;
use crate::session::{ExperimentSession, Service};
use crate::urlgetter;

pub const TEST_NAME: &str = "web_connectivity";
pub const TEST_VERSION: &str = "0.1.0";

/// Upper bound on a single measurement.
pub const MAX_RUNTIME: Duration = Duration::from_secs(60);

/// Name under which control services are registered.
pub const TEST_HELPER_NAME: &str = "web-connectivity";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebConnectivityError {
    #[error("no input provided")]
    NoInput,

    #[error("input is not an URL")]
    InputIsNotAnUrl,

    #[error("unsupported input scheme")]
    UnsupportedInput,

    #[error("no available helpers")]
    NoAvailableTestHelpers,
}

/// Result of one Web Connectivity measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestKeys {
    /// The HTTP measurement, plus every DNS query and endpoint probe.
    #[serde(flatten)]
    pub urlgetter: urlgetter::TestKeys,

    pub dns_experiment_failure: Option<String>,
    pub dns_consistency: Option<DnsConsistency>,

    pub client_resolver: String,
    /// Never set; kept for format compatibility.
    pub retries: Option<i64>,
    pub http_experiment_failure: Option<String>,

    #[serde(skip)]
    pub tcp_connect_attempts: i64,
    #[serde(skip)]
    pub tcp_connect_successes: i64,

    pub control_failure: Option<String>,
    #[serde(skip)]
    pub control_request: ControlRequest,
    pub control: ControlResponse,

    #[serde(flatten)]
    pub http_analysis: HttpAnalysisResult,

    #[serde(flatten)]
    pub summary: Summary,
}

/// Mark each probe endpoint the control also tried as blocked when the
/// control connected and the probe did not.
#[must_use]
pub fn compute_tcp_blocking(
    measurement: &[TcpConnectEntry],
    control: &BTreeMap<String, ControlTcpConnectResult>,
) -> Vec<TcpConnectEntry> {
    measurement
        .iter()
        .map(|entry| {
            let mut entry = entry.clone();
            let endpoint = join_host_port(&entry.ip, &entry.port.to_string());
            if let Some(ctrl) = control.get(&endpoint) {
                entry.status.blocked =
                    Some(ctrl.failure.is_none() && entry.status.failure.is_some());
            }
            entry
        })
        .collect()
}

fn prepend<T>(dst: &mut Vec<T>, mut src: Vec<T>) {
    src.append(dst);
    *dst = src;
}

/// The first test helper speaking HTTPS.
fn find_test_helper(session: &dyn ExperimentSession) -> Option<Service> {
    session
        .test_helpers_by_name(TEST_HELPER_NAME)
        .into_iter()
        .find(|th| th.kind == "https")
}

/// The `web_connectivity` experiment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measurer;

#[async_trait]
impl ExperimentMeasurer for Measurer {
    type TestKeys = TestKeys;
    type Error = WebConnectivityError;

    fn experiment_name(&self) -> &'static str {
        TEST_NAME
    }

    fn experiment_version(&self) -> &'static str {
        TEST_VERSION
    }

    async fn run(
        &self,
        ctx: &Context,
        session: Arc<dyn ExperimentSession>,
        measurement: &mut Measurement<TestKeys>,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> Result<(), WebConnectivityError> {
        let ctx = ctx.with_timeout(MAX_RUNTIME);
        let begin = Utc::now();
        urlgetter::register_extensions(measurement);
        let tk = &mut measurement.test_keys;
        tk.client_resolver = session.resolver_ip().to_string();

        let input = measurement
            .input
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(WebConnectivityError::NoInput)?;
        let url = Url::parse(&input).map_err(|_| WebConnectivityError::InputIsNotAnUrl)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(WebConnectivityError::UnsupportedInput);
        }
        let helper = find_test_helper(session.as_ref())
            .ok_or(WebConnectivityError::NoAvailableTestHelpers)?;
        measurement.test_helpers = Some(BTreeMap::from([("backend".to_string(), helper.clone())]));
        let tk = &mut measurement.test_keys;

        let dns = measure::dns_lookup(&ctx, Arc::clone(&session), begin, &url).await;
        tk.dns_experiment_failure = measure::dns_experiment_failure(&dns.test_keys);
        info!(addrs = ?dns.addrs, failure = ?dns.failure, "dns lookup done");

        let urls: Vec<String> = endpoints::new_endpoints(&url, &dns.addrs)
            .into_iter()
            .map(|e| e.urlgetter_url)
            .collect();
        let connects = measure::connects(
            &ctx,
            Arc::clone(&session),
            begin,
            &urls,
            Arc::clone(&callbacks),
        )
        .await;
        tk.tcp_connect_attempts = connects.attempts;
        tk.tcp_connect_successes = connects.successes;
        info!(
            "TCP/TLS endpoints: {}/{} reachable",
            connects.successes, connects.attempts
        );

        let http = measure::measure(&ctx, Arc::clone(&session), begin, &input).await;
        tk.http_experiment_failure = measure::http_experiment_failure(&http);
        callbacks.on_progress(0.5, &format!("{TEST_NAME}: http measurement done"));

        let mut merged = http;
        prepend(&mut merged.queries, dns.test_keys.queries);
        prepend(&mut merged.network_events, dns.test_keys.network_events);
        for ctk in connects.test_keys {
            merged.tcp_connect.extend(ctk.tcp_connect);
            merged.tls_handshakes.extend(ctk.tls_handshakes);
            merged.network_events.extend(ctk.network_events);
        }
        tk.urlgetter = merged;

        tk.control_request = ControlRequest::new(&input, &tk.urlgetter);
        let (control, res) =
            control::control(&ctx, session.as_ref(), &helper.address, &tk.control_request).await;
        tk.control = control;
        tk.control_failure = archival::new_failure(res.as_ref().err());

        tk.urlgetter.tcp_connect =
            compute_tcp_blocking(&tk.urlgetter.tcp_connect, &tk.control.tcp_connect);
        let analysis = analyze(&input, tk);
        tk.dns_consistency = analysis.dns_consistency;
        tk.http_analysis = analysis.http;
        tk.summary = analysis.summary;
        info!(
            dns_consistency = ?tk.dns_consistency,
            blocked_endpoints = ?analysis.blocked_endpoints,
            "analysis done"
        );
        tk.summary.log();
        callbacks.on_progress(1.0, &format!("{TEST_NAME}: {input}: {}", tk.summary.blocking));
        Ok(())
    }
}
