//! Fetch a URL, or probe an endpoint, over the instrumented stack.
//!
//! A target is a URL whose scheme selects the operation:
//!
//! | scheme              | operation                            |
//! |---------------------|--------------------------------------|
//! | `http`, `https`     | HTTP request, redirects followed     |
//! | `dnslookup`         | resolve the host                     |
//! | `tcpconnect`        | connect to `host:port`               |
//! | `tlshandshake`      | connect and handshake to `host:port` |
//!
//! [`Getter`] runs one target and converts the trace into [`TestKeys`];
//! [`Multi`] runs many targets concurrently.

pub mod config;
pub mod configurer;
pub mod getter;
pub mod multi;
pub mod runner;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::config::Config;
pub use self::getter::Getter;
pub use self::multi::{Multi, MultiInput, MultiOutput};

use crate::archival::{
    self, DnsQueryEntry, NetworkEvent, RequestEntry, TcpConnectEntry, TlsHandshake,
};
use crate::context::Context;
use crate::model::{ExperimentCallbacks, ExperimentMeasurer, Measurement};
use crate::netx::errorx::NetError;
use crate::session::ExperimentSession;

pub const TEST_NAME: &str = "urlgetter";
pub const TEST_VERSION: &str = "0.0.1";

/// Result of one urlgetter measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestKeys {
    /// `redirect` when following redirects, `agent` otherwise.
    pub agent: String,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub bootstrap_time: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns_cache: Vec<String>,
    pub failed_operation: Option<String>,
    pub failure: Option<String>,
    pub network_events: Vec<NetworkEvent>,
    pub queries: Vec<DnsQueryEntry>,
    pub requests: Vec<RequestEntry>,
    #[serde(rename = "socksproxy", skip_serializing_if = "String::is_empty", default)]
    pub socks_proxy: String,
    pub tcp_connect: Vec<TcpConnectEntry>,
    pub tls_handshakes: Vec<TlsHandshake>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub tunnel: String,

    /// Status of the first (most recent) response.
    #[serde(skip)]
    pub http_response_status: i64,
    #[serde(skip)]
    pub http_response_body: String,
    #[serde(skip)]
    pub http_response_locations: Vec<String>,
}

fn is_zero(n: &f64) -> bool {
    *n == 0.0
}

/// Declare the data format extensions urlgetter test keys use.
pub fn register_extensions<TK>(measurement: &mut Measurement<TK>) {
    archival::EXT_HTTP.add_to(measurement);
    archival::EXT_DNS.add_to(measurement);
    archival::EXT_NETEVENTS.add_to(measurement);
    archival::EXT_TCP_CONNECT.add_to(measurement);
    archival::EXT_TLS_HANDSHAKE.add_to(measurement);
}

#[derive(Debug, Error)]
pub enum UrlGetterError {
    #[error("no input provided")]
    NoInput,

    #[error(transparent)]
    Measurement(#[from] NetError),
}

/// The `urlgetter` experiment.
#[derive(Debug, Clone, Default)]
pub struct Measurer {
    pub config: Config,
}

impl Measurer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExperimentMeasurer for Measurer {
    type TestKeys = TestKeys;
    type Error = UrlGetterError;

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
    ) -> Result<(), UrlGetterError> {
        let Some(target) = measurement.input.clone().filter(|s| !s.is_empty()) else {
            return Err(UrlGetterError::NoInput);
        };
        register_extensions(measurement);
        let getter = Getter::new(session, target.clone()).with_config(self.config.clone());
        let (tk, res) = getter.get(ctx).await;
        measurement.test_keys = tk;
        let status = res
            .as_ref()
            .err()
            .map_or_else(|| "ok".to_string(), ToString::to_string);
        callbacks.on_progress(1.0, &format!("{TEST_NAME}: measure {target}: {status}"));
        res.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterCallbacks;
    use crate::session::MockableSession;

    #[tokio::test]
    async fn test_measurer_with_cancelled_context() {
        let measurer = Measurer::default();
        let (measurement, res) = measurer
            .measure(
                &Context::cancelled(),
                Arc::new(MockableSession::default()),
                Some("https://www.example.com".into()),
                Arc::new(PrinterCallbacks),
            )
            .await;
        assert!(matches!(res, Err(UrlGetterError::Measurement(ref e)) if e.is_interrupted()));
        assert_eq!(measurement.test_name, TEST_NAME);
        assert_eq!(measurement.test_version, TEST_VERSION);
        assert_eq!(measurement.extensions.get("httpt"), Some(&0));
        assert_eq!(measurement.extensions.get("tcpconnect"), Some(&0));
        assert_eq!(
            measurement.test_keys.failure.as_deref(),
            Some("interrupted")
        );
        assert!(measurement.test_runtime >= 0.0);
    }

    #[tokio::test]
    async fn test_measurer_without_input() {
        let (_, res) = Measurer::default()
            .measure(
                &Context::new(),
                Arc::new(MockableSession::default()),
                None,
                Arc::new(PrinterCallbacks),
            )
            .await;
        assert!(matches!(res, Err(UrlGetterError::NoInput)));
    }

    #[test]
    fn test_test_keys_json() {
        let tk = TestKeys {
            agent: "redirect".into(),
            http_response_status: 200,
            http_response_body: "hello".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&tk).unwrap();
        assert_eq!(v["agent"], "redirect");
        assert!(v["failure"].is_null());
        assert!(v.get("bootstrap_time").is_none());
        assert!(v.get("socksproxy").is_none());
        assert!(v.get("tunnel").is_none());
        assert!(v.get("http_response_status").is_none());
        assert!(v["tcp_connect"].as_array().unwrap().is_empty());

        let tk = TestKeys {
            bootstrap_time: 1.5,
            socks_proxy: "127.0.0.1:9050".into(),
            tunnel: "socks5".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&tk).unwrap();
        assert_eq!(v["bootstrap_time"], 1.5);
        assert_eq!(v["socksproxy"], "127.0.0.1:9050");
        assert_eq!(v["tunnel"], "socks5");
    }
}
