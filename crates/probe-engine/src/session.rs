//! The session an experiment runs in.
//!
//! Experiments only see the [`ExperimentSession`] trait: probe metadata,
//! the ASN database, test helper discovery, the optional proxy and the
//! session-wide byte counter. [`Session`] is the implementation used by
//! the command line tool; [`MockableSession`] lets tests script every
//! answer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::context::Context;
use crate::geoip::{AsnLookup, AsnTable, GeoIpError, NoAsnDatabase};
use crate::netx::bytecounter::ByteCounter;
use crate::netx::errorx::NetError;

/// A test helper service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// What an experiment may ask of its session.
#[async_trait]
pub trait ExperimentSession: Send + Sync {
    /// ASN lookups for archival annotations.
    fn asn_lookup(&self) -> Arc<dyn AsnLookup>;

    /// Session-wide byte accounting.
    fn byte_counter(&self) -> Arc<ByteCounter>;

    /// Client for talking to backend services such as the control.
    fn default_http_client(&self) -> reqwest::Client;

    /// Test helpers registered under `name`.
    fn test_helpers_by_name(&self, name: &str) -> Vec<Service>;

    /// Start the named tunnel unless it is already running. The empty
    /// name means no tunnel.
    async fn maybe_start_tunnel(&self, ctx: &Context, name: &str) -> Result<(), NetError>;

    fn probe_asn(&self) -> u32;

    fn probe_asn_string(&self) -> String {
        format!("AS{}", self.probe_asn())
    }

    fn probe_cc(&self) -> &str;

    /// `socks5://` URL of the running tunnel or configured proxy.
    fn proxy_url(&self) -> Option<Url>;

    fn resolver_ip(&self) -> &str;

    fn software_name(&self) -> &str;

    fn software_version(&self) -> &str;

    /// How long the tunnel took to start; zero without a tunnel.
    fn tunnel_bootstrap_time(&self) -> Duration;

    fn user_agent(&self) -> String {
        format!("{}/{}", self.software_name(), self.software_version())
    }
}

// ============================================================================
// Real session
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot load ASN database: {0}")]
    AsnDatabase(#[from] GeoIpError),

    #[error("cannot create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("unsupported proxy URL: {0}")]
    Proxy(String),
}

/// Settings for a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub software_name: String,
    pub software_version: String,
    pub probe_asn: u32,
    pub probe_cc: String,
    /// Address of the resolver the probe uses, if known.
    pub resolver_ip: String,
    /// `socks5://` proxy used when an experiment asks for the `socks5`
    /// tunnel.
    pub proxy_url: Option<Url>,
    /// YAML prefix table for ASN lookups.
    pub asn_database: Option<PathBuf>,
    pub test_helpers: HashMap<String, Vec<Service>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            software_name: env!("CARGO_PKG_NAME").to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            probe_asn: 0,
            probe_cc: "ZZ".to_string(),
            resolver_ip: "127.0.0.1".to_string(),
            proxy_url: None,
            asn_database: None,
            test_helpers: HashMap::new(),
        }
    }
}

/// Session backed by static configuration.
pub struct Session {
    config: SessionConfig,
    asn_lookup: Arc<dyn AsnLookup>,
    byte_counter: Arc<ByteCounter>,
    http_client: reqwest::Client,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        if let Some(proxy) = &config.proxy_url {
            if proxy.scheme() != "socks5" {
                return Err(SessionError::Proxy(proxy.to_string()));
            }
        }
        let asn_lookup: Arc<dyn AsnLookup> = match &config.asn_database {
            Some(path) => Arc::new(AsnTable::load(path)?),
            None => Arc::new(NoAsnDatabase),
        };
        let http_client = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{}",
                config.software_name, config.software_version
            ))
            .build()?;
        info!(
            software = %config.software_name,
            probe_cc = %config.probe_cc,
            "session created"
        );
        Ok(Self {
            config,
            asn_lookup,
            byte_counter: Arc::new(ByteCounter::new()),
            http_client,
        })
    }
}

#[async_trait]
impl ExperimentSession for Session {
    fn asn_lookup(&self) -> Arc<dyn AsnLookup> {
        Arc::clone(&self.asn_lookup)
    }

    fn byte_counter(&self) -> Arc<ByteCounter> {
        Arc::clone(&self.byte_counter)
    }

    fn default_http_client(&self) -> reqwest::Client {
        self.http_client.clone()
    }

    fn test_helpers_by_name(&self, name: &str) -> Vec<Service> {
        self.config
            .test_helpers
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    async fn maybe_start_tunnel(&self, ctx: &Context, name: &str) -> Result<(), NetError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        match name {
            "" => Ok(()),
            "socks5" if self.config.proxy_url.is_some() => {
                debug!("using configured socks5 proxy as tunnel");
                Ok(())
            }
            "socks5" => Err(NetError::other("socks5 tunnel requires a proxy URL")),
            other => Err(NetError::other(format!("unsupported tunnel: {other}"))),
        }
    }

    fn probe_asn(&self) -> u32 {
        self.config.probe_asn
    }

    fn probe_cc(&self) -> &str {
        &self.config.probe_cc
    }

    fn proxy_url(&self) -> Option<Url> {
        self.config.proxy_url.clone()
    }

    fn resolver_ip(&self) -> &str {
        &self.config.resolver_ip
    }

    fn software_name(&self) -> &str {
        &self.config.software_name
    }

    fn software_version(&self) -> &str {
        &self.config.software_version
    }

    fn tunnel_bootstrap_time(&self) -> Duration {
        Duration::ZERO
    }
}

// ============================================================================
// Mockable session
// ============================================================================

/// Session whose every answer comes from its public fields.
#[derive(Clone)]
pub struct MockableSession {
    pub asn_lookup: Arc<dyn AsnLookup>,
    pub byte_counter: Arc<ByteCounter>,
    pub http_client: reqwest::Client,
    pub test_helpers: HashMap<String, Vec<Service>>,
    /// Returned by `maybe_start_tunnel`.
    pub maybe_start_tunnel_err: Option<NetError>,
    pub probe_asn: u32,
    pub probe_cc: String,
    pub proxy_url: Option<Url>,
    pub resolver_ip: String,
    pub tunnel_bootstrap_time: Duration,
}

impl Default for MockableSession {
    fn default() -> Self {
        Self {
            asn_lookup: Arc::new(NoAsnDatabase),
            byte_counter: Arc::new(ByteCounter::new()),
            http_client: reqwest::Client::new(),
            test_helpers: HashMap::new(),
            maybe_start_tunnel_err: None,
            probe_asn: 0,
            probe_cc: "ZZ".to_string(),
            proxy_url: None,
            resolver_ip: String::new(),
            tunnel_bootstrap_time: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ExperimentSession for MockableSession {
    fn asn_lookup(&self) -> Arc<dyn AsnLookup> {
        Arc::clone(&self.asn_lookup)
    }

    fn byte_counter(&self) -> Arc<ByteCounter> {
        Arc::clone(&self.byte_counter)
    }

    fn default_http_client(&self) -> reqwest::Client {
        self.http_client.clone()
    }

    fn test_helpers_by_name(&self, name: &str) -> Vec<Service> {
        self.test_helpers.get(name).cloned().unwrap_or_default()
    }

    async fn maybe_start_tunnel(&self, _ctx: &Context, _name: &str) -> Result<(), NetError> {
        match &self.maybe_start_tunnel_err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn probe_asn(&self) -> u32 {
        self.probe_asn
    }

    fn probe_cc(&self) -> &str {
        &self.probe_cc
    }

    fn proxy_url(&self) -> Option<Url> {
        self.proxy_url.clone()
    }

    fn resolver_ip(&self) -> &str {
        &self.resolver_ip
    }

    fn software_name(&self) -> &str {
        "probe-engine-tests"
    }

    fn software_version(&self) -> &str {
        "0.0.1"
    }

    fn tunnel_bootstrap_time(&self) -> Duration {
        self.tunnel_bootstrap_time
    }
}
