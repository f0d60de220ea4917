//! One measurement from start to archival.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::TestKeys;
use super::config::Config;
use super::configurer::Configurer;
use super::runner::Runner;
use crate::archival;
use crate::context::Context;
use crate::netx::errorx::{NetError, maybe_wrap, operation};
use crate::netx::trace::{Saver, SharedSaver};
use crate::session::ExperimentSession;

/// Measures `target` with `config` in the context of `session`.
pub struct Getter {
    /// Origin for the `t` values in the archival lists. Now, if unset.
    pub begin: Option<DateTime<Utc>>,
    pub config: Config,
    pub session: Arc<dyn ExperimentSession>,
    pub target: String,
}

impl Getter {
    #[must_use]
    pub fn new(session: Arc<dyn ExperimentSession>, target: impl Into<String>) -> Self {
        Self {
            begin: None,
            config: Config::default(),
            session,
            target: target.into(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Perform the measurement.
    ///
    /// The test keys are complete even on failure: `failure` and
    /// `failed_operation` describe the error, which is also returned
    /// wrapped with at least the `top_level` operation.
    pub async fn get(&self, ctx: &Context) -> (TestKeys, Result<(), NetError>) {
        let begin = self.begin.unwrap_or_else(Utc::now);
        let saver: SharedSaver = Arc::new(Saver::new());
        let mut tk = TestKeys {
            agent: if self.config.no_follow_redirects {
                "agent".to_string()
            } else {
                "redirect".to_string()
            },
            dns_cache: vec![self.config.dns_cache.clone()],
            tunnel: self.config.tunnel.clone(),
            ..Default::default()
        };

        let res = maybe_wrap(self.run(ctx, &saver, &mut tk).await, operation::TOP_LEVEL);
        tk.failed_operation = archival::new_failed_operation(res.as_ref().err());
        tk.failure = archival::new_failure(res.as_ref().err());

        let events = saver.drain();
        let asn = self.session.asn_lookup();
        tk.queries
            .extend(archival::new_dns_queries_list(begin, &events, asn.as_ref()));
        tk.network_events
            .extend(archival::new_network_events_list(begin, &events));
        tk.requests.extend(archival::new_request_list(begin, &events));
        tk.tcp_connect
            .extend(archival::new_tcp_connect_list(begin, &events));
        tk.tls_handshakes
            .extend(archival::new_tls_handshakes_list(begin, &events));
        if let Some(first) = tk.requests.first() {
            tk.http_response_status = first.response.code;
            tk.http_response_body = first.response.body.to_string();
            tk.http_response_locations = first.response.locations.clone();
        }

        match &tk.failure {
            Some(failure) => info!(target = %self.target, %failure, "measurement failed"),
            None => debug!(target = %self.target, events = events.len(), "measurement done"),
        }
        (tk, res)
    }

    async fn run(
        &self,
        ctx: &Context,
        saver: &SharedSaver,
        tk: &mut TestKeys,
    ) -> Result<(), NetError> {
        self.session
            .maybe_start_tunnel(ctx, &self.config.tunnel)
            .await?;
        tk.bootstrap_time = self.session.tunnel_bootstrap_time().as_secs_f64();
        let proxy_url = self.session.proxy_url();
        if let Some(url) = &proxy_url {
            tk.socks_proxy = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => String::new(),
            };
        }
        let stack = Configurer {
            config: &self.config,
            proxy_url,
            saver: Arc::clone(saver),
            byte_counter: Some(self.session.byte_counter()),
        }
        .new_configuration()?;
        Runner {
            config: &self.config,
            stack,
            target: &self.target,
        }
        .run(ctx)
        .await
    }
}
