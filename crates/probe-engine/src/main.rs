//! Probe Engine binary
//!
//! Runs one experiment and prints the resulting measurement as JSON on
//! stdout. Logs go to stderr.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info, warn};
use url::Url;

use probe_engine::context::Context;
use probe_engine::logging::{self, LogConfig};
use probe_engine::model::{ExperimentCallbacks, ExperimentMeasurer, PrinterCallbacks};
use probe_engine::session::{ExperimentSession, Service, Session, SessionConfig};
use probe_engine::urlgetter::{self, Multi, MultiInput};
use probe_engine::webconnectivity;

#[derive(Parser)]
#[command(
    name = "probe-engine",
    about = "Instrumented network measurements and Web Connectivity analysis",
    version,
    author
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Pretty-print the measurement JSON
    #[arg(long, global = true)]
    pretty: bool,

    /// Probe country code
    #[arg(long, global = true, default_value = "ZZ")]
    probe_cc: String,

    /// Probe autonomous system number
    #[arg(long, global = true, default_value = "0")]
    probe_asn: u32,

    /// YAML prefix table used for ASN lookups
    #[arg(long, global = true)]
    asn_database: Option<PathBuf>,

    /// socks5:// proxy used by the `socks5` tunnel
    #[arg(long, global = true)]
    proxy: Option<Url>,

    /// Overall timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure a single target
    Urlgetter {
        /// http(s)://, dnslookup://, tlshandshake:// or tcpconnect:// URL
        target: String,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run the Web Connectivity experiment on a URL
    WebConnectivity {
        /// URL to measure
        url: String,

        /// Address of the control service
        #[arg(long)]
        helper: Url,
    },

    /// Measure every target listed in a YAML file
    Multi {
        /// YAML list of `{target, config}` entries
        #[arg(long)]
        inputs: PathBuf,
    },
}

/// urlgetter settings as command line flags.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Static resolution in the form "IP domain"
    #[arg(long, default_value = "")]
    dns_cache: String,

    /// Report a final status code >= 400 as a failure
    #[arg(long)]
    fail_on_http_error: bool,

    /// Override the Host header
    #[arg(long, default_value = "")]
    http_host: String,

    /// HTTP method
    #[arg(long, default_value = "")]
    method: String,

    /// Do not follow redirects
    #[arg(long)]
    no_follow_redirects: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    no_tls_verify: bool,

    /// Fail resolutions returning bogon addresses
    #[arg(long)]
    reject_dns_bogons: bool,

    /// Resolver URL, e.g. udp://8.8.8.8:53 or doh://google
    #[arg(long, default_value = "")]
    resolver_url: String,

    /// SNI to send instead of the target's host
    #[arg(long, default_value = "")]
    tls_server_name: String,

    /// Tunnel to start before measuring
    #[arg(long, default_value = "")]
    tunnel: String,
}

impl From<ConfigArgs> for urlgetter::Config {
    fn from(args: ConfigArgs) -> Self {
        Self {
            dns_cache: args.dns_cache,
            fail_on_http_error: args.fail_on_http_error,
            http_host: args.http_host,
            method: args.method,
            no_follow_redirects: args.no_follow_redirects,
            no_tls_verify: args.no_tls_verify,
            reject_dns_bogons: args.reject_dns_bogons,
            resolver_url: args.resolver_url,
            tls_server_name: args.tls_server_name,
            tunnel: args.tunnel,
        }
    }
}

/// One line of `multi` output.
#[derive(Serialize)]
struct MultiRecord {
    input: MultiInput,
    failure: Option<String>,
    test_keys: urlgetter::TestKeys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only the first installation wins; a later one is harmless.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    logging::init(&LogConfig {
        level: cli.log_level,
        json: cli.json_logs,
    })?;

    let mut test_helpers = HashMap::new();
    if let Commands::WebConnectivity { helper, .. } = &cli.command {
        test_helpers.insert(
            webconnectivity::TEST_HELPER_NAME.to_string(),
            vec![Service {
                address: helper.to_string(),
                kind: helper.scheme().to_string(),
            }],
        );
    }
    let session: Arc<dyn ExperimentSession> = Arc::new(
        Session::new(SessionConfig {
            probe_asn: cli.probe_asn,
            probe_cc: cli.probe_cc.clone(),
            proxy_url: cli.proxy.clone(),
            asn_database: cli.asn_database.clone(),
            test_helpers,
            ..SessionConfig::default()
        })
        .context("Failed to create session")?,
    );

    let ctx = match cli.timeout {
        Some(secs) => Context::new().with_timeout(Duration::from_secs(secs)),
        None => Context::new(),
    };
    let callbacks: Arc<dyn ExperimentCallbacks> = Arc::new(PrinterCallbacks);

    match cli.command {
        Commands::Urlgetter { target, config } => {
            let measurer = urlgetter::Measurer::new(config.into());
            let (measurement, res) = measurer
                .measure(&ctx, session, Some(target), callbacks)
                .await;
            if let Err(err) = res {
                warn!("urlgetter failed: {err}");
            }
            print_json(&measurement, cli.pretty)?;
        }
        Commands::WebConnectivity { url, .. } => {
            let (measurement, res) = webconnectivity::Measurer
                .measure(&ctx, session, Some(url), callbacks)
                .await;
            if let Err(err) = res {
                warn!("web_connectivity failed: {err}");
            }
            print_json(&measurement, cli.pretty)?;
        }
        Commands::Multi { inputs: path } => {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let inputs: Vec<MultiInput> = serde_yaml::from_str(&data)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("measuring {} inputs", inputs.len());
            let mut outputs = Multi::new(session).collect(&ctx, inputs, "multi", callbacks);
            while let Some(output) = outputs.recv().await {
                let record = MultiRecord {
                    input: output.input,
                    failure: output.err.map(|err| err.to_string()),
                    test_keys: output.test_keys,
                };
                print_json(&record, cli.pretty)?;
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}
