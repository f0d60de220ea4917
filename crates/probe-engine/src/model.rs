//! Measurement envelope and experiment plumbing.
//!
//! A [`Measurement`] wraps the typed test keys produced by one experiment
//! run together with the metadata needed to interpret them. Experiments
//! implement [`ExperimentMeasurer`] and report progress through
//! [`ExperimentCallbacks`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::Context;
use crate::session::{ExperimentSession, Service};

/// Version of the measurement envelope.
pub const DATA_FORMAT_VERSION: &str = "0.2.0";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One measurement as submitted to a collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurement<TK> {
    pub annotations: BTreeMap<String, String>,
    pub data_format_version: String,
    /// Versions of the data format extensions used by `test_keys`.
    pub extensions: BTreeMap<String, i64>,
    pub input: Option<String>,
    pub measurement_start_time: String,
    pub probe_asn: String,
    pub probe_cc: String,
    pub software_name: String,
    pub software_version: String,
    pub test_helpers: Option<BTreeMap<String, Service>>,
    pub test_keys: TK,
    pub test_name: String,
    pub test_runtime: f64,
    pub test_start_time: String,
    pub test_version: String,
}

impl<TK: Default> Measurement<TK> {
    /// Create an envelope for `input` stamped with the current time.
    #[must_use]
    pub fn new(
        test_name: &str,
        test_version: &str,
        session: &dyn ExperimentSession,
        input: Option<String>,
    ) -> Self {
        let now = format_time(Utc::now());
        Self {
            data_format_version: DATA_FORMAT_VERSION.to_string(),
            input,
            measurement_start_time: now.clone(),
            probe_asn: session.probe_asn_string(),
            probe_cc: session.probe_cc().to_string(),
            software_name: session.software_name().to_string(),
            software_version: session.software_version().to_string(),
            test_name: test_name.to_string(),
            test_start_time: now,
            test_version: test_version.to_string(),
            ..Default::default()
        }
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Receives progress notifications from a running experiment.
pub trait ExperimentCallbacks: Send + Sync {
    /// `percentage` is in `[0, 1]`.
    fn on_progress(&self, percentage: f64, message: &str);
}

/// Logs progress at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrinterCallbacks;

impl ExperimentCallbacks for PrinterCallbacks {
    fn on_progress(&self, percentage: f64, message: &str) {
        info!("{:.0}% - {}", percentage * 100.0, message);
    }
}

/// An experiment that can fill a measurement.
#[async_trait]
pub trait ExperimentMeasurer: Send + Sync {
    type TestKeys: Default + Serialize + Send;
    type Error: std::error::Error + Send + Sync + 'static;

    fn experiment_name(&self) -> &'static str;

    fn experiment_version(&self) -> &'static str;

    /// Run the experiment. `measurement.test_keys` is populated even when
    /// an error is returned, as far as the run got.
    async fn run(
        &self,
        ctx: &Context,
        session: Arc<dyn ExperimentSession>,
        measurement: &mut Measurement<Self::TestKeys>,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> Result<(), Self::Error>;

    /// Create an envelope for `input` and run the experiment on it,
    /// recording the runtime.
    async fn measure(
        &self,
        ctx: &Context,
        session: Arc<dyn ExperimentSession>,
        input: Option<String>,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> (Measurement<Self::TestKeys>, Result<(), Self::Error>) {
        let mut measurement = Measurement::new(
            self.experiment_name(),
            self.experiment_version(),
            session.as_ref(),
            input,
        );
        let start = std::time::Instant::now();
        let res = self.run(ctx, session, &mut measurement, callbacks).await;
        measurement.test_runtime = start.elapsed().as_secs_f64();
        (measurement, res)
    }
}
