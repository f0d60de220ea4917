//! Concurrent fan-out of many [`Getter`]s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::TestKeys;
use super::config::Config;
use super::getter::Getter;
use crate::context::Context;
use crate::model::ExperimentCallbacks;
use crate::netx::errorx::NetError;
use crate::session::ExperimentSession;

/// One target to measure, with its own settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInput {
    #[serde(default)]
    pub config: Config,
    pub target: String,
}

/// Result of measuring one [`MultiInput`].
#[derive(Debug, Clone)]
pub struct MultiOutput {
    pub input: MultiInput,
    pub err: Option<NetError>,
    pub test_keys: TestKeys,
}

/// Runs every input in its own task.
#[derive(Clone)]
pub struct Multi {
    /// Shared origin for the `t` values of every output.
    pub begin: Option<DateTime<Utc>>,
    pub session: Arc<dyn ExperimentSession>,
}

impl Multi {
    #[must_use]
    pub fn new(session: Arc<dyn ExperimentSession>) -> Self {
        Self {
            begin: None,
            session,
        }
    }

    /// Measure all inputs concurrently. The receiver yields exactly one
    /// output per input, in completion order, and closes after the last.
    #[must_use]
    pub fn run(&self, ctx: &Context, inputs: Vec<MultiInput>) -> mpsc::Receiver<MultiOutput> {
        let (tx, rx) = mpsc::channel(inputs.len().max(1));
        for input in inputs {
            let tx = tx.clone();
            let ctx = ctx.clone();
            let getter = Getter {
                begin: self.begin,
                config: input.config.clone(),
                session: Arc::clone(&self.session),
                target: input.target.clone(),
            };
            tokio::spawn(async move {
                let (test_keys, res) = getter.get(&ctx).await;
                let output = MultiOutput {
                    input,
                    err: res.err(),
                    test_keys,
                };
                if tx.send(output).await.is_err() {
                    debug!("multi output dropped: receiver closed");
                }
            });
        }
        rx
    }

    /// Like [`Multi::run`], reporting progress through `callbacks` as each
    /// output completes.
    #[must_use]
    pub fn collect(
        &self,
        ctx: &Context,
        inputs: Vec<MultiInput>,
        label: &str,
        callbacks: Arc<dyn ExperimentCallbacks>,
    ) -> mpsc::Receiver<MultiOutput> {
        let total = inputs.len();
        let mut outputs = self.run(ctx, inputs);
        let (tx, rx) = mpsc::channel(total.max(1));
        let label = label.to_string();
        tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(output) = outputs.recv().await {
                count += 1;
                let status = output
                    .err
                    .as_ref()
                    .map_or_else(|| "ok".to_string(), ToString::to_string);
                callbacks.on_progress(
                    count as f64 / total as f64,
                    &format!("{label}: measure {}: {status}", output.input.target),
                );
                if tx.send(output).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
