//! Periodic ingestion of telemetry from a metrics backend.
//!
//! `MetricsPipeline` starts one `Poller` for every configured query, and one upsert `Streamer` per
//! granularity that the pollers of that granularity all send to. Everything runs under one
//! cancellation scope. The first failure of any task cancels all the others, and is what the pipeline
//! returns.
mod backend;
mod poller;
mod prometheus;
pub mod query;

pub use self::backend::{MetricsBackend, QueryResponse, QueryResult, Sample};
pub use self::poller::Poller;
pub use self::prometheus::PrometheusClient;
pub use self::query::QueryDescriptor;

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::schema::{Granularity, TelemetryRecord};
use crate::store::{Store, Streamer, UpsertStatement};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use std::fmt::{self, Display};
use std::sync::Arc;

/// Telemetry values are the only column that changes when a sample for an existing key arrives
static TELEMETRY_UPDATES: &[&str] = &["value"];

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The request could not be sent, or the response could not be read
    Transport(String),
    /// Non-success status without an error body
    Http(u16),
    /// The backend rejected the query
    Api { error_type: String, message: String },
    Decode(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryError::Transport(e) => write!(f, "Transport error: {}", e),
            QueryError::Http(status) => write!(f, "Http Error: status {}", status),
            QueryError::Api {
                error_type,
                message,
            } => write!(f, "Query failed with {}: {}", error_type, message),
            QueryError::Decode(e) => write!(f, "Invalid query response: {}", e),
        }
    }
}

impl std::error::Error for QueryError {}

pub struct MetricsPipeline<B: MetricsBackend, S: Store + Clone> {
    backend: Arc<B>,
    store: S,
    config: PipelineConfig,
}

impl<B: MetricsBackend, S: Store + Clone> MetricsPipeline<B, S> {
    pub fn new(backend: B, store: S, config: PipelineConfig) -> MetricsPipeline<B, S> {
        MetricsPipeline {
            backend: Arc::new(backend),
            store,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs until the token is cancelled, which returns `Ok`, or until any poller or streamer fails.
    /// Returns only once every task has exited.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let scope = cancel.child_token();
        let mut tasks = JoinSet::new();

        for granularity in Granularity::ALL.iter().copied() {
            let queries = self.config.queries(granularity);
            if queries.is_empty() {
                continue;
            }
            log::info!(
                "Starting {} {} telemetry pollers",
                queries.len(),
                granularity
            );
            let (tx, rx) = mpsc::channel::<TelemetryRecord>(self.config.channel_capacity);
            let streamer = Streamer::new(
                self.store.clone(),
                UpsertStatement::updating(granularity.table(), TELEMETRY_UPDATES),
                self.config.streamer_config(),
            );
            let token = scope.clone();
            tasks.spawn(async move { streamer.stream(rx, token).await.map(|_| ()) });

            for descriptor in queries {
                let poller = Poller::new(
                    self.backend.clone(),
                    granularity,
                    descriptor.clone(),
                    self.config.poll_interval,
                    tx.clone(),
                );
                tasks.spawn(poller.run(scope.clone()));
            }
        }

        let mut first_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(join_error.into()),
            };
            if let Err(err) = result {
                if err.is_cancelled() || first_error.is_some() {
                    continue;
                }
                log::error!("Stopping metrics pipeline because of error: {}", err);
                scope.cancel();
                first_error = Some(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                log::info!("Metrics pipeline stopped");
                Ok(())
            }
        }
    }
}
