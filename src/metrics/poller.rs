use crate::error::{Cancelled, Error};
use crate::metrics::{MetricsBackend, QueryDescriptor, QueryResult};
use crate::schema::{Granularity, TelemetryRecord};

use tokio::sync::mpsc::Sender;
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::time::Duration;

/// Polls a single query at a fixed interval and sends a telemetry record for each usable sample
#[derive(Debug)]
pub struct Poller<B: MetricsBackend> {
    backend: B,
    granularity: Granularity,
    descriptor: QueryDescriptor,
    interval: Duration,
    sender: Sender<TelemetryRecord>,
}

impl<B: MetricsBackend> Poller<B> {
    pub fn new(
        backend: B,
        granularity: Granularity,
        descriptor: QueryDescriptor,
        interval: Duration,
        sender: Sender<TelemetryRecord>,
    ) -> Poller<B> {
        Poller {
            backend,
            granularity,
            descriptor,
            interval,
            sender,
        }
    }

    /// Polls until the token is cancelled, in which case `Cancelled` is returned. A failed query ends
    /// the poller with that error. If the receiving end of the channel goes away, the poller stops as
    /// if it had been cancelled, since whatever closed the channel is responsible for reporting why.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        log::debug!(
            "Starting {} poller for: {}",
            self.granularity,
            self.descriptor.category
        );
        loop {
            let response = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(Cancelled.into()),
                response = self.backend.query(self.descriptor.expression.as_str(), None) => response,
            };
            let response = match response {
                Ok(r) => r,
                Err(err) => {
                    log::error!(
                        "Query for {} {} failed: {}",
                        self.granularity,
                        self.descriptor.category,
                        err
                    );
                    return Err(err.into());
                }
            };
            for warning in response.warnings.iter() {
                log::warn!(
                    "Query for {} {} returned warning: {}",
                    self.granularity,
                    self.descriptor.category,
                    warning
                );
            }

            let records = self.to_records(response.result);
            if records.is_empty() {
                log::debug!(
                    "No results for {} {}",
                    self.granularity,
                    self.descriptor.category
                );
            }
            for record in records {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                    sent = self.sender.send(record) => if sent.is_err() {
                        log::debug!(
                            "Channel for {} telemetry was closed, stopping poller for: {}",
                            self.granularity,
                            self.descriptor.category
                        );
                        return Err(Cancelled.into());
                    }
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = time::sleep(self.interval) => {}
            }
        }
    }

    fn to_records(&self, result: QueryResult) -> Vec<TelemetryRecord> {
        if let QueryResult::Other(ref result_type) = result {
            log::warn!(
                "Ignoring '{}' result of {} {}",
                result_type,
                self.granularity,
                self.descriptor.category
            );
        }
        let mut records = Vec::new();
        for sample in result.into_samples() {
            if sample.value.is_nan() {
                continue;
            }
            let entity_id = match self.granularity.attribute(&sample.labels) {
                Some(id) => id,
                None => {
                    log::warn!(
                        "Skipping {} {} sample that can't be attributed, labels: {:?}",
                        self.granularity,
                        self.descriptor.category,
                        sample.labels
                    );
                    continue;
                }
            };
            records.push(TelemetryRecord::new(
                entity_id,
                sample.timestamp_millis,
                self.descriptor.category.as_str(),
                self.descriptor.series_name(&sample.labels),
                sample.value,
            ));
        }
        records
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::EntityId;
    use crate::metrics::{QueryError, QueryResponse, Sample};
    use crate::runner::testkit::ScriptedBackend;
    use tokio::runtime;
    use tokio::sync::mpsc;

    fn runtime() -> runtime::Runtime {
        runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn skips_nan_and_unattributable_samples() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let backend = ScriptedBackend::new();
            backend
                .respond(
                    "pods",
                    QueryResponse::vector(vec![
                        Sample::new(&[("namespace", "default"), ("pod", "web-1")], 120_500, 1.5),
                        Sample::new(&[("namespace", "default"), ("pod", "web-2")], 120_500, std::f64::NAN),
                        Sample::new(&[("namespace", "default")], 120_500, 2.0),
                    ]),
                )
                .await;
            let (tx, mut rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let poller = Poller::new(
                backend.clone(),
                Granularity::Pod,
                QueryDescriptor::new("cpu.usage", "pods"),
                Duration::from_secs(55),
                tx,
            );
            let handle = tokio::spawn(poller.run(cancel.clone()));

            let record = rx.recv().await.unwrap();
            assert_eq!(
                TelemetryRecord::new(EntityId::object("default", "web-1"), 120_000, "cpu.usage", "", 1.5),
                record
            );
            time::sleep(Duration::from_millis(20)).await;
            assert!(rx.try_recv().is_err());
            assert_eq!(1, backend.calls("pods").await);

            cancel.cancel();
            assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        });
    }

    #[test]
    fn names_series_by_the_name_label() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let backend = ScriptedBackend::new();
            backend
                .respond(
                    "fs",
                    QueryResponse::vector(vec![
                        Sample::new(&[("instance", "n1"), ("mountpoint", "/")], 60_000, 0.25),
                        Sample::new(&[("instance", "n1"), ("mountpoint", "/var")], 60_000, 0.75),
                    ]),
                )
                .await;
            let (tx, mut rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let poller = Poller::new(
                backend,
                Granularity::Node,
                QueryDescriptor::new("filesystem.usage", "fs").named_by("mountpoint"),
                Duration::from_secs(55),
                tx,
            );
            let handle = tokio::spawn(poller.run(cancel.clone()));

            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert_eq!(EntityId::node("n1"), first.entity_id);
            assert_eq!(first.entity_id, second.entity_id);
            assert_eq!("/", first.name);
            assert_eq!("/var", second.name);

            cancel.cancel();
            let _ = handle.await.unwrap();
        });
    }

    #[test]
    fn polls_again_after_the_interval() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let backend = ScriptedBackend::new();
            backend
                .respond("count", QueryResponse::vector(Vec::new()))
                .await;
            let (tx, _rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let poller = Poller::new(
                backend.clone(),
                Granularity::Cluster,
                QueryDescriptor::new("node.count", "count"),
                Duration::from_millis(10),
                tx,
            );
            let handle = tokio::spawn(poller.run(cancel.clone()));

            time::sleep(Duration::from_millis(100)).await;
            assert!(backend.calls("count").await >= 2);
            cancel.cancel();
            let _ = handle.await.unwrap();
        });
    }

    #[test]
    fn query_failure_ends_the_poller() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let backend = ScriptedBackend::new();
            backend
                .fail("broken", QueryError::Http(503))
                .await;
            let (tx, _rx) = mpsc::channel(8);
            let poller = Poller::new(
                backend,
                Granularity::Cluster,
                QueryDescriptor::new("node.count", "broken"),
                Duration::from_secs(55),
                tx,
            );
            let err = poller.run(CancellationToken::new()).await.unwrap_err();
            assert_eq!(Some(&QueryError::Http(503)), err.as_type::<QueryError>());
        });
    }
}
