//! Keeps the store in sync with the objects of one resource kind.
//!
//! `run_mirror` wires everything together: the reconciler is warmed up from the store, an informer
//! feeds it notifications from the api server, and `run_reconciler` delivers them one at a time,
//! retrying failed ones with an exponential backoff.
pub mod client;
pub mod informer;
pub mod reconcile;
pub mod resource_map;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::client::{Client, ClusterApi};
pub use self::informer::{FeedEvent, Informer, Notification};
pub use self::reconcile::{Reconciler, SyncError};
pub use self::resource_map::IdSet;

use crate::config::ReconcilerConfig;
use crate::error::Error;
use crate::schema::Resource;
use crate::store::Store;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::mpsc::{self, Receiver};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;

const FEED_CAPACITY: usize = 1024;

/// A notification that failed to sync, waiting to be delivered again
struct PendingRetry {
    notification: Notification,
    backoff: ExponentialBackoff,
    due: Instant,
}

fn retry_backoff(config: &ReconcilerConfig) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.retry_initial,
        max_interval: config.retry_max,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

/// Delivers notifications from the feed to the reconciler until the feed is closed or the token is
/// cancelled.
///
/// A notification that fails to sync is delivered again after a backoff, unless a newer notification
/// for the same key arrives first, in which case only the newer one is delivered. After every complete
/// listing, known objects that are missing from it are deleted.
pub async fn run_reconciler<R, S, A>(
    mut reconciler: Reconciler<R, S, A>,
    mut feed: Receiver<FeedEvent>,
    cancel: CancellationToken,
) where
    R: Resource,
    S: Store,
    A: ClusterApi,
{
    let mut pending: HashMap<String, PendingRetry> = HashMap::new();
    loop {
        let next_due = pending.values().map(|p| p.due).min();
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!(
                    "Reconciler for {} was cancelled with {} pending retries",
                    R::k8s_type(),
                    pending.len()
                );
                return;
            }
            event = feed.recv() => match event {
                Some(FeedEvent::Notification(notification)) => {
                    let backoff = pending.remove(&notification.key).map(|p| p.backoff);
                    if backoff.is_some() {
                        log::debug!("Newer notification for {} supersedes the pending retry", notification.key);
                    }
                    deliver(&mut reconciler, &mut pending, notification, backoff).await;
                }
                Some(FeedEvent::Listed(listed)) => {
                    let mut stale = reconciler.stale(&listed);
                    // retries of objects that no longer exist turn into deletions
                    let gone: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.notification.exists() && !listed.contains(&p.notification.id()))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in gone {
                        if let Some(retry) = pending.remove(&key) {
                            if !stale.iter().any(|n| n.key == key) {
                                stale.push(Notification::deleted(&retry.notification.id()));
                            }
                        }
                    }
                    if !stale.is_empty() {
                        log::info!("Removing {} {} objects that are gone from the listing", stale.len(), R::k8s_type());
                    }
                    for notification in stale {
                        let backoff = pending.remove(&notification.key).map(|p| p.backoff);
                        deliver(&mut reconciler, &mut pending, notification, backoff).await;
                    }
                }
                None => {
                    log::info!(
                        "Feed for {} has ended with {} pending retries, stopping reconciler",
                        R::k8s_type(),
                        pending.len()
                    );
                    return;
                }
            },
            _ = time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, p)| p.due <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    if let Some(retry) = pending.remove(&key) {
                        log::debug!("Retrying sync of {}", key);
                        deliver(&mut reconciler, &mut pending, retry.notification, Some(retry.backoff)).await;
                    }
                }
            }
        }
    }
}

async fn deliver<R, S, A>(
    reconciler: &mut Reconciler<R, S, A>,
    pending: &mut HashMap<String, PendingRetry>,
    notification: Notification,
    backoff: Option<ExponentialBackoff>,
) where
    R: Resource,
    S: Store,
    A: ClusterApi,
{
    let err = match reconciler.sync(&notification).await {
        Ok(()) => return,
        Err(err) => err,
    };
    if !err.is_retryable() {
        log::error!(
            "Failed to sync {} {}, not retrying: {}",
            R::k8s_type(),
            notification.key,
            err
        );
        return;
    }

    let config = reconciler.config();
    let mut backoff = backoff.unwrap_or_else(|| retry_backoff(config));
    let delay = backoff
        .next_backoff()
        .unwrap_or(config.retry_max)
        .min(config.retry_max);
    log::error!(
        "Failed to sync {} {}, retrying in {}ms: {}",
        R::k8s_type(),
        notification.key,
        delay.as_millis(),
        err
    );
    pending.insert(
        notification.key.clone(),
        PendingRetry {
            notification,
            backoff,
            due: Instant::now() + delay,
        },
    );
}

/// Mirrors every object of kind `R` into the store until the token is cancelled. Only returns an
/// error if the warm up fails. Errors after that are logged and retried.
pub async fn run_mirror<R, S, A>(
    api: A,
    store: S,
    config: ReconcilerConfig,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    R: Resource,
    S: Store,
    A: ClusterApi + Clone,
{
    let namespace = config.namespace.clone();
    let mut reconciler = Reconciler::<R, S, A>::new(store, api.clone(), config);
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        warmed = reconciler.warm_up() => { warmed?; }
    }

    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let informer = Informer::new(api, R::k8s_type(), namespace, tx);
    let feed = tokio::spawn(informer.run(cancel.child_token()));

    run_reconciler(reconciler, rx, cancel.clone()).await;
    // the informer stops once its receiver is gone
    if let Err(err) = feed.await {
        log::error!("Feed task for {} failed: {}", R::k8s_type(), err);
    }
    log::info!("Stopped mirroring {}", R::k8s_type());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::EntityId;
    use crate::resource::K8sResource;
    use crate::runner::testkit::{eventually, FakeClusterApi};
    use crate::schema::{Pvc, SqlValue, PVC, PVC_LABEL};
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::runtime;

    use std::time::Duration;

    fn runtime() -> runtime::Runtime {
        runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn pvc(name: &str, phase: &str) -> K8sResource {
        pvc_in("default", name, phase)
    }

    fn pvc_in(namespace: &str, name: &str, phase: &str) -> K8sResource {
        K8sResource::from_value(json!({
            "metadata": {"namespace": namespace, "name": name, "labels": {"app": "db"}},
            "status": {"phase": phase},
        }))
        .unwrap()
    }

    fn retry_delays(config: &ReconcilerConfig, count: usize) -> Vec<Duration> {
        let mut backoff = retry_backoff(config);
        (0..count)
            .filter_map(|_| backoff.next_backoff())
            .map(|d| d.min(config.retry_max))
            .collect()
    }

    fn fast_retries() -> ReconcilerConfig {
        ReconcilerConfig::default().with_retry(Duration::from_millis(10), Duration::from_millis(20))
    }

    #[test]
    fn retry_delays_are_capped() {
        let delays = retry_delays(&fast_retries(), 10);
        assert_eq!(10, delays.len());
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(20)));
    }

    #[test]
    fn failed_notifications_are_retried_until_they_succeed() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let store = MemoryStore::new();
            store.fail_writes_to(&PVC_LABEL).await;
            let reconciler: Reconciler<Pvc, _, _> =
                Reconciler::new(store.clone(), FakeClusterApi::new(), fast_retries());
            let (tx, rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_reconciler(reconciler, rx, cancel.clone()));

            tx.send(FeedEvent::Notification(Notification::upsert(pvc("data-1", "Pending"))))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(50)).await;
            assert!(store.rows(&PVC_LABEL).await.is_empty());

            store.clear_failures().await;
            let observed = store.clone();
            eventually(Duration::from_secs(2), || {
                let observed = observed.clone();
                async move { observed.rows(&PVC_LABEL).await.len() == 1 }
            })
            .await;

            cancel.cancel();
            handle.await.unwrap();
        });
    }

    #[test]
    fn newer_notification_supersedes_a_pending_retry() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let store = MemoryStore::new();
            store.fail_writes_to(&PVC_LABEL).await;
            let config = ReconcilerConfig::default()
                .with_retry(Duration::from_secs(60), Duration::from_secs(60));
            let reconciler: Reconciler<Pvc, _, _> =
                Reconciler::new(store.clone(), FakeClusterApi::new(), config);
            let (tx, rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_reconciler(reconciler, rx, cancel.clone()));

            tx.send(FeedEvent::Notification(Notification::upsert(pvc("data-1", "Pending"))))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(20)).await;
            store.clear_failures().await;
            tx.send(FeedEvent::Notification(Notification::upsert(pvc("data-1", "Bound"))))
                .await
                .unwrap();

            let observed = store.clone();
            eventually(Duration::from_secs(2), || {
                let observed = observed.clone();
                async move { observed.rows(&PVC_LABEL).await.len() == 1 }
            })
            .await;
            let rows = store.rows(&PVC).await;
            assert_eq!(1, rows.len());
            assert_eq!(SqlValue::from("bound"), rows[0][5]);

            drop(tx);
            handle.await.unwrap();
        });
    }

    #[test]
    fn listing_removes_objects_deleted_while_unobserved() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let store = MemoryStore::new();
            let api = FakeClusterApi::new();
            {
                let mut earlier: Reconciler<Pvc, _, _> =
                    Reconciler::new(store.clone(), api.clone(), ReconcilerConfig::default());
                earlier.sync(&Notification::upsert(pvc("data-1", "Bound"))).await.unwrap();
                earlier.sync(&Notification::upsert(pvc("data-2", "Bound"))).await.unwrap();
            }

            api.set_list(
                crate::k8s_types::core::v1::PersistentVolumeClaim,
                "10",
                vec![pvc("data-2", "Bound").into_value()],
            )
            .await;
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_mirror::<Pvc, _, _>(
                api.clone(),
                store.clone(),
                ReconcilerConfig::default(),
                cancel.clone(),
            ));

            let observed = store.clone();
            eventually(Duration::from_secs(2), || {
                let observed = observed.clone();
                async move { observed.rows(&PVC).await.len() == 1 }
            })
            .await;
            let remaining = store.rows(&PVC).await;
            assert_eq!(SqlValue::from(EntityId::object("default", "data-2")), remaining[0][0]);

            cancel.cancel();
            handle.await.unwrap().unwrap();
        });
    }

    #[test]
    fn namespaced_mirror_leaves_other_namespaces_alone() {
        let _ = env_logger::try_init();
        runtime().block_on(async {
            let store = MemoryStore::new();
            let api = FakeClusterApi::new();
            {
                let mut earlier: Reconciler<Pvc, _, _> =
                    Reconciler::new(store.clone(), api.clone(), ReconcilerConfig::default());
                let seeded = [("other", "keep-me"), ("default", "data-1"), ("default", "gone")];
                for (namespace, name) in seeded.iter() {
                    earlier
                        .sync(&Notification::upsert(pvc_in(namespace, name, "Bound")))
                        .await
                        .unwrap();
                }
            }

            api.set_list(
                crate::k8s_types::core::v1::PersistentVolumeClaim,
                "10",
                vec![
                    pvc_in("other", "keep-me", "Bound").into_value(),
                    pvc("data-1", "Bound").into_value(),
                ],
            )
            .await;
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_mirror::<Pvc, _, _>(
                api.clone(),
                store.clone(),
                ReconcilerConfig::default().within_namespace("default"),
                cancel.clone(),
            ));

            let gone = EntityId::object("default", "gone");
            let observed = store.clone();
            eventually(Duration::from_secs(2), || {
                let observed = observed.clone();
                async move { observed.find(&PVC, "id", gone).await.is_empty() }
            })
            .await;
            // give the rest of the listing time to be reconciled
            time::sleep(Duration::from_millis(50)).await;

            let remaining = store.rows(&PVC).await;
            assert_eq!(2, remaining.len());
            let keep_me = EntityId::object("other", "keep-me");
            assert_eq!(1, store.find(&PVC, "id", keep_me).await.len());
            assert_eq!(1, store.find(&PVC_LABEL, "pvc_id", keep_me).await.len());

            cancel.cancel();
            handle.await.unwrap().unwrap();
        });
    }
}
