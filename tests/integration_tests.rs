use kubemirror::prelude::*;
use kubemirror::metrics::{QueryError, QueryResponse, Sample};
use kubemirror::runner::client::WatchEvent;
use kubemirror::runner::testkit::{eventually, FakeClusterApi, ScriptedBackend};
use kubemirror::schema::{SqlValue, CONTAINER, CONTAINER_LOG, POD, POD_LABEL, PVC};
use kubemirror::serde_json::{json, Value};

use tokio::runtime;
use tokio_util::sync::CancellationToken;

use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn setup() -> runtime::Runtime {
    let _ = env_logger::try_init();
    runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create runtime")
}

fn pod(name: &str, phase: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "namespace": "default",
            "name": name,
            "uid": format!("uid-{}", name),
            "resourceVersion": "1",
            "creationTimestamp": "2020-01-02T03:04:05Z",
            "labels": {"app": "web"},
        },
        "spec": {
            "nodeName": "n1",
            "containers": [{"name": "nginx", "image": "nginx:1"}],
        },
        "status": {
            "phase": phase,
            "containerStatuses": [{
                "name": "nginx",
                "ready": phase == "Running",
                "restartCount": 0,
                "state": {"running": {"startedAt": "2020-01-02T03:04:06Z"}},
            }],
        },
    })
}

fn fast_pipeline() -> PipelineConfig {
    PipelineConfig::empty()
        .with_poll_interval(Duration::from_millis(20))
        .with_batch_max_fill(Duration::from_millis(5))
}

async fn row_count(store: &MemoryStore, granularity: Granularity) -> usize {
    store.rows(granularity.table()).await.len()
}

#[test]
fn pod_is_mirrored_through_its_lifecycle() {
    setup().block_on(async {
        let store = MemoryStore::new();
        let api = FakeClusterApi::new();
        api.set_logs(("default", "web-1"), "nginx", "listening on :80\n").await;
        let cancel = CancellationToken::new();
        let mirror = tokio::spawn(run_mirror::<Pod, _, _>(
            api.clone(),
            store.clone(),
            ReconcilerConfig::default().with_usage(false),
            cancel.clone(),
        ));
        let pod_id = EntityId::object("default", "web-1");

        api.push_watch_event(WatchEvent::Added(pod("web-1", "Running"))).await;
        eventually(TIMEOUT, || {
            let store = store.clone();
            async move { store.rows(&POD).await.len() == 1 }
        })
        .await;
        let rows = store.rows(&POD).await;
        assert_eq!(SqlValue::from(pod_id), rows[0][0]);
        assert_eq!(SqlValue::from("running"), rows[0][5]);

        api.push_watch_event(WatchEvent::Modified(pod("web-1", "Succeeded"))).await;
        eventually(TIMEOUT, || {
            let store = store.clone();
            async move { store.rows(&POD).await[0][5] == SqlValue::from("succeeded") }
        })
        .await;
        assert_eq!(1, store.rows(&POD).await.len());
        assert_eq!(SqlValue::from(pod_id), store.rows(&POD).await[0][0]);
        assert_eq!(1, store.rows(&CONTAINER_LOG).await.len());

        // collect some telemetry for the pod and its container before it goes away
        let backend = ScriptedBackend::new();
        backend
            .respond(
                "pod cpu",
                QueryResponse::vector(vec![Sample::new(
                    &[("namespace", "default"), ("pod", "web-1")],
                    120_000,
                    0.5,
                )]),
            )
            .await;
        backend
            .respond(
                "container cpu",
                QueryResponse::vector(vec![Sample::new(
                    &[("namespace", "default"), ("pod", "web-1"), ("container", "nginx")],
                    120_000,
                    0.25,
                )]),
            )
            .await;
        let config = fast_pipeline()
            .with_queries(Granularity::Pod, vec![QueryDescriptor::new("cpu.usage", "pod cpu")])
            .with_queries(
                Granularity::Container,
                vec![QueryDescriptor::new("cpu.request", "container cpu")],
            );
        let pipeline_cancel = CancellationToken::new();
        let pipeline = MetricsPipeline::new(backend, store.clone(), config);
        let stop = pipeline_cancel.clone();
        let observed = store.clone();
        let (result, _) = tokio::join!(pipeline.run(pipeline_cancel), async move {
            eventually(TIMEOUT, || {
                let store = observed.clone();
                async move {
                    row_count(&store, Granularity::Pod).await == 1
                        && row_count(&store, Granularity::Container).await == 1
                }
            })
            .await;
            stop.cancel();
        });
        result.expect("pipeline failed");

        api.push_watch_event(WatchEvent::Deleted(pod("web-1", "Succeeded"))).await;
        eventually(TIMEOUT, || {
            let store = store.clone();
            async move { store.rows(&POD).await.is_empty() }
        })
        .await;
        assert!(store.rows(&CONTAINER).await.is_empty());
        assert!(store.rows(&CONTAINER_LOG).await.is_empty());
        assert!(store.rows(&POD_LABEL).await.is_empty());
        assert_eq!(0, row_count(&store, Granularity::Pod).await);
        assert_eq!(0, row_count(&store, Granularity::Container).await);

        cancel.cancel();
        mirror.await.unwrap().expect("mirror failed");
    });
}

#[test]
fn one_row_per_node_for_a_query_without_name_label() {
    setup().block_on(async {
        let backend = ScriptedBackend::new();
        backend
            .respond(
                "node cpu",
                QueryResponse::vector(vec![
                    Sample::new(&[("instance", "n1")], 1_700_000_012_000, 0.5),
                    Sample::new(&[("instance", "n2")], 1_700_000_012_000, 0.75),
                ]),
            )
            .await;
        let store = MemoryStore::new();
        let config = fast_pipeline()
            .with_queries(Granularity::Node, vec![QueryDescriptor::new("cpu.usage", "node cpu")]);
        let pipeline = MetricsPipeline::new(backend, store.clone(), config);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let observed = store.clone();
        let (result, _) = tokio::join!(pipeline.run(cancel), async move {
            eventually(TIMEOUT, || {
                let store = observed.clone();
                async move { row_count(&store, Granularity::Node).await == 2 }
            })
            .await;
            stop.cancel();
        });
        result.expect("pipeline failed");

        let rows = store.rows(Granularity::Node.table()).await;
        assert_eq!(2, rows.len());
        assert_ne!(rows[0][0], rows[1][0]);
        for row in rows.iter() {
            assert_eq!(SqlValue::Int(1_699_999_980_000), row[1]);
            assert_eq!(SqlValue::from("cpu.usage"), row[2]);
            assert_eq!(SqlValue::from(""), row[3]);
        }
        let n1 = store
            .find(Granularity::Node.table(), "node_id", EntityId::node("n1"))
            .await;
        assert_eq!(SqlValue::from(0.5), n1[0][4]);
    });
}

#[test]
fn backend_failure_terminates_the_pipeline() {
    setup().block_on(async {
        let backend = ScriptedBackend::new();
        backend
            .respond(
                "healthy",
                QueryResponse::vector(vec![Sample::new(&[], 60_000, 3.0)]),
            )
            .await;
        backend
            .fail(
                "broken",
                QueryError::Api {
                    error_type: "bad_data".to_owned(),
                    message: "unknown function".to_owned(),
                },
            )
            .await;
        let config = fast_pipeline().with_queries(
            Granularity::Cluster,
            vec![
                QueryDescriptor::new("node.count", "healthy"),
                QueryDescriptor::new("pod.running", "broken"),
            ],
        );
        let pipeline = MetricsPipeline::new(backend, MemoryStore::new(), config);

        let err = tokio::time::timeout(TIMEOUT, pipeline.run(CancellationToken::new()))
            .await
            .expect("pipeline kept running after a failed query")
            .unwrap_err();
        match err.as_type::<QueryError>() {
            Some(QueryError::Api { error_type, .. }) => assert_eq!("bad_data", error_type.as_str()),
            other => panic!("unexpected error: {:?}", other),
        }
    });
}

#[test]
fn unusable_samples_are_never_stored() {
    setup().block_on(async {
        let backend = ScriptedBackend::new();
        backend
            .respond(
                "containers",
                QueryResponse::vector(vec![
                    Sample::new(
                        &[("namespace", "default"), ("pod", "web-1"), ("container", "nginx")],
                        60_000,
                        std::f64::NAN,
                    ),
                    Sample::new(&[("namespace", "default"), ("pod", "web-1")], 60_000, 1.0),
                    Sample::new(
                        &[("namespace", "default"), ("pod", "web-1"), ("container", "sidecar")],
                        60_000,
                        2.0,
                    ),
                ]),
            )
            .await;
        let store = MemoryStore::new();
        let config = fast_pipeline().with_queries(
            Granularity::Container,
            vec![QueryDescriptor::new("memory.limit", "containers")],
        );
        let pipeline = MetricsPipeline::new(backend.clone(), store.clone(), config);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let observed = backend.clone();
        let (result, _) = tokio::join!(pipeline.run(cancel), async move {
            eventually(TIMEOUT, || {
                let backend = observed.clone();
                async move { backend.calls("containers").await >= 3 }
            })
            .await;
            stop.cancel();
        });
        result.expect("pipeline failed");

        let rows = store.rows(Granularity::Container.table()).await;
        assert_eq!(1, rows.len());
        assert_eq!(
            SqlValue::from(EntityId::container("default", "web-1", "sidecar")),
            rows[0][0]
        );
    });
}

#[test]
fn samples_within_one_minute_collapse_into_the_latest() {
    setup().block_on(async {
        let backend = ScriptedBackend::new();
        backend
            .respond(
                "count",
                QueryResponse::vector(vec![Sample::new(&[], 600_500, 3.0)]),
            )
            .await;
        backend
            .respond(
                "count",
                QueryResponse::vector(vec![Sample::new(&[], 659_900, 4.0)]),
            )
            .await;
        let store = MemoryStore::new();
        let config = fast_pipeline()
            .with_queries(Granularity::Cluster, vec![QueryDescriptor::new("node.count", "count")]);
        let pipeline = MetricsPipeline::new(backend, store.clone(), config);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let observed = store.clone();
        let (result, _) = tokio::join!(pipeline.run(cancel), async move {
            eventually(TIMEOUT, || {
                let store = observed.clone();
                async move {
                    let rows = store.rows(Granularity::Cluster.table()).await;
                    rows.len() == 1 && rows[0][4] == SqlValue::from(4.0)
                }
            })
            .await;
            stop.cancel();
        });
        result.expect("pipeline failed");

        let rows = store.rows(Granularity::Cluster.table()).await;
        assert_eq!(1, rows.len());
        assert_eq!(SqlValue::from(EntityId::cluster()), rows[0][0]);
        assert_eq!(SqlValue::Int(600_000), rows[0][1]);
    });
}

#[test]
fn objects_deleted_while_down_are_removed_after_restart() {
    setup().block_on(async {
        let store = MemoryStore::new();
        let api = FakeClusterApi::new();
        let claim = |name: &str| {
            json!({
                "metadata": {"namespace": "db", "name": name, "uid": name},
                "spec": {"volumeName": format!("pv-{}", name), "storageClassName": "fast"},
                "status": {"phase": "Bound"},
            })
        };
        api.set_list(k8s_types::core::v1::PersistentVolumeClaim, "5", vec![claim("data-0"), claim("data-1")])
            .await;

        let cancel = CancellationToken::new();
        let first_run = tokio::spawn(run_mirror::<Pvc, _, _>(
            api.clone(),
            store.clone(),
            ReconcilerConfig::default(),
            cancel.clone(),
        ));
        eventually(TIMEOUT, || {
            let store = store.clone();
            async move { store.rows(&PVC).await.len() == 2 }
        })
        .await;
        cancel.cancel();
        first_run.await.unwrap().expect("first run failed");

        // data-0 goes away while nothing is watching
        api.set_list(k8s_types::core::v1::PersistentVolumeClaim, "9", vec![claim("data-1")])
            .await;
        let cancel = CancellationToken::new();
        let second_run = tokio::spawn(run_mirror::<Pvc, _, _>(
            api.clone(),
            store.clone(),
            ReconcilerConfig::default(),
            cancel.clone(),
        ));
        eventually(TIMEOUT, || {
            let store = store.clone();
            async move { store.rows(&PVC).await.len() == 1 }
        })
        .await;
        let rows = store.rows(&PVC).await;
        assert_eq!(SqlValue::from(EntityId::object("db", "data-1")), rows[0][0]);
        assert_eq!(SqlValue::from("bound"), rows[0][5]);

        cancel.cancel();
        second_run.await.unwrap().expect("second run failed");
    });
}
