//! Scripted stand ins for the Kubernetes api and the metrics backend, so that mirroring and telemetry
//! ingestion can be tested without a cluster. Both fakes are cheap to clone, and every clone shares
//! the same script.
use crate::k8s_types::K8sType;
use crate::metrics::{MetricsBackend, QueryError, QueryResponse};
use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
use crate::runner::client::{ClusterApi, Error, ListMeta, ObjectList, WatchEvent, WatchStream};

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Polls the condition until it returns true, panicking if that doesn't happen within the timeout
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if condition().await {
            return;
        }
        if start.elapsed() > timeout {
            panic!("Condition was not met after {}ms", timeout.as_millis());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    lists: HashMap<&'static K8sType, ObjectList<Value>>,
    /// events pushed while no watch was open, handed to the next one
    backlog: VecDeque<WatchEvent>,
    open_watch: Option<UnboundedSender<Result<WatchEvent, Error>>>,
    watch_versions: Vec<Option<String>>,
    logs: HashMap<(ObjectId, String), String>,
    pod_metrics: HashMap<ObjectId, K8sResource>,
}

/// A `ClusterApi` whose listings, watch events, logs and usage snapshots are set up by the test. A
/// watch stays open until the fake is dropped, or until an event ends it, just like a long poll
/// against the api server.
#[derive(Debug, Clone, Default)]
pub struct FakeClusterApi {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeClusterApi {
    pub fn new() -> FakeClusterApi {
        FakeClusterApi::default()
    }

    /// Sets the objects returned by every subsequent listing of the type
    pub async fn set_list(&self, k8s_type: &'static K8sType, resource_version: &str, items: Vec<Value>) {
        let list = ObjectList {
            metadata: ListMeta {
                resource_version: Some(resource_version.to_owned()),
            },
            items,
        };
        self.state.lock().await.lists.insert(k8s_type, list);
    }

    /// Delivers the event to the currently open watch, or to the next one if none is open
    pub async fn push_watch_event(&self, event: WatchEvent) {
        let mut state = self.state.lock().await;
        let event = match state.open_watch.as_ref() {
            Some(sender) => match sender.send(Ok(event)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(Ok(event))) => event,
                Err(mpsc::error::SendError(Err(_))) => return,
            },
            None => event,
        };
        state.open_watch = None;
        state.backlog.push_back(event);
    }

    /// The resource version that each watch was started from, in order
    pub async fn watch_versions(&self) -> Vec<Option<String>> {
        self.state.lock().await.watch_versions.clone()
    }

    pub async fn set_logs<'a>(&self, pod: impl Into<ObjectIdRef<'a>>, container: &str, logs: &str) {
        let key = (pod.into().to_owned(), container.to_owned());
        self.state.lock().await.logs.insert(key, logs.to_owned());
    }

    pub async fn set_pod_metrics<'a>(&self, pod: impl Into<ObjectIdRef<'a>>, metrics: Value) {
        let id = pod.into().to_owned();
        let metrics = K8sResource::from_value(metrics).expect("pod metrics must be a valid object");
        self.state.lock().await.pod_metrics.insert(id, metrics);
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let state = self.state.lock().await;
        let mut list = state.lists.get(k8s_type).cloned().unwrap_or_else(|| ObjectList {
            metadata: ListMeta {
                resource_version: Some("0".to_owned()),
            },
            items: Vec::new(),
        });
        if let Some(ns) = namespace {
            list.items
                .retain(|item| crate::resource::str_value(item, "/metadata/namespace") == Some(ns));
        }
        Ok(list)
    }

    async fn watch(
        &self,
        _k8s_type: &'static K8sType,
        _namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, Error> {
        let mut state = self.state.lock().await;
        state
            .watch_versions
            .push(resource_version.map(str::to_owned));
        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(event) = state.backlog.pop_front() {
            let _ = tx.send(Ok(event));
        }
        state.open_watch = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn container_logs(
        &self,
        pod: ObjectIdRef<'_>,
        container: &str,
    ) -> Result<Option<String>, Error> {
        let key = (pod.to_owned(), container.to_owned());
        Ok(self.state.lock().await.logs.get(&key).cloned())
    }

    async fn pod_metrics(&self, pod: ObjectIdRef<'_>) -> Result<Option<K8sResource>, Error> {
        let state = self.state.lock().await;
        Ok(state.pod_metrics.get(&pod.to_owned()).cloned())
    }
}

#[derive(Debug, Default)]
struct Script {
    responses: HashMap<String, VecDeque<Result<QueryResponse, QueryError>>>,
    calls: HashMap<String, usize>,
}

/// A `MetricsBackend` that answers each expression from a script. Scripted answers are used up in
/// order, and the last one is repeated from then on. Expressions without a script get an empty vector.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> ScriptedBackend {
        ScriptedBackend::default()
    }

    pub async fn respond(&self, expression: &str, response: QueryResponse) {
        self.push(expression, Ok(response)).await;
    }

    pub async fn fail(&self, expression: &str, error: QueryError) {
        self.push(expression, Err(error)).await;
    }

    /// How many times the expression has been queried
    pub async fn calls(&self, expression: &str) -> usize {
        self.script
            .lock()
            .await
            .calls
            .get(expression)
            .copied()
            .unwrap_or(0)
    }

    async fn push(&self, expression: &str, answer: Result<QueryResponse, QueryError>) {
        self.script
            .lock()
            .await
            .responses
            .entry(expression.to_owned())
            .or_default()
            .push_back(answer);
    }
}

#[async_trait]
impl MetricsBackend for ScriptedBackend {
    async fn query(&self, expression: &str, _time: Option<i64>) -> Result<QueryResponse, QueryError> {
        let mut script = self.script.lock().await;
        *script.calls.entry(expression.to_owned()).or_default() += 1;
        let answers = match script.responses.get_mut(expression) {
            Some(answers) => answers,
            None => return Ok(QueryResponse::vector(Vec::new())),
        };
        if answers.len() > 1 {
            answers
                .pop_front()
                .unwrap_or_else(|| Ok(QueryResponse::vector(Vec::new())))
        } else {
            answers
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(QueryResponse::vector(Vec::new())))
        }
    }
}
