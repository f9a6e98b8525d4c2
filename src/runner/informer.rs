//! Turns the list and watch endpoints of the api server into a feed of notifications for one
//! resource type.
//!
//! Every (re)list sends one notification per listed object, followed by a `Listed` event with the ids
//! of all of them. A watch then resumes from the resourceVersion of the list. Whenever the api server
//! reports that this version has expired, the informer lists again, so consumers must be prepared to
//! see the same object more than once.
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectId, ObjectIdRef};
use crate::runner::client::{ApiError, ClusterApi, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::resource_map::IdSet;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use std::fmt::{self, Display};
use std::time::Duration;

const DEFAULT_ERROR_DELAY: Duration = Duration::from_secs(10);

/// One observed state of an object. A notification without an object means that the object was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// `namespace/name`, or just `name` for objects that aren't namespaced
    pub key: String,
    pub object: Option<K8sResource>,
}

impl Notification {
    pub fn upsert(object: K8sResource) -> Notification {
        Notification {
            key: object_key(object.get_object_id()),
            object: Some(object),
        }
    }

    pub fn deleted<'a>(id: impl Into<ObjectIdRef<'a>>) -> Notification {
        Notification {
            key: object_key(id.into()),
            object: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.object.is_some()
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::from_key(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Notification(Notification),
    /// Sent after all notifications of a complete listing, with the ids of every listed object
    Listed(IdSet),
}

pub fn object_key(id: ObjectIdRef<'_>) -> String {
    match id.namespace() {
        Some(ns) => format!("{}/{}", ns, id.name()),
        None => id.name().to_owned(),
    }
}

#[derive(Debug)]
enum FeedError {
    SendErr,
    Cancelled,
    ClientErr(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FeedError::SendErr => f.write_str("Receiver of the feed is gone"),
            FeedError::Cancelled => f.write_str("Feed was cancelled"),
            FeedError::ClientErr(err) => write!(f, "Client Error: {}", err),
            FeedError::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            FeedError::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            FeedError::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FeedError::ClientErr(err) => Some(err),
            FeedError::InvalidResource(e) => Some(e),
            FeedError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl FeedError {
    fn is_terminal(&self) -> bool {
        matches!(self, FeedError::SendErr | FeedError::Cancelled)
    }
}

impl From<ApiError> for FeedError {
    fn from(err: ApiError) -> FeedError {
        if err.code == 410 {
            FeedError::ResourceVersionExpired
        } else {
            FeedError::Api(err)
        }
    }
}

impl From<InvalidResourceError> for FeedError {
    fn from(err: InvalidResourceError) -> FeedError {
        FeedError::InvalidResource(err)
    }
}

impl From<ClientError> for FeedError {
    fn from(err: ClientError) -> FeedError {
        if err.is_http_410() {
            FeedError::ResourceVersionExpired
        } else {
            FeedError::ClientErr(err)
        }
    }
}

pub struct Informer<A: ClusterApi> {
    api: A,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    sender: Sender<FeedEvent>,
    error_delay: Duration,
}

impl<A: ClusterApi> Informer<A> {
    pub fn new(
        api: A,
        k8s_type: &'static K8sType,
        namespace: Option<String>,
        sender: Sender<FeedEvent>,
    ) -> Informer<A> {
        Informer {
            api,
            k8s_type,
            namespace,
            sender,
            error_delay: DEFAULT_ERROR_DELAY,
        }
    }

    /// How long to wait before listing again after an error
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    /// Runs until the token is cancelled or the receiving end of the feed is dropped. Errors from the api
    /// server are logged and followed by a fresh listing.
    pub async fn run(self, cancel: CancellationToken) {
        log::info!(
            "Starting feed of resources of type: {} in namespace: {:?}",
            self.k8s_type,
            self.namespace
        );
        loop {
            let err = self.list_and_watch(&cancel).await;
            if err.is_terminal() {
                log::info!("Ending feed for type: {}: {}", self.k8s_type, err);
                break;
            }
            if let FeedError::ResourceVersionExpired = err {
                log::warn!("ResourceVersion is too old for type: {}, listing again", self.k8s_type);
                continue;
            }

            log::error!("Error in feed for type: {}, err: {}", self.k8s_type, err);
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Ending feed for type: {} while waiting to retry", self.k8s_type);
                    break;
                }
                _ = tokio::time::sleep(self.error_delay) => {}
            }
        }
    }

    /// Only ever returns with an error, since a successful watch is just followed by another one
    async fn list_and_watch(&self, cancel: &CancellationToken) -> FeedError {
        let mut resource_version = match self.list(cancel).await {
            Ok(version) => version,
            Err(err) => return err,
        };
        loop {
            match self.watch(resource_version.as_str(), cancel).await {
                Ok(Some(version)) => resource_version = version,
                Ok(None) => {}
                Err(err) => return err,
            }
        }
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<String, FeedError> {
        log::info!("Listing resources of type: {}", self.k8s_type);
        let list = tokio::select! {
            _ = cancel.cancelled() => return Err(FeedError::Cancelled),
            list = self.api.list(self.k8s_type, self.namespace.as_deref()) => list?,
        };
        let ObjectList { metadata, items } = list;
        let resource_version = metadata
            .resource_version
            .ok_or_else(|| InvalidResourceError {
                message: "list result from api server is missing metadata.resourceVersion",
                value: Value::Null,
            })?;

        let mut listed = IdSet::new();
        for mut object in items {
            self.add_metadata_to_list_object(&mut object)?;
            let resource = K8sResource::from_value(object)?;
            listed.insert(resource.get_object_id().to_owned());
            self.send(FeedEvent::Notification(Notification::upsert(resource)), cancel)
                .await?;
        }
        log::debug!(
            "Listed {} resources of type: {} at resourceVersion: {}",
            listed.len(),
            self.k8s_type,
            resource_version
        );
        self.send(FeedEvent::Listed(listed), cancel).await?;
        Ok(resource_version)
    }

    async fn watch(
        &self,
        resource_version: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FeedError> {
        log::debug!(
            "Starting watch of: {} with resourceVersion: {}",
            self.k8s_type,
            resource_version
        );
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return Err(FeedError::Cancelled),
            events = self.api.watch(self.k8s_type, self.namespace.as_deref(), Some(resource_version)) => events?,
        };

        let mut new_version = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                next = events.next() => next,
            };
            match next {
                Some(event) => {
                    let version = self.handle_event(event?, cancel).await?;
                    new_version = Some(version);
                }
                None => break,
            }
        }
        log::debug!("Watch of {} ended, last resourceVersion: {:?}", self.k8s_type, new_version);
        Ok(new_version)
    }

    async fn handle_event(
        &self,
        event: WatchEvent,
        cancel: &CancellationToken,
    ) -> Result<String, FeedError> {
        let (deleted, object) = match event {
            WatchEvent::Added(res) | WatchEvent::Modified(res) => (false, res),
            WatchEvent::Deleted(res) => (true, res),
            WatchEvent::Error(err) => {
                log::warn!("Got apiError for watch on : {}, err: {}", self.k8s_type, err);
                return Err(err.into());
            }
        };
        let resource = K8sResource::from_value(object)?;
        let resource_version = resource.resource_version().to_owned();
        let notification = if deleted {
            Notification::deleted(resource.get_object_id())
        } else {
            Notification::upsert(resource)
        };
        log::trace!("Received notification for key: {}, exists: {}", notification.key, notification.exists());
        self.send(FeedEvent::Notification(notification), cancel).await?;
        Ok(resource_version)
    }

    async fn send(&self, event: FeedEvent, cancel: &CancellationToken) -> Result<(), FeedError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FeedError::Cancelled),
            sent = self.sender.send(event) => sent.map_err(|_| FeedError::SendErr),
        }
    }

    /// apiVersion and kind are missing from the individual items of a list response
    fn add_metadata_to_list_object(&self, list_object: &mut Value) -> Result<(), InvalidResourceError> {
        match list_object.as_object_mut() {
            Some(obj) => {
                obj.insert("apiVersion".to_owned(), self.k8s_type.api_version.into());
                obj.insert("kind".to_owned(), self.k8s_type.kind.into());
                Ok(())
            }
            None => Err(InvalidResourceError::new(
                "list item must be an object",
                list_object.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;
    use crate::runner::testkit::FakeClusterApi;
    use serde_json::json;
    use tokio::runtime;
    use tokio::sync::mpsc;

    fn pod(name: &str, version: &str) -> Value {
        json!({
            "metadata": {"namespace": "default", "name": name, "resourceVersion": version}
        })
    }

    #[test]
    fn lists_then_watches_and_relists_on_expired_version() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let api = FakeClusterApi::new();
            api.set_list(k8s_types::core::v1::Pod, "1", vec![pod("web-1", "1")]).await;
            api.push_watch_event(WatchEvent::Modified(pod("web-1", "2"))).await;
            api.push_watch_event(WatchEvent::Deleted(pod("web-1", "3"))).await;
            api.push_watch_event(WatchEvent::Error(ApiError {
                status: "Failure".to_owned(),
                message: "too old".to_owned(),
                reason: "Expired".to_owned(),
                code: 410,
            }))
            .await;

            let (tx, mut rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let informer = Informer::new(api.clone(), k8s_types::core::v1::Pod, None, tx);
            let handle = tokio::spawn(informer.run(cancel.clone()));

            let mut received = Vec::new();
            for _ in 0..6 {
                received.push(rx.recv().await.expect("feed ended early"));
            }
            cancel.cancel();
            handle.await.unwrap();

            let listed: IdSet = vec![ObjectId::new("default", "web-1")].into_iter().collect();
            match &received[0] {
                FeedEvent::Notification(n) => {
                    assert_eq!("default/web-1", n.key);
                    assert_eq!(Some("Pod"), n.object.as_ref().and_then(K8sResource::kind));
                }
                other => panic!("expected a notification, got: {:?}", other),
            }
            assert_eq!(FeedEvent::Listed(listed.clone()), received[1]);
            assert!(matches!(&received[2], FeedEvent::Notification(n) if n.exists()));
            assert_eq!(
                FeedEvent::Notification(Notification::deleted(("default", "web-1"))),
                received[3]
            );
            // the expired watch is followed by a fresh listing
            assert!(matches!(&received[4], FeedEvent::Notification(n) if n.exists()));
            assert_eq!(FeedEvent::Listed(listed), received[5]);
            assert_eq!(Some("1".to_owned()), api.watch_versions().await[0]);
        });
    }

    #[test]
    fn keys_of_cluster_scoped_objects_have_no_namespace() {
        assert_eq!("node-a", object_key(ObjectIdRef::new("", "node-a")));
        assert_eq!("default/web-1", object_key(ObjectIdRef::new("default", "web-1")));
        assert_eq!(ObjectId::new("default", "web-1"), Notification::deleted(("default", "web-1")).id());
    }
}
