//! Applies watch notifications of one resource kind to the store.
//!
//! An upsert writes the primary row, then brings every dependent relation in line with the object,
//! then fetches logs and usage snapshots for kinds that have containers. A delete runs the kind's
//! cascade, children first, and removes the primary row last. Nothing is retried here; that's up to
//! whatever delivers the notifications.
use crate::config::ReconcilerConfig;
use crate::resource::{InvalidResourceError, K8sResource, ObjectId};
use crate::runner::client::{ClusterApi, Error as ClientError};
use crate::runner::informer::Notification;
use crate::runner::resource_map::IdSet;
use crate::schema::{
    Cascade, ContainerLog, Discipline, Entity, PodUsage, Relation, Resource, SqlValue, CONTAINER_LOG,
    POD_METRICS,
};
use crate::store::{Store, StoreError, UpsertStatement};

use std::fmt::{self, Display};
use std::marker::PhantomData;

#[derive(Debug)]
pub enum SyncError {
    Invalid(InvalidResourceError),
    Store(StoreError),
    Client(ClientError),
}

impl SyncError {
    /// Invalid objects will fail the same way every time, so there's no point in retrying them
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Invalid(_))
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Invalid(e) => write!(f, "Cannot map object: {}", e),
            SyncError::Store(e) => write!(f, "Store error: {}", e),
            SyncError::Client(e) => write!(f, "Client error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Invalid(e) => Some(e),
            SyncError::Store(e) => Some(e),
            SyncError::Client(e) => Some(e),
        }
    }
}

impl From<InvalidResourceError> for SyncError {
    fn from(e: InvalidResourceError) -> SyncError {
        SyncError::Invalid(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> SyncError {
        SyncError::Store(e)
    }
}

impl From<ClientError> for SyncError {
    fn from(e: ClientError) -> SyncError {
        SyncError::Client(e)
    }
}

pub struct Reconciler<R: Resource, S: Store, A: ClusterApi> {
    store: S,
    api: A,
    config: ReconcilerConfig,
    /// Objects that have a primary row in the store
    known: IdSet,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Resource, S: Store, A: ClusterApi> Reconciler<R, S, A> {
    pub fn new(store: S, api: A, config: ReconcilerConfig) -> Reconciler<R, S, A> {
        Reconciler {
            store,
            api,
            config,
            known: IdSet::new(),
            _kind: PhantomData,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn known(&self) -> &IdSet {
        &self.known
    }

    /// Seeds the set of known objects from the primary rows that are already in the store. Returns the
    /// number of known objects. A reconciler scoped to a namespace only takes ownership of the rows in
    /// that namespace.
    pub async fn warm_up(&mut self) -> Result<usize, SyncError> {
        let rows = self.store.select(R::table(), &["namespace", "name"]).await?;
        self.known.clear();
        for row in rows {
            if let [SqlValue::Text(namespace), SqlValue::Text(name)] = row.as_slice() {
                if self.in_scope(namespace) {
                    self.known.insert(ObjectId::new(namespace.as_str(), name.as_str()));
                }
            }
        }
        log::info!(
            "Warmed up {} reconciler with {} known objects",
            R::k8s_type(),
            self.known.len()
        );
        Ok(self.known.len())
    }

    pub async fn sync(&mut self, notification: &Notification) -> Result<(), SyncError> {
        match notification.object.as_ref() {
            Some(raw) => self.upsert(raw).await,
            None => self.delete(notification.id()).await,
        }
    }

    /// Deletion notifications for every object that was known, but is missing from a complete listing.
    /// These are objects that were deleted while nothing was watching.
    pub fn stale(&self, listed: &IdSet) -> Vec<Notification> {
        self.known
            .difference(listed)
            .iter()
            .filter(|id| self.in_scope(id.namespace().unwrap_or_default()))
            .map(Notification::deleted)
            .collect()
    }

    fn in_scope(&self, namespace: &str) -> bool {
        match self.config.namespace.as_deref() {
            Some(scope) => scope == namespace,
            None => true,
        }
    }

    async fn upsert(&mut self, raw: &K8sResource) -> Result<(), SyncError> {
        let entity = R::obtain(raw)?;
        let object_id = entity.object_id();

        self.store
            .upsert(&UpsertStatement::new(R::table()), vec![entity.to_row()])
            .await?;
        for relation in entity.relations() {
            self.sync_relation(relation).await?;
        }
        self.sync_snapshots(&entity).await?;

        if self.known.insert(object_id.to_owned()) {
            log::info!("Mirrored new {} {}", R::k8s_type().kind, object_id);
        } else {
            log::debug!(
                "Updated known {} {} at resourceVersion: {}",
                R::k8s_type().kind,
                object_id,
                raw.resource_version()
            );
        }
        Ok(())
    }

    async fn sync_relation(&self, relation: Relation) -> Result<(), SyncError> {
        let Relation {
            table,
            foreign_key,
            owner,
            discipline,
            rows,
        } = relation;
        match discipline {
            Discipline::ReplaceSet => {
                self.store.replace(table, foreign_key, owner, rows).await?;
            }
            Discipline::InsertIfAbsent if !rows.is_empty() => {
                self.store
                    .upsert(&UpsertStatement::insert_if_absent(table), rows)
                    .await?;
            }
            Discipline::InsertIfAbsent => {}
        }
        Ok(())
    }

    async fn sync_snapshots(&self, entity: &R) -> Result<(), SyncError> {
        let targets = entity.snapshot_targets();
        if targets.is_empty() {
            return Ok(());
        }
        let object_id = entity.object_id();

        if self.config.fetch_logs {
            let mut logs = Vec::with_capacity(targets.len());
            for target in targets.iter().filter(|t| t.started) {
                if let Some(text) = self
                    .api
                    .container_logs(object_id, &target.container_name)
                    .await?
                {
                    logs.push(ContainerLog::new(object_id, target, text).to_row());
                }
            }
            if !logs.is_empty() {
                self.store
                    .upsert(&UpsertStatement::new(&CONTAINER_LOG), logs)
                    .await?;
            }
        }

        if self.config.fetch_usage {
            if let Some(metrics) = self.api.pod_metrics(object_id).await? {
                let usage: Vec<_> = PodUsage::from_pod_metrics(object_id, &metrics)?
                    .iter()
                    .map(Entity::to_row)
                    .collect();
                if !usage.is_empty() {
                    self.store
                        .upsert(&UpsertStatement::new(&POD_METRICS), usage)
                        .await?;
                }
            } else {
                log::debug!("No usage snapshot available yet for {}", object_id);
            }
        }
        Ok(())
    }

    async fn delete(&mut self, id: ObjectId) -> Result<(), SyncError> {
        let entity_id = id.entity_id();
        let primary = Cascade::Direct {
            table: R::table(),
            column: "id",
        };
        let mut deleted = 0;
        for step in R::cascade().iter().chain(std::iter::once(&primary)) {
            deleted += self.store.delete(step, entity_id).await?;
        }
        self.known.remove(&id);
        log::info!(
            "Deleted {} {} along with {} rows",
            R::k8s_type().kind,
            id,
            deleted
        );
        Ok(())
    }
}
