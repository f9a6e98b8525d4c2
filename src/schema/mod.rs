//! Mapping of raw Kubernetes objects to relational rows.
//!
//! Each mirrored kind implements `Resource`, which turns one raw object into a primary row plus a list of
//! dependent `Relation`s. Rows are plain vectors of `SqlValue`s in the column order of their `Table`, so the
//! store can build statements for any table without knowing about the kinds themselves.
mod label;
mod pod;
mod pvc;
pub mod strcase;
mod telemetry;

pub use self::label::{Label, LABEL};
pub use self::pod::{
    Container, ContainerLog, Pod, PodCondition, PodLabel, PodUsage, CONTAINER, CONTAINER_LOG,
    POD, POD_CONDITION, POD_LABEL, POD_METRICS,
};
pub use self::pvc::{Pvc, PvcCondition, PvcLabel, PVC, PVC_CONDITION, PVC_LABEL};
pub use self::telemetry::{Granularity, TelemetryRecord};

use crate::identity::EntityId;
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef};

use std::fmt::{self, Debug, Display};

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_entity_id(&self) -> Option<EntityId> {
        match self {
            SqlValue::Binary(bytes) => EntityId::from_bytes(bytes.as_slice()),
            _ => None,
        }
    }
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Binary(bytes) => match EntityId::from_bytes(bytes) {
                Some(id) => write!(f, "0x{}", id),
                None => write!(f, "<{} bytes>", bytes.len()),
            },
        }
    }
}

impl From<EntityId> for SqlValue {
    fn from(id: EntityId) -> SqlValue {
        SqlValue::Binary(id.to_vec())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> SqlValue {
        SqlValue::Text(s)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> SqlValue {
        SqlValue::Text(s.to_owned())
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> SqlValue {
        SqlValue::Int(i)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> SqlValue {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> SqlValue {
        SqlValue::Bool(b)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> SqlValue {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One row, with values in the same order as the `columns` of its `Table`
pub type Row = Vec<SqlValue>;

/// Static description of a database table
#[derive(Debug, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// Columns of the primary (or unique) key that upserts are keyed on
    pub key: &'static [&'static str],
}

impl Table {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.key.contains(&column)
    }

    /// Returns the columns that are not part of the key, which are the ones refreshed by an upsert
    pub fn value_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().copied().filter(move |c| !self.is_key(c))
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Anything that is stored as a row of a single table
pub trait Entity: Debug + Send + Sync {
    fn table() -> &'static Table
    where
        Self: Sized;

    fn to_row(&self) -> Row;
}

/// How the rows of a dependent relation are brought in line with the latest observed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Delete every row with the owner's foreign key, then insert the current set
    ReplaceSet,
    /// Insert rows whose key doesn't exist yet. Rows are shared between owners, so they are never
    /// deleted through the relation.
    InsertIfAbsent,
}

/// A named set of rows that depend on a primary entity
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub table: &'static Table,
    pub foreign_key: &'static str,
    pub owner: EntityId,
    pub discipline: Discipline,
    pub rows: Vec<Row>,
}

impl Relation {
    pub fn has_many<E: Entity>(
        foreign_key: &'static str,
        owner: EntityId,
        entities: &[E],
    ) -> Relation {
        Relation {
            table: E::table(),
            foreign_key,
            owner,
            discipline: Discipline::ReplaceSet,
            rows: entities.iter().map(Entity::to_row).collect(),
        }
    }

    pub fn dictionary<E: Entity>(owner: EntityId, entities: &[E]) -> Relation {
        Relation {
            table: E::table(),
            foreign_key: E::table().key[0],
            owner,
            discipline: Discipline::InsertIfAbsent,
            rows: entities.iter().map(Entity::to_row).collect(),
        }
    }
}

/// One step of removing everything that depends on a primary entity, executed in order before the
/// primary row itself is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    /// Delete rows of `table` whose `column` holds the entity id
    Direct {
        table: &'static Table,
        column: &'static str,
    },
    /// Delete rows of `table` whose `column` holds the key of a `via` row that references the entity in `via_column`
    Through {
        table: &'static Table,
        column: &'static str,
        via: &'static Table,
        via_column: &'static str,
    },
}

/// A container of a resource whose logs and usage are fetched while reconciling it
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTarget {
    pub container_name: String,
    pub container_id: EntityId,
    /// Whether the container has ever started, meaning the api server has logs for it
    pub started: bool,
}

/// The capability shared by every mirrored kind: building rows from a raw object and enumerating
/// the relations those rows own.
pub trait Resource: Entity + Sized + 'static {
    /// The Kubernetes type that is watched for this resource
    fn k8s_type() -> &'static K8sType;

    /// Dependent rows to delete when the object is deleted, children first
    fn cascade() -> &'static [Cascade];

    fn obtain(raw: &K8sResource) -> Result<Self, InvalidResourceError>;

    fn id(&self) -> EntityId;

    fn object_id(&self) -> ObjectIdRef;

    fn relations(&self) -> Vec<Relation>;

    /// Containers to fetch logs and usage snapshots for. Most kinds have none.
    fn snapshot_targets(&self) -> Vec<SnapshotTarget> {
        Vec::new()
    }
}

/// Builds the label dictionary rows and the association rows for every label on the object
pub(crate) fn map_labels<A, F>(raw: &K8sResource, mut make_assoc: F) -> (Vec<Label>, Vec<A>)
where
    F: FnMut(EntityId) -> A,
{
    let mut labels = Vec::new();
    let mut assocs = Vec::new();
    for (name, value) in raw.labels() {
        let label = Label::new(name, value);
        assocs.push(make_assoc(label.id));
        labels.push(label);
    }
    (labels, assocs)
}
