use crate::identity::EntityId;
use crate::schema::{Row, Table};

use std::collections::HashMap;
use std::fmt::{self, Display};

/// Telemetry timestamps are truncated to this interval, so that repeated polls of the same sample
/// window land on the same row
pub const TIMESTAMP_INTERVAL_MILLIS: i64 = 60_000;

pub static CLUSTER_METRIC: Table = Table {
    name: "prometheus_cluster_metric",
    columns: &["cluster_id", "timestamp", "category", "name", "value"],
    key: &["cluster_id", "timestamp", "category", "name"],
};

pub static NODE_METRIC: Table = Table {
    name: "prometheus_node_metric",
    columns: &["node_id", "timestamp", "category", "name", "value"],
    key: &["node_id", "timestamp", "category", "name"],
};

pub static POD_METRIC: Table = Table {
    name: "prometheus_pod_metric",
    columns: &["pod_id", "timestamp", "category", "name", "value"],
    key: &["pod_id", "timestamp", "category", "name"],
};

pub static CONTAINER_METRIC: Table = Table {
    name: "prometheus_container_metric",
    columns: &["container_id", "timestamp", "category", "name", "value"],
    key: &["container_id", "timestamp", "category", "name"],
};

/// The level that a telemetry series is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Cluster,
    Node,
    Pod,
    Container,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Cluster,
        Granularity::Node,
        Granularity::Pod,
        Granularity::Container,
    ];

    pub fn table(self) -> &'static Table {
        match self {
            Granularity::Cluster => &CLUSTER_METRIC,
            Granularity::Node => &NODE_METRIC,
            Granularity::Pod => &POD_METRIC,
            Granularity::Container => &CONTAINER_METRIC,
        }
    }

    /// Derives the id of the entity that owns a series from the series' labels. Returns `None` if the
    /// label naming the entity is missing or empty, since such a series can't be attributed to anything.
    pub fn attribute(self, labels: &HashMap<String, String>) -> Option<EntityId> {
        let label = |name: &str| labels.get(name).map(String::as_str).filter(|v| !v.is_empty());
        match self {
            Granularity::Cluster => Some(EntityId::cluster()),
            Granularity::Node => label("node")
                .or_else(|| label("instance"))
                .map(EntityId::node),
            Granularity::Pod => {
                let pod = label("pod")?;
                Some(EntityId::object(label("namespace").unwrap_or(""), pod))
            }
            Granularity::Container => {
                let container = label("container")?;
                Some(EntityId::container(
                    label("namespace").unwrap_or(""),
                    label("pod").unwrap_or(""),
                    container,
                ))
            }
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Granularity::Cluster => "cluster",
            Granularity::Node => "node",
            Granularity::Pod => "pod",
            Granularity::Container => "container",
        };
        f.write_str(name)
    }
}

/// One telemetry value, attributed to an entity at a given granularity. The granularity itself isn't
/// part of the record, since every channel and table carries only a single granularity.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub entity_id: EntityId,
    /// Unix milliseconds, always a multiple of `TIMESTAMP_INTERVAL_MILLIS`
    pub timestamp: i64,
    pub category: String,
    pub name: String,
    pub value: f64,
}

impl TelemetryRecord {
    pub fn new(
        entity_id: EntityId,
        sample_millis: i64,
        category: &str,
        name: &str,
        value: f64,
    ) -> TelemetryRecord {
        TelemetryRecord {
            entity_id,
            timestamp: truncate_timestamp(sample_millis),
            category: category.to_owned(),
            name: name.to_owned(),
            value,
        }
    }

    pub fn to_row(&self) -> Row {
        vec![
            self.entity_id.into(),
            self.timestamp.into(),
            self.category.as_str().into(),
            self.name.as_str().into(),
            self.value.into(),
        ]
    }
}

impl From<TelemetryRecord> for Row {
    fn from(record: TelemetryRecord) -> Row {
        record.to_row()
    }
}

pub fn truncate_timestamp(millis: i64) -> i64 {
    millis - millis.rem_euclid(TIMESTAMP_INTERVAL_MILLIS)
}
