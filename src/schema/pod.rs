use crate::identity::EntityId;
use crate::k8s_types::{self, K8sType};
use crate::resource::{quantity, timestamp_millis, InvalidResourceError, K8sResource, ObjectIdRef};
use crate::schema::pvc::str_field;
use crate::schema::telemetry::{CONTAINER_METRIC, POD_METRIC};
use crate::schema::{
    map_labels, strcase, Cascade, Entity, Label, Relation, Resource, Row, SnapshotTarget, Table,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

const MIB: f64 = 1024.0 * 1024.0;

pub static POD: Table = Table {
    name: "pod",
    columns: &[
        "id",
        "namespace",
        "name",
        "uid",
        "resource_version",
        "phase",
        "node_name",
        "pod_ip",
        "qos_class",
        "created",
    ],
    key: &["id"],
};

pub static POD_CONDITION: Table = Table {
    name: "pod_condition",
    columns: &[
        "pod_id",
        "type",
        "status",
        "last_probe",
        "last_transition",
        "reason",
        "message",
    ],
    key: &["pod_id", "type"],
};

pub static POD_LABEL: Table = Table {
    name: "pod_label",
    columns: &["pod_id", "label_id"],
    key: &["pod_id", "label_id"],
};

pub static CONTAINER: Table = Table {
    name: "container",
    columns: &[
        "id",
        "pod_id",
        "name",
        "image",
        "ready",
        "restart_count",
        "state",
    ],
    key: &["id"],
};

pub static CONTAINER_LOG: Table = Table {
    name: "container_logs",
    columns: &[
        "container_id",
        "pod_id",
        "namespace",
        "pod_name",
        "container_name",
        "logs",
    ],
    key: &["container_id"],
};

pub static POD_METRICS: Table = Table {
    name: "pod_metrics",
    columns: &[
        "container_id",
        "pod_id",
        "namespace",
        "pod_name",
        "container_name",
        "timestamp",
        "duration",
        "cpu_usage",
        "memory_usage",
        "storage_usage",
        "ephemeral_storage_usage",
    ],
    key: &["container_id"],
};

static POD_CASCADE: &[Cascade] = &[
    // container telemetry only knows the container id, so it has to be found through the container rows
    Cascade::Through {
        table: &CONTAINER_METRIC,
        column: "container_id",
        via: &CONTAINER,
        via_column: "pod_id",
    },
    Cascade::Direct {
        table: &CONTAINER_LOG,
        column: "pod_id",
    },
    Cascade::Direct {
        table: &POD_METRICS,
        column: "pod_id",
    },
    Cascade::Direct {
        table: &CONTAINER,
        column: "pod_id",
    },
    Cascade::Direct {
        table: &POD_LABEL,
        column: "pod_id",
    },
    Cascade::Direct {
        table: &POD_CONDITION,
        column: "pod_id",
    },
    Cascade::Direct {
        table: &POD_METRIC,
        column: "pod_id",
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub id: EntityId,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    pub phase: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub qos_class: Option<String>,
    pub created: i64,
    pub conditions: Vec<PodCondition>,
    pub containers: Vec<Container>,
    pub labels: Vec<Label>,
    pub pod_labels: Vec<PodLabel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodCondition {
    pub pod_id: EntityId,
    pub condition_type: String,
    pub status: String,
    pub last_probe: Option<i64>,
    pub last_transition: Option<i64>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodLabel {
    pub pod_id: EntityId,
    pub label_id: EntityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: EntityId,
    pub pod_id: EntityId,
    pub name: String,
    pub image: String,
    pub ready: bool,
    pub restart_count: i64,
    /// One of `waiting`, `running`, `terminated`, or `unknown` if the kubelet hasn't reported yet
    pub state: String,
    started: bool,
}

/// The log text of one container, as of the last time its pod was reconciled
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLog {
    pub container_id: EntityId,
    pub pod_id: EntityId,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub logs: String,
}

/// Point in time resource usage of one container, from the `metrics.k8s.io` api. Cpu is in cores,
/// everything else in MiB.
#[derive(Debug, Clone, PartialEq)]
pub struct PodUsage {
    pub container_id: EntityId,
    pub pod_id: EntityId,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub timestamp: i64,
    /// Length of the sampling window in milliseconds
    pub duration: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub storage_usage: f64,
    pub ephemeral_storage_usage: f64,
}

impl Resource for Pod {
    fn k8s_type() -> &'static K8sType {
        k8s_types::core::v1::Pod
    }

    fn cascade() -> &'static [Cascade] {
        POD_CASCADE
    }

    fn obtain(raw: &K8sResource) -> Result<Pod, InvalidResourceError> {
        let object_id = raw.get_object_id();
        let id = object_id.entity_id();

        let conditions = raw
            .array("/status/conditions")
            .iter()
            .map(|condition| PodCondition::obtain(id, condition))
            .collect::<Result<Vec<_>, _>>()?;

        let statuses = raw.array("/status/containerStatuses");
        let containers = raw
            .array("/spec/containers")
            .iter()
            .map(|spec| Container::obtain(object_id, spec, statuses))
            .collect::<Result<Vec<_>, _>>()?;

        let (labels, pod_labels) = map_labels(raw, |label_id| PodLabel {
            pod_id: id,
            label_id,
        });

        Ok(Pod {
            id,
            namespace: object_id.namespace.to_owned(),
            name: object_id.name.to_owned(),
            uid: raw.uid().to_owned(),
            resource_version: raw.resource_version().to_owned(),
            phase: strcase::snake(raw.str_value("/status/phase").unwrap_or("")),
            node_name: raw.str_value("/spec/nodeName").map(str::to_owned),
            pod_ip: raw.str_value("/status/podIP").map(str::to_owned),
            qos_class: raw.str_value("/status/qosClass").map(strcase::snake),
            created: raw.created(),
            conditions,
            containers,
            labels,
            pod_labels,
        })
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn object_id(&self) -> ObjectIdRef {
        ObjectIdRef::new(&self.namespace, &self.name)
    }

    fn relations(&self) -> Vec<Relation> {
        vec![
            Relation::has_many("pod_id", self.id, &self.conditions),
            Relation::dictionary(self.id, &self.labels),
            Relation::has_many("pod_id", self.id, &self.pod_labels),
            Relation::has_many("pod_id", self.id, &self.containers),
        ]
    }

    fn snapshot_targets(&self) -> Vec<SnapshotTarget> {
        self.containers
            .iter()
            .map(|c| SnapshotTarget {
                container_name: c.name.clone(),
                container_id: c.id,
                started: c.started,
            })
            .collect()
    }
}

impl Entity for Pod {
    fn table() -> &'static Table {
        &POD
    }

    fn to_row(&self) -> Row {
        vec![
            self.id.into(),
            self.namespace.as_str().into(),
            self.name.as_str().into(),
            self.uid.as_str().into(),
            self.resource_version.as_str().into(),
            self.phase.as_str().into(),
            self.node_name.as_deref().into(),
            self.pod_ip.as_deref().into(),
            self.qos_class.as_deref().into(),
            self.created.into(),
        ]
    }
}

impl PodCondition {
    fn obtain(pod_id: EntityId, condition: &Value) -> Result<PodCondition, InvalidResourceError> {
        let condition_type = condition
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidResourceError::new("condition is missing type", condition.clone()))?;
        Ok(PodCondition {
            pod_id,
            condition_type: strcase::snake(condition_type),
            status: str_field(condition, "status"),
            last_probe: timestamp_millis(condition, "/lastProbeTime"),
            last_transition: timestamp_millis(condition, "/lastTransitionTime"),
            reason: str_field(condition, "reason"),
            message: str_field(condition, "message"),
        })
    }
}

impl Entity for PodCondition {
    fn table() -> &'static Table {
        &POD_CONDITION
    }

    fn to_row(&self) -> Row {
        vec![
            self.pod_id.into(),
            self.condition_type.as_str().into(),
            self.status.as_str().into(),
            self.last_probe.into(),
            self.last_transition.into(),
            self.reason.as_str().into(),
            self.message.as_str().into(),
        ]
    }
}

impl Entity for PodLabel {
    fn table() -> &'static Table {
        &POD_LABEL
    }

    fn to_row(&self) -> Row {
        vec![self.pod_id.into(), self.label_id.into()]
    }
}

impl Container {
    fn obtain(
        pod: ObjectIdRef,
        spec: &Value,
        statuses: &[Value],
    ) -> Result<Container, InvalidResourceError> {
        let name = spec
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidResourceError::new("container is missing name", spec.clone()))?;
        let status = statuses
            .iter()
            .find(|s| s.get("name").and_then(Value::as_str) == Some(name));

        let state = status
            .and_then(|s| s.get("state"))
            .and_then(Value::as_object)
            .and_then(|state| {
                ["running", "terminated", "waiting"]
                    .iter()
                    .copied()
                    .find(|key| state.contains_key(*key))
            })
            .unwrap_or("unknown");
        // a container that is running now, or was at some point, has logs to fetch
        let started = (state != "waiting" && state != "unknown")
            || status
                .and_then(|s| s.pointer("/lastState/terminated"))
                .is_some();

        Ok(Container {
            id: EntityId::container(pod.namespace, pod.name, name),
            pod_id: pod.entity_id(),
            name: name.to_owned(),
            image: str_field(spec, "image"),
            ready: status
                .and_then(|s| s.get("ready"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            restart_count: status
                .and_then(|s| s.get("restartCount"))
                .and_then(Value::as_i64)
                .unwrap_or(0),
            state: state.to_owned(),
            started,
        })
    }
}

impl Entity for Container {
    fn table() -> &'static Table {
        &CONTAINER
    }

    fn to_row(&self) -> Row {
        vec![
            self.id.into(),
            self.pod_id.into(),
            self.name.as_str().into(),
            self.image.as_str().into(),
            self.ready.into(),
            self.restart_count.into(),
            self.state.as_str().into(),
        ]
    }
}

impl ContainerLog {
    pub fn new(pod: ObjectIdRef, target: &SnapshotTarget, logs: String) -> ContainerLog {
        ContainerLog {
            container_id: target.container_id,
            pod_id: pod.entity_id(),
            namespace: pod.namespace.to_owned(),
            pod_name: pod.name.to_owned(),
            container_name: target.container_name.clone(),
            logs,
        }
    }
}

impl Entity for ContainerLog {
    fn table() -> &'static Table {
        &CONTAINER_LOG
    }

    fn to_row(&self) -> Row {
        vec![
            self.container_id.into(),
            self.pod_id.into(),
            self.namespace.as_str().into(),
            self.pod_name.as_str().into(),
            self.container_name.as_str().into(),
            self.logs.as_str().into(),
        ]
    }
}

impl PodUsage {
    /// Reads one `PodUsage` per container from a `PodMetrics` object of the `metrics.k8s.io` api.
    /// Resources that the metrics server doesn't report are recorded as zero.
    pub fn from_pod_metrics(
        pod: ObjectIdRef,
        metrics: &K8sResource,
    ) -> Result<Vec<PodUsage>, InvalidResourceError> {
        let timestamp = metrics.timestamp_millis("/timestamp").unwrap_or(0);
        let duration = match metrics.str_value("/window") {
            Some(window) => parse_window(window).ok_or_else(|| {
                InvalidResourceError::new("malformed metrics window", metrics.as_ref().clone())
            })?,
            None => 0,
        };

        metrics
            .array("/containers")
            .iter()
            .map(|container| -> Result<PodUsage, InvalidResourceError> {
                let name = container.get("name").and_then(Value::as_str).ok_or_else(|| {
                    InvalidResourceError::new("container metrics are missing name", container.clone())
                })?;
                let usage = |resource: &str| -> Result<f64, InvalidResourceError> {
                    match container.pointer(&format!("/usage/{}", resource)).and_then(Value::as_str) {
                        Some(raw) => quantity::parse(raw).map_err(|_| {
                            InvalidResourceError::new("malformed usage quantity", container.clone())
                        }),
                        None => Ok(0.0),
                    }
                };
                Ok(PodUsage {
                    container_id: EntityId::container(pod.namespace, pod.name, name),
                    pod_id: pod.entity_id(),
                    namespace: pod.namespace.to_owned(),
                    pod_name: pod.name.to_owned(),
                    container_name: name.to_owned(),
                    timestamp,
                    duration,
                    cpu_usage: usage("cpu")?,
                    memory_usage: usage("memory")? / MIB,
                    storage_usage: usage("storage")? / MIB,
                    ephemeral_storage_usage: usage("ephemeral-storage")? / MIB,
                })
            })
            .collect()
    }
}

impl Entity for PodUsage {
    fn table() -> &'static Table {
        &POD_METRICS
    }

    fn to_row(&self) -> Row {
        vec![
            self.container_id.into(),
            self.pod_id.into(),
            self.namespace.as_str().into(),
            self.pod_name.as_str().into(),
            self.container_name.as_str().into(),
            self.timestamp.into(),
            self.duration.into(),
            self.cpu_usage.into(),
            self.memory_usage.into(),
            self.storage_usage.into(),
            self.ephemeral_storage_usage.into(),
        ]
    }
}

/// Parses a duration like `30s`, `1m0.5s` or `500ms` into milliseconds
fn parse_window(window: &str) -> Option<i64> {
    lazy_static! {
        static ref PART: Regex = Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").unwrap();
    }
    let mut total = 0.0;
    let mut consumed = 0;
    for captures in PART.captures_iter(window) {
        let whole = captures.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let amount: f64 = captures[1].parse().ok()?;
        let millis = match &captures[2] {
            "ns" => amount / 1_000_000.0,
            "us" | "µs" => amount / 1_000.0,
            "ms" => amount,
            "s" => amount * 1_000.0,
            "m" => amount * 60_000.0,
            _ => amount * 3_600_000.0,
        };
        total += millis;
    }
    if consumed == 0 || consumed != window.len() {
        return None;
    }
    Some(total.round() as i64)
}
