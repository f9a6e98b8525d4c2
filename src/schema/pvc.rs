use crate::identity::EntityId;
use crate::k8s_types::{self, K8sType};
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef};
use crate::schema::{map_labels, strcase, Cascade, Entity, Label, Relation, Resource, Row, Table};

use serde_json::Value;

pub static PVC: Table = Table {
    name: "persistent_volume_claim",
    columns: &[
        "id",
        "namespace",
        "name",
        "uid",
        "resource_version",
        "phase",
        "volume_name",
        "volume_mode",
        "storage_class",
        "created",
    ],
    key: &["id"],
};

pub static PVC_CONDITION: Table = Table {
    name: "pvc_condition",
    columns: &[
        "pvc_id",
        "type",
        "status",
        "last_probe",
        "last_transition",
        "reason",
        "message",
    ],
    key: &["pvc_id", "type"],
};

pub static PVC_LABEL: Table = Table {
    name: "pvc_label",
    columns: &["pvc_id", "label_id"],
    key: &["pvc_id", "label_id"],
};

static PVC_CASCADE: &[Cascade] = &[
    Cascade::Direct {
        table: &PVC_CONDITION,
        column: "pvc_id",
    },
    Cascade::Direct {
        table: &PVC_LABEL,
        column: "pvc_id",
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct Pvc {
    pub id: EntityId,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    pub phase: String,
    pub volume_name: String,
    pub volume_mode: Option<String>,
    pub storage_class: Option<String>,
    pub created: i64,
    pub conditions: Vec<PvcCondition>,
    pub labels: Vec<Label>,
    pub pvc_labels: Vec<PvcLabel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PvcCondition {
    pub pvc_id: EntityId,
    pub condition_type: String,
    pub status: String,
    pub last_probe: Option<i64>,
    pub last_transition: Option<i64>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PvcLabel {
    pub pvc_id: EntityId,
    pub label_id: EntityId,
}

impl Resource for Pvc {
    fn k8s_type() -> &'static K8sType {
        k8s_types::core::v1::PersistentVolumeClaim
    }

    fn cascade() -> &'static [Cascade] {
        PVC_CASCADE
    }

    fn obtain(raw: &K8sResource) -> Result<Pvc, InvalidResourceError> {
        let object_id = raw.get_object_id();
        let id = object_id.entity_id();

        let conditions = raw
            .array("/status/conditions")
            .iter()
            .map(|condition| PvcCondition::obtain(id, condition))
            .collect::<Result<Vec<_>, _>>()?;
        let (labels, pvc_labels) = map_labels(raw, |label_id| PvcLabel {
            pvc_id: id,
            label_id,
        });

        Ok(Pvc {
            id,
            namespace: object_id.namespace.to_owned(),
            name: object_id.name.to_owned(),
            uid: raw.uid().to_owned(),
            resource_version: raw.resource_version().to_owned(),
            phase: strcase::snake(raw.str_value("/status/phase").unwrap_or("")),
            volume_name: raw.str_value("/spec/volumeName").unwrap_or("").to_owned(),
            volume_mode: raw.str_value("/spec/volumeMode").map(str::to_owned),
            storage_class: raw.str_value("/spec/storageClassName").map(str::to_owned),
            created: raw.created(),
            conditions,
            labels,
            pvc_labels,
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
            Relation::has_many("pvc_id", self.id, &self.conditions),
            Relation::dictionary(self.id, &self.labels),
            Relation::has_many("pvc_id", self.id, &self.pvc_labels),
        ]
    }
}

impl Entity for Pvc {
    fn table() -> &'static Table {
        &PVC
    }

    fn to_row(&self) -> Row {
        vec![
            self.id.into(),
            self.namespace.as_str().into(),
            self.name.as_str().into(),
            self.uid.as_str().into(),
            self.resource_version.as_str().into(),
            self.phase.as_str().into(),
            self.volume_name.as_str().into(),
            self.volume_mode.as_deref().into(),
            self.storage_class.as_deref().into(),
            self.created.into(),
        ]
    }
}

impl PvcCondition {
    fn obtain(pvc_id: EntityId, condition: &Value) -> Result<PvcCondition, InvalidResourceError> {
        let condition_type = condition
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidResourceError::new("condition is missing type", condition.clone()))?;
        Ok(PvcCondition {
            pvc_id,
            condition_type: strcase::snake(condition_type),
            status: str_field(condition, "status"),
            last_probe: crate::resource::timestamp_millis(condition, "/lastProbeTime"),
            last_transition: crate::resource::timestamp_millis(condition, "/lastTransitionTime"),
            reason: str_field(condition, "reason"),
            message: str_field(condition, "message"),
        })
    }
}

impl Entity for PvcCondition {
    fn table() -> &'static Table {
        &PVC_CONDITION
    }

    fn to_row(&self) -> Row {
        vec![
            self.pvc_id.into(),
            self.condition_type.as_str().into(),
            self.status.as_str().into(),
            self.last_probe.into(),
            self.last_transition.into(),
            self.reason.as_str().into(),
            self.message.as_str().into(),
        ]
    }
}

impl Entity for PvcLabel {
    fn table() -> &'static Table {
        &PVC_LABEL
    }

    fn to_row(&self) -> Row {
        vec![self.pvc_id.into(), self.label_id.into()]
    }
}

pub(crate) fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned()
}
