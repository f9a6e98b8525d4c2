use crate::identity::EntityId;
use crate::schema::{Entity, Row, Table};

/// Labels are a dictionary shared by all kinds. The same `name=value` pair on two pods is a single row,
/// referenced from `pod_label` by both of them.
pub static LABEL: Table = Table {
    name: "label",
    columns: &["id", "name", "value"],
    key: &["id"],
};

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub id: EntityId,
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: &str, value: &str) -> Label {
        Label {
            id: EntityId::label(name, value),
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }
}

impl Entity for Label {
    fn table() -> &'static Table {
        &LABEL
    }

    fn to_row(&self) -> Row {
        vec![
            self.id.into(),
            self.name.as_str().into(),
            self.value.as_str().into(),
        ]
    }
}
