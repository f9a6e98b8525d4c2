use crate::identity::EntityId;
use crate::schema::{Cascade, Row, SqlValue, Table};
use crate::store::{check_shape, Store, StoreError, UpsertStatement};

use async_trait::async_trait;
use tokio::sync::Mutex;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<&'static str, Vec<Row>>,
    /// sizes of every upsert, per table, in the order they were executed
    batches: HashMap<&'static str, Vec<usize>>,
    failing: HashSet<&'static str>,
}

/// A `Store` that keeps every table in memory. It honours primary keys, so repeated upserts of the
/// same key leave a single row, just like the database does. Cloning it yields another handle to the
/// same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Makes every subsequent write to the given table fail
    pub async fn fail_writes_to(&self, table: &'static Table) {
        self.inner.lock().await.failing.insert(table.name);
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failing.clear();
    }

    /// Returns a copy of all rows of the table, in insertion order
    pub async fn rows(&self, table: &'static Table) -> Vec<Row> {
        let inner = self.inner.lock().await;
        inner.tables.get(table.name).cloned().unwrap_or_default()
    }

    /// Returns the rows of the table whose `column` holds the given value
    pub async fn find(
        &self,
        table: &'static Table,
        column: &str,
        value: impl Into<SqlValue>,
    ) -> Vec<Row> {
        let value = value.into();
        let index = match table.column_index(column) {
            Some(i) => i,
            None => return Vec::new(),
        };
        self.rows(table)
            .await
            .into_iter()
            .filter(|row| row[index] == value)
            .collect()
    }

    /// Returns the number of rows written by each upsert of the table
    pub async fn batches(&self, table: &'static Table) -> Vec<usize> {
        let inner = self.inner.lock().await;
        inner.batches.get(table.name).cloned().unwrap_or_default()
    }
}

impl Inner {
    fn check_failure(&self, table: &'static Table) -> Result<(), StoreError> {
        if self.failing.contains(table.name) {
            Err(StoreError::Injected(format!("writes to {} are failing", table)))
        } else {
            Ok(())
        }
    }

    fn upsert(&mut self, statement: &UpsertStatement, rows: Vec<Row>) -> u64 {
        let table = statement.table;
        let key_indices: Vec<usize> = table
            .key
            .iter()
            .filter_map(|k| table.column_index(k))
            .collect();
        let update_indices: Vec<usize> = statement
            .updated_columns()
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();

        let existing = self.tables.entry(table.name).or_default();
        let mut affected = 0;
        for row in rows {
            let position = existing
                .iter()
                .position(|e| key_indices.iter().all(|i| e[*i] == row[*i]));
            match position {
                Some(pos) => {
                    for i in update_indices.iter() {
                        existing[pos][*i] = row[*i].clone();
                    }
                }
                None => existing.push(row),
            }
            affected += 1;
        }
        affected
    }

    fn delete_where(&mut self, table: &'static Table, column: &str, values: &[SqlValue]) -> u64 {
        let index = match table.column_index(column) {
            Some(i) => i,
            None => return 0,
        };
        let rows = self.tables.entry(table.name).or_default();
        let before = rows.len();
        rows.retain(|row| !values.contains(&row[index]));
        (before - rows.len()) as u64
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(&self, statement: &UpsertStatement, rows: Vec<Row>) -> Result<u64, StoreError> {
        check_shape(statement.table, &rows)?;
        let mut inner = self.inner.lock().await;
        inner.check_failure(statement.table)?;
        inner
            .batches
            .entry(statement.table.name)
            .or_default()
            .push(rows.len());
        Ok(inner.upsert(statement, rows))
    }

    async fn replace(
        &self,
        table: &'static Table,
        foreign_key: &'static str,
        owner: EntityId,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        check_shape(table, &rows)?;
        // a single lock makes the delete and the insert atomic, like the transaction in the database
        let mut inner = self.inner.lock().await;
        inner.check_failure(table)?;
        inner.delete_where(table, foreign_key, &[owner.into()]);
        inner.upsert(&UpsertStatement::new(table), rows);
        Ok(())
    }

    async fn delete(&self, step: &Cascade, owner: EntityId) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        match *step {
            Cascade::Direct { table, column } => {
                inner.check_failure(table)?;
                Ok(inner.delete_where(table, column, &[owner.into()]))
            }
            Cascade::Through {
                table,
                column,
                via,
                via_column,
            } => {
                inner.check_failure(table)?;
                let owner: SqlValue = owner.into();
                let (via_index, key_index) = match (via.column_index(via_column), via.column_index(via.key[0])) {
                    (Some(v), Some(k)) => (v, k),
                    _ => return Ok(0),
                };
                let keys: Vec<SqlValue> = inner
                    .tables
                    .get(via.name)
                    .map(|rows| {
                        rows.iter()
                            .filter(|row| row[via_index] == owner)
                            .map(|row| row[key_index].clone())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(inner.delete_where(table, column, &keys))
            }
        }
    }

    async fn select(
        &self,
        table: &'static Table,
        columns: &[&'static str],
    ) -> Result<Vec<Row>, StoreError> {
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        let inner = self.inner.lock().await;
        let rows = inner
            .tables
            .get(table.name)
            .map(|rows| {
                rows.iter()
                    .map(|row| indices.iter().map(|i| row[*i].clone()).collect())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{CONTAINER, LABEL, POD_LABEL};
    use tokio::runtime;

    fn label_row(name: &str, value: &str) -> Row {
        vec![
            EntityId::label(name, value).into(),
            name.into(),
            value.into(),
        ]
    }

    #[test]
    fn upsert_keeps_one_row_per_key() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            let statement = UpsertStatement::new(&LABEL);
            store
                .upsert(&statement, vec![label_row("app", "web")])
                .await
                .unwrap();
            let mut changed = label_row("app", "web");
            changed[2] = "WEB".into();
            store.upsert(&statement, vec![changed]).await.unwrap();

            let rows = store.rows(&LABEL).await;
            assert_eq!(1, rows.len());
            assert_eq!(SqlValue::from("WEB"), rows[0][2]);
            assert_eq!(vec![1, 1], store.batches(&LABEL).await);
        });
    }

    #[test]
    fn insert_if_absent_keeps_the_existing_row() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            store
                .upsert(&UpsertStatement::new(&LABEL), vec![label_row("app", "web")])
                .await
                .unwrap();
            let mut changed = label_row("app", "web");
            changed[1] = "other".into();
            store
                .upsert(&UpsertStatement::insert_if_absent(&LABEL), vec![changed])
                .await
                .unwrap();
            assert_eq!(SqlValue::from("app"), store.rows(&LABEL).await[0][1]);
        });
    }

    #[test]
    fn replace_only_touches_rows_of_the_owner() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            let a = EntityId::object("default", "a");
            let b = EntityId::object("default", "b");
            let l1 = EntityId::label("x", "1");
            let l2 = EntityId::label("x", "2");
            store
                .replace(&POD_LABEL, "pod_id", a, vec![vec![a.into(), l1.into()]])
                .await
                .unwrap();
            store
                .replace(&POD_LABEL, "pod_id", b, vec![vec![b.into(), l1.into()]])
                .await
                .unwrap();
            store
                .replace(&POD_LABEL, "pod_id", a, vec![vec![a.into(), l2.into()]])
                .await
                .unwrap();

            assert_eq!(
                vec![vec![SqlValue::from(a), SqlValue::from(l2)]],
                store.find(&POD_LABEL, "pod_id", a).await
            );
            assert_eq!(1, store.find(&POD_LABEL, "pod_id", b).await.len());
        });
    }

    #[test]
    fn injected_failures_fail_writes() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            store.fail_writes_to(&LABEL).await;
            let err = store
                .upsert(&UpsertStatement::new(&LABEL), vec![label_row("a", "b")])
                .await
                .expect_err("expected an error");
            assert!(matches!(err, StoreError::Injected(_)));
            assert!(store.rows(&LABEL).await.is_empty());
        });
    }

    #[test]
    fn select_projects_columns() {
        let _ = env_logger::try_init();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            let pod = EntityId::object("default", "web-1");
            let container = EntityId::container("default", "web-1", "nginx");
            let row: Row = vec![
                container.into(),
                pod.into(),
                "nginx".into(),
                "nginx:1".into(),
                true.into(),
                0i64.into(),
                "running".into(),
            ];
            store
                .upsert(&UpsertStatement::new(&CONTAINER), vec![row])
                .await
                .unwrap();
            let selected = store.select(&CONTAINER, &["name", "pod_id"]).await.unwrap();
            assert_eq!(vec![vec![SqlValue::from("nginx"), SqlValue::from(pod)]], selected);
        });
    }
}
