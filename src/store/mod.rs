//! The relational store that everything is mirrored into.
//!
//! Components only ever talk to the `Store` trait, and receive a shared handle to it at construction.
//! There is no locking above the store: concurrent writers only ever upsert, so the last writer for a
//! given key wins.
mod memory;
mod mysql;
pub mod upsert;

pub use self::memory::MemoryStore;
pub use self::mysql::MySqlStore;
pub use self::upsert::{Streamer, StreamerConfig};

use crate::identity::EntityId;
use crate::schema::{Cascade, Row, Table};

use async_trait::async_trait;

use std::fmt::{self, Display};
use std::sync::Arc;

#[derive(Debug)]
pub enum StoreError {
    Sql(sqlx::Error),
    /// A row doesn't match the shape of the table it is written to
    Shape {
        table: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Returned by `MemoryStore` when a failure was injected for a table
    Injected(String),
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sql(e) => Some(e as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StoreError::Sql(ref e) => write!(f, "Database error: {}", e),
            StoreError::Shape {
                table,
                expected,
                actual,
            } => write!(
                f,
                "Row for table '{}' has {} values but the table has {} columns",
                table, actual, expected
            ),
            StoreError::Injected(ref message) => write!(f, "Injected failure: {}", message),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> StoreError {
        StoreError::Sql(e)
    }
}

/// What happens when an inserted row collides with an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Refresh every non-key column
    UpdateAll,
    /// Refresh only the given columns
    Update(&'static [&'static str]),
    /// Keep the existing row as is
    Ignore,
}

/// An `INSERT ... ON DUPLICATE KEY UPDATE` statement for one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStatement {
    pub table: &'static Table,
    pub on_conflict: OnConflict,
}

impl UpsertStatement {
    pub fn new(table: &'static Table) -> UpsertStatement {
        UpsertStatement {
            table,
            on_conflict: OnConflict::UpdateAll,
        }
    }

    pub fn updating(table: &'static Table, columns: &'static [&'static str]) -> UpsertStatement {
        UpsertStatement {
            table,
            on_conflict: OnConflict::Update(columns),
        }
    }

    pub fn insert_if_absent(table: &'static Table) -> UpsertStatement {
        UpsertStatement {
            table,
            on_conflict: OnConflict::Ignore,
        }
    }

    /// The columns that are overwritten when a row with the same key exists already
    pub fn updated_columns(&self) -> Vec<&'static str> {
        match self.on_conflict {
            OnConflict::UpdateAll => self.table.value_columns().collect(),
            OnConflict::Update(columns) => columns.to_vec(),
            OnConflict::Ignore => Vec::new(),
        }
    }

    /// Renders the statement for MySQL with positional placeholders for `row_count` rows
    pub fn to_sql(&self, row_count: usize) -> String {
        let columns = self.table.columns.join(", ");
        let placeholders = format!("({})", vec!["?"; self.table.columns.len()].join(", "));
        let values = vec![placeholders.as_str(); row_count].join(", ");

        let updates = self.updated_columns();
        let on_duplicate = if updates.is_empty() {
            // a no-op assignment keeps the statement valid for tables that are all key
            let first = self.table.key[0];
            format!("{}={}", first, first)
        } else {
            updates
                .iter()
                .map(|c| format!("{}=VALUES({})", c, c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
            self.table.name, columns, values, on_duplicate
        )
    }
}

/// Write and read primitives of the relational store. Implementations must be safe to share between
/// any number of concurrent tasks.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Writes all rows with a single statement, returning the number of affected rows
    async fn upsert(&self, statement: &UpsertStatement, rows: Vec<Row>) -> Result<u64, StoreError>;

    /// Replaces every row of `table` whose `foreign_key` column holds `owner` with the given rows
    async fn replace(
        &self,
        table: &'static Table,
        foreign_key: &'static str,
        owner: EntityId,
        rows: Vec<Row>,
    ) -> Result<(), StoreError>;

    /// Executes one cascade step for `owner`, returning the number of deleted rows
    async fn delete(&self, step: &Cascade, owner: EntityId) -> Result<u64, StoreError>;

    /// Reads the given columns of every row of the table
    async fn select(
        &self,
        table: &'static Table,
        columns: &[&'static str],
    ) -> Result<Vec<Row>, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn upsert(&self, statement: &UpsertStatement, rows: Vec<Row>) -> Result<u64, StoreError> {
        (**self).upsert(statement, rows).await
    }

    async fn replace(
        &self,
        table: &'static Table,
        foreign_key: &'static str,
        owner: EntityId,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        (**self).replace(table, foreign_key, owner, rows).await
    }

    async fn delete(&self, step: &Cascade, owner: EntityId) -> Result<u64, StoreError> {
        (**self).delete(step, owner).await
    }

    async fn select(
        &self,
        table: &'static Table,
        columns: &[&'static str],
    ) -> Result<Vec<Row>, StoreError> {
        (**self).select(table, columns).await
    }
}

pub(crate) fn check_shape(table: &'static Table, rows: &[Row]) -> Result<(), StoreError> {
    match rows.iter().find(|row| row.len() != table.columns.len()) {
        Some(row) => Err(StoreError::Shape {
            table: table.name,
            expected: table.columns.len(),
            actual: row.len(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{Granularity, SqlValue, LABEL, POD_LABEL};

    #[test]
    fn renders_upsert_updating_value_columns() {
        let statement = UpsertStatement::new(&LABEL);
        assert_eq!(
            "INSERT INTO label (id, name, value) VALUES (?, ?, ?), (?, ?, ?) ON DUPLICATE KEY UPDATE name=VALUES(name), value=VALUES(value)",
            statement.to_sql(2)
        );
    }

    #[test]
    fn renders_telemetry_upsert_that_only_refreshes_the_value() {
        let statement = UpsertStatement::updating(Granularity::Node.table(), &["value"]);
        assert_eq!(
            "INSERT INTO prometheus_node_metric (node_id, timestamp, category, name, value) VALUES (?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE value=VALUES(value)",
            statement.to_sql(1)
        );
    }

    #[test]
    fn tables_without_value_columns_get_a_no_op_update() {
        assert_eq!(
            "INSERT INTO pod_label (pod_id, label_id) VALUES (?, ?) ON DUPLICATE KEY UPDATE pod_id=pod_id",
            UpsertStatement::new(&POD_LABEL).to_sql(1)
        );
        assert!(UpsertStatement::insert_if_absent(&LABEL)
            .updated_columns()
            .is_empty());
    }

    #[test]
    fn rows_must_match_the_table() {
        let rows = vec![vec![SqlValue::Null]];
        let err = check_shape(&LABEL, &rows).expect_err("expected an error");
        assert_eq!(
            "Row for table 'label' has 1 values but the table has 3 columns",
            err.to_string()
        );
    }
}
