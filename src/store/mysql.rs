use crate::identity::EntityId;
use crate::schema::{Cascade, Row, SqlValue, Table};
use crate::store::{check_shape, Store, StoreError, UpsertStatement};

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row as _, TypeInfo};

/// `Store` backed by a MySQL (or MariaDB) connection pool. The pool is internally synchronized, so a
/// single `MySqlStore` is shared between all tasks.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> MySqlStore {
        MySqlStore { pool }
    }

    pub async fn connect(url: &str) -> Result<MySqlStore, StoreError> {
        let pool = MySqlPool::connect(url).await?;
        Ok(MySqlStore::new(pool))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn upsert(&self, statement: &UpsertStatement, rows: Vec<Row>) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        check_shape(statement.table, &rows)?;
        let sql = statement.to_sql(rows.len());
        log::trace!("Executing: {}", sql);
        let result = bind_rows(sqlx::query(&sql), rows)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn replace(
        &self,
        table: &'static Table,
        foreign_key: &'static str,
        owner: EntityId,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        check_shape(table, &rows)?;
        let mut tx = self.pool.begin().await?;

        let delete = format!("DELETE FROM {} WHERE {} = ?", table.name, foreign_key);
        let deleted = sqlx::query(&delete)
            .bind(owner.to_vec())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let inserted = rows.len();
        if !rows.is_empty() {
            let sql = UpsertStatement::new(table).to_sql(rows.len());
            bind_rows(sqlx::query(&sql), rows)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        log::debug!(
            "Replaced {} rows of {} for {}={} with {} rows",
            deleted,
            table,
            foreign_key,
            owner,
            inserted
        );
        Ok(())
    }

    async fn delete(&self, step: &Cascade, owner: EntityId) -> Result<u64, StoreError> {
        let sql = match *step {
            Cascade::Direct { table, column } => {
                format!("DELETE FROM {} WHERE {} = ?", table.name, column)
            }
            Cascade::Through {
                table,
                column,
                via,
                via_column,
            } => format!(
                "DELETE FROM {} WHERE {} IN (SELECT {} FROM {} WHERE {} = ?)",
                table.name, column, via.key[0], via.name, via_column
            ),
        };
        log::trace!("Executing: {}", sql);
        let result = sqlx::query(&sql)
            .bind(owner.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn select(
        &self,
        table: &'static Table,
        columns: &[&'static str],
    ) -> Result<Vec<Row>, StoreError> {
        let sql = format!("SELECT {} FROM {}", columns.join(", "), table.name);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let values = (0..columns.len())
                .map(|i| decode_column(row, i))
                .collect::<Result<Row, sqlx::Error>>()?;
            result.push(values);
        }
        Ok(result)
    }
}

fn bind_rows(
    mut query: Query<'_, MySql, MySqlArguments>,
    rows: Vec<Row>,
) -> Query<'_, MySql, MySqlArguments> {
    for value in rows.into_iter().flatten() {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(b),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Float(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
            SqlValue::Binary(bytes) => query.bind(bytes),
        };
    }
    query
}

fn decode_column(row: &MySqlRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    let type_name = row.column(index).type_info().name().to_owned();
    let value = match type_name.as_str() {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(index)?.map(SqlValue::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(index)?.map(SqlValue::Int)
        }
        unsigned if unsigned.ends_with("UNSIGNED") => row
            .try_get::<Option<u64>, _>(index)?
            .map(|v| SqlValue::Int(v as i64)),
        "FLOAT" | "DOUBLE" => row.try_get::<Option<f64>, _>(index)?.map(SqlValue::Float),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Option<Vec<u8>>, _>(index)?
            .map(SqlValue::Binary),
        _ => row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
