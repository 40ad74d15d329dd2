//! SQLite Driver
//!
//! Implements the Driver trait for SQLite database files using SQLx.
//!
//! The pool holds exactly one connection that never idles out, so session
//! state (temp tables, `:memory:` databases) lives as long as the driver.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteQueryResult, SqliteRow,
};
use sqlx::{Row, ValueRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::dispatcher::{execute_on, with_cancel, RowDecoder};
use crate::engine::drivers::{catalog_query, column_list, ping_pool};
use crate::engine::error::{DriverError, DriverResult};
use crate::engine::traits::Driver;
use crate::engine::types::{
    Column, ConnectParams, Constraint, EngineTag, KeyKind, QueryResult, Value,
};

const MEMORY_PATH: &str = ":memory:";

const TABLES_SQL: &str = "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name";

const COLUMNS_SQL: &str = r#"
    SELECT name, type, "notnull", dflt_value, pk
    FROM pragma_table_info(?1)
    ORDER BY cid
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT id, "table", "from", "to", on_update, on_delete
    FROM pragma_foreign_key_list(?1)
    ORDER BY id, seq
"#;

type ForeignKeyRow = (i64, String, String, Option<String>, String, String);

/// Strips the URL-ish prefixes users paste from other tools.
pub fn database_path(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("file:"))
        .unwrap_or(raw)
}

/// Columns of one foreign key, collected across its `seq` rows
struct ForeignKey {
    table: String,
    from: Vec<String>,
    to: Vec<String>,
    on_update: String,
    on_delete: String,
}

fn group_foreign_keys(rows: Vec<ForeignKeyRow>) -> BTreeMap<i64, ForeignKey> {
    let mut keys: BTreeMap<i64, ForeignKey> = BTreeMap::new();

    for (id, table, from, to, on_update, on_delete) in rows {
        let key = keys.entry(id).or_insert_with(|| ForeignKey {
            table,
            from: Vec::new(),
            to: Vec::new(),
            on_update,
            on_delete,
        });
        key.from.push(from);
        // NULL `to` means the parent's primary key
        if let Some(to) = to {
            key.to.push(to);
        }
    }

    keys
}

fn foreign_key_constraint(table: &str, id: i64, key: &ForeignKey) -> Constraint {
    let target = if key.to.is_empty() {
        key.table.clone()
    } else {
        format!("{}({})", key.table, column_list(&key.to))
    };

    Constraint {
        name: format!("fk_{table}_{id}"),
        kind: "FOREIGN KEY".to_string(),
        definition: format!(
            "REFERENCES {} ON UPDATE {} ON DELETE {}",
            target, key.on_update, key.on_delete
        ),
    }
}

/// SQLite driver implementation
pub struct SqliteDriver {
    pool: Option<SqlitePool>,
}

impl SqliteDriver {
    const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self { pool: None }
    }

    fn pool(&self) -> DriverResult<&SqlitePool> {
        self.pool.as_ref().ok_or_else(DriverError::not_connected)
    }

    fn connect_options(path: &str) -> DriverResult<SqliteConnectOptions> {
        let options = if path == MEMORY_PATH {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(DriverError::connection)?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        Ok(options
            .foreign_keys(true)
            .busy_timeout(Self::BUSY_TIMEOUT))
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RowDecoder for Sqlite {
    fn decode_cell(row: &SqliteRow, idx: usize) -> Value {
        match row.try_get_raw(idx) {
            Ok(raw) if !raw.is_null() => {}
            _ => return Value::Null,
        }

        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Value::Int(v);
        }
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Value::Float(v);
        }
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Value::Text(v);
        }
        if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
            return Value::Bytes(v);
        }

        // Declared types such as DATETIME or BOOLEAN carry no strict mapping
        if let Ok(v) = row.try_get_unchecked::<String, _>(idx) {
            return Value::Text(v);
        }
        row.try_get_unchecked::<Vec<u8>, _>(idx)
            .map(Value::Bytes)
            .unwrap_or(Value::Null)
    }

    fn rows_affected(done: &SqliteQueryResult) -> u64 {
        done.rows_affected()
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn engine(&self) -> EngineTag {
        EngineTag::Sqlite
    }

    #[instrument(skip(self, params), fields(engine = "sqlite", path = %params.database))]
    async fn connect(&mut self, params: ConnectParams) -> DriverResult<()> {
        if self.pool.is_some() {
            return Err(DriverError::connection("sqlite: already connected"));
        }
        params
            .validate_for(EngineTag::Sqlite)
            .map_err(DriverError::connection)?;

        if params.tunnel.is_some() {
            warn!("ssh tunnel ignored for file database");
        }

        let path = database_path(&params.database);
        let options = Self::connect_options(path)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DriverError::connection)?;

        info!(path, "connected");
        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn ping(&self, cancel: &CancellationToken) -> DriverResult<()> {
        ping_pool(self.pool()?, cancel).await
    }

    #[instrument(skip(self, cancel, sql), fields(engine = "sqlite", sql_len = sql.len()))]
    async fn execute(&self, cancel: &CancellationToken, sql: &str) -> DriverResult<QueryResult> {
        execute_on(self.pool()?, cancel, sql).await
    }

    async fn list_tables(&self, cancel: &CancellationToken) -> DriverResult<Vec<String>> {
        let pool = self.pool()?;
        let names: Vec<String> =
            catalog_query(cancel, sqlx::query_scalar(TABLES_SQL).fetch_all(pool)).await?;

        Ok(names)
    }

    async fn list_columns(&self, cancel: &CancellationToken, table: &str) -> DriverResult<Vec<Column>> {
        let pool = self.pool()?;
        let rows: Vec<(String, String, i64, Option<String>, i64)> = catalog_query(
            cancel,
            sqlx::query_as(COLUMNS_SQL).bind(table).fetch_all(pool),
        )
        .await?;

        let columns = rows
            .into_iter()
            .map(|(name, data_type, not_null, default_value, pk)| Column {
                name,
                data_type,
                // A rowid alias never holds NULL even though the pragma says otherwise
                nullable: not_null == 0 && pk == 0,
                default_value,
                key: if pk > 0 {
                    KeyKind::Primary
                } else {
                    KeyKind::None
                },
            })
            .collect();

        Ok(columns)
    }

    async fn list_constraints(
        &self,
        cancel: &CancellationToken,
        table: &str,
    ) -> DriverResult<Vec<Constraint>> {
        let pool = self.pool()?;
        let query = sqlx::query_as::<_, ForeignKeyRow>(FOREIGN_KEYS_SQL)
            .bind(table)
            .fetch_all(pool);

        let rows = match with_cancel(cancel, query).await {
            Err(cancelled) => return Err(DriverError::query(cancelled)),
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                debug!(table, error = %e, "foreign key pragma failed");
                return Ok(Vec::new());
            }
        };

        let constraints = group_foreign_keys(rows)
            .iter()
            .map(|(id, key)| foreign_key_constraint(table, *id, key))
            .collect();

        Ok(constraints)
    }
}
