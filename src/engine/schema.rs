//! Schema loading
//!
//! Collects columns and constraints for every table of the connected
//! database, with a bounded number of catalog requests in flight.

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::engine::error::DriverResult;
use crate::engine::traits::Driver;
use crate::engine::types::TableSchema;

/// In-flight table requests used by the UI's schema refresh
pub const DEFAULT_CONCURRENCY: usize = 4;

async fn load_table(
    driver: &dyn Driver,
    cancel: &CancellationToken,
    name: String,
) -> DriverResult<TableSchema> {
    let columns = driver.list_columns(cancel, &name).await?;
    let constraints = driver.list_constraints(cancel, &name).await?;

    Ok(TableSchema {
        name,
        columns,
        constraints,
    })
}

/// Loads every table's schema in `list_tables` order.
///
/// Stops at the first failing table.
#[instrument(skip(driver, cancel), fields(engine = %driver.engine()))]
pub async fn load_schema(
    driver: &dyn Driver,
    cancel: &CancellationToken,
    concurrency: usize,
) -> DriverResult<Vec<TableSchema>> {
    let tables = driver.list_tables(cancel).await?;
    debug!(tables = tables.len(), "loading schema");

    stream::iter(tables)
        .map(|name| load_table(driver, cancel, name))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::drivers::sqlite::SqliteDriver;
    use crate::engine::types::{ConnectParams, KeyKind};
    use tempfile::TempDir;

    #[tokio::test]
    async fn loads_tables_in_order_with_details() {
        let dir = TempDir::new().unwrap();
        let mut driver = SqliteDriver::new();
        driver
            .connect(ConnectParams::file(dir.path().join("schema.db").to_string_lossy()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        for sql in [
            "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id))",
            "CREATE TABLE tags (label TEXT)",
        ] {
            driver.execute(&cancel, sql).await.unwrap();
        }

        let schema = load_schema(&driver, &cancel, 0).await.unwrap();
        let names: Vec<_> = schema.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["authors", "books", "tags"]);

        assert_eq!(schema[0].columns[0].key, KeyKind::Primary);
        assert_eq!(schema[1].constraints.len(), 1);
        assert!(schema[2].constraints.is_empty());

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_load_fails() {
        let dir = TempDir::new().unwrap();
        let mut driver = SqliteDriver::new();
        driver
            .connect(ConnectParams::file(dir.path().join("schema.db").to_string_lossy()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = load_schema(&driver, &cancel, DEFAULT_CONCURRENCY)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
