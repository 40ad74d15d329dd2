//! Driver trait definition
//!
//! This is the contract every engine adapter implements. One adapter instance
//! owns exactly one logical connection: it is constructed unconnected by the
//! registry, connected once, used, then closed. There is no reconnect in
//! place; a new attempt uses a new instance.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::error::DriverResult;
use crate::engine::types::{Column, ConnectParams, Constraint, EngineTag, QueryResult};

/// Core trait that all engine adapters implement
///
/// Operations that take a [`CancellationToken`] return promptly with a
/// cancellation error once the token fires. The engine may keep working on
/// its side until it notices the dropped request.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Engine this instance was built for
    fn engine(&self) -> EngineTag;

    /// Establishes the connection, through an SSH tunnel when `params.tunnel`
    /// is set, and applies engine session settings.
    async fn connect(&mut self, params: ConnectParams) -> DriverResult<()>;

    /// Releases the connection. Safe to call on a never-connected instance
    /// and safe to call twice.
    async fn close(&mut self) -> DriverResult<()>;

    /// Liveness check
    async fn ping(&self, cancel: &CancellationToken) -> DriverResult<()>;

    /// Runs exactly one statement. Splitting a script is the caller's job,
    /// see [`crate::engine::dispatcher::split_statements`].
    async fn execute(&self, cancel: &CancellationToken, sql: &str) -> DriverResult<QueryResult>;

    /// Names of user tables
    async fn list_tables(&self, cancel: &CancellationToken) -> DriverResult<Vec<String>>;

    /// Columns of `table` in declaration order
    async fn list_columns(&self, cancel: &CancellationToken, table: &str) -> DriverResult<Vec<Column>>;

    /// Named constraints of `table`
    async fn list_constraints(
        &self,
        cancel: &CancellationToken,
        table: &str,
    ) -> DriverResult<Vec<Constraint>>;
}
