//! Engine adapters
//!
//! Each adapter is an independent [`Driver`](crate::engine::Driver)
//! implementation. What they share lives here: resolving the endpoint to dial
//! (direct or through an SSH forward) and the cancellation plumbing around
//! pool calls.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::future::Future;

use sqlx::{Connection, Database, Pool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::dispatcher::with_cancel;
use crate::engine::error::{DriverError, DriverResult};
use crate::engine::ssh_tunnel::{LocalForward, SshTunnel};
use crate::engine::types::{ConnectParams, EngineTag};

/// SSH session plus the loopback forward an engine pool dials into
pub(crate) struct TunnelTransport {
    tunnel: SshTunnel,
    forward: LocalForward,
}

impl TunnelTransport {
    pub(crate) async fn close(self) {
        self.forward.close();
        if let Err(e) = self.tunnel.close().await {
            warn!(ssh = %self.tunnel.address(), error = %e, "failed to close ssh session");
        }
    }
}

/// Host and port an engine client should dial
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: Option<TunnelTransport>,
}

impl Endpoint {
    /// Direct endpoint, or a loopback forward through the configured tunnel.
    pub(crate) async fn open(params: &ConnectParams, engine: EngineTag) -> DriverResult<Self> {
        let port = params.effective_port(engine);

        let Some(tunnel_config) = params.tunnel.as_ref() else {
            return Ok(Self {
                host: params.host.clone(),
                port,
                transport: None,
            });
        };

        let tunnel = SshTunnel::connect(tunnel_config).await?;
        let forward = match tunnel.forward(&params.host, port).await {
            Ok(forward) => forward,
            Err(e) => {
                let _ = tunnel.close().await;
                return Err(e);
            }
        };
        debug!(
            local_port = forward.port(),
            remote = %format!("{}:{}", params.host, port),
            "routing engine connection through ssh"
        );

        Ok(Self {
            host: forward.local_addr().ip().to_string(),
            port: forward.port(),
            transport: Some(TunnelTransport { tunnel, forward }),
        })
    }

    /// Tears down the tunnel after a failed connect.
    pub(crate) async fn abandon(self) {
        if let Some(transport) = self.transport {
            transport.close().await;
        }
    }
}

/// Runs a catalog query, folding cancellation and engine errors into `QueryError`.
pub(crate) async fn catalog_query<T, F>(cancel: &CancellationToken, work: F) -> DriverResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    with_cancel(cancel, work)
        .await
        .map_err(DriverError::query)?
        .map_err(DriverError::query)
}

/// Acquires a pooled connection and pings it.
pub(crate) async fn ping_pool<DB>(pool: &Pool<DB>, cancel: &CancellationToken) -> DriverResult<()>
where
    DB: Database,
{
    let ping = async {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    };

    with_cancel(cancel, ping)
        .await
        .map_err(DriverError::connection)?
        .map_err(DriverError::connection)
}

/// Joins column names for constraint definitions.
pub(crate) fn column_list(columns: &[String]) -> String {
    columns.join(", ")
}
