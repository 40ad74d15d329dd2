//! Universal data types for the dbterm engine
//!
//! These types provide a normalized representation of connection settings,
//! query results and schema metadata across SQLite, PostgreSQL and MySQL.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::DriverError;

/// Database engine selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineTag {
    Postgres,
    Mysql,
    Sqlite,
}

impl EngineTag {
    pub const ALL: [EngineTag; 3] = [EngineTag::Postgres, EngineTag::Mysql, EngineTag::Sqlite];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineTag::Postgres => "postgres",
            EngineTag::Mysql => "mysql",
            EngineTag::Sqlite => "sqlite",
        }
    }

    /// Port used when the caller leaves it unset. File engines have none.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            EngineTag::Postgres => Some(5432),
            EngineTag::Mysql => Some(3306),
            EngineTag::Sqlite => None,
        }
    }

    pub fn is_file_based(&self) -> bool {
        matches!(self, EngineTag::Sqlite)
    }
}

impl fmt::Display for EngineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineTag {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(EngineTag::Postgres),
            "mysql" | "mariadb" => Ok(EngineTag::Mysql),
            "sqlite" | "sqlite3" => Ok(EngineTag::Sqlite),
            _ => Err(DriverError::UnsupportedEngine(s.to_string())),
        }
    }
}

/// Database connection parameters
///
/// For SQLite `database` holds the file path and the network fields are ignored.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parameters for a file engine
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            database: path.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Port to dial, falling back to the engine default when unset
    pub fn effective_port(&self, engine: EngineTag) -> u16 {
        match (self.port, engine.default_port()) {
            (0, Some(default)) => default,
            (port, _) => port,
        }
    }

    /// Rejects parameters that can never produce a connection for `engine`.
    pub fn validate_for(&self, engine: EngineTag) -> Result<(), String> {
        if engine.is_file_based() {
            if self.database.trim().is_empty() {
                return Err(format!("{engine}: database path is required"));
            }
            return Ok(());
        }

        if self.host.trim().is_empty() {
            return Err(format!("{engine}: host is required"));
        }
        if self.user.trim().is_empty() {
            return Err(format!("{engine}: user is required"));
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.validate()?;
        }
        Ok(())
    }

    /// `user@host:port/database`, suitable for logs and status lines
    pub fn display_target(&self, engine: EngineTag) -> String {
        if engine.is_file_based() {
            return self.database.clone();
        }
        format!(
            "{}@{}:{}/{}{}",
            self.user,
            self.host,
            self.effective_port(engine),
            self.database,
            if self.tunnel.is_some() { " (SSH)" } else { "" }
        )
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redacted(&self.password))
            .field("database", &self.database)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

/// SSH tunnel configuration
///
/// Only read while the tunnel is being established.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Try the authentication agent before any other method.
    #[serde(default)]
    pub use_agent: bool,
}

fn default_ssh_port() -> u16 {
    22
}

impl TunnelConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn with_agent(mut self, use_agent: bool) -> Self {
        self.use_agent = use_agent;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("ssh: host is required".to_string());
        }
        if self.user.trim().is_empty() {
            return Err("ssh: user is required".to_string());
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        let port = if self.port == 0 { default_ssh_port() } else { self.port };
        format!("{}:{}", self.host, port)
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_deref().map(redacted))
            .field("private_key_path", &self.private_key_path)
            .field("use_agent", &self.use_agent)
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "***"
    }
}

/// Key classification reported for a column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    #[serde(rename = "PRI")]
    Primary,
    #[serde(rename = "UNI")]
    Unique,
    #[serde(rename = "MUL")]
    Multiple,
    #[default]
    #[serde(rename = "")]
    None,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Primary => "PRI",
            KeyKind::Unique => "UNI",
            KeyKind::Multiple => "MUL",
            KeyKind::None => "",
        }
    }

    /// Parses the `COLUMN_KEY` spelling used by the catalogs; unknown text maps to `None`.
    pub fn from_catalog(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "PRI" => KeyKind::Primary,
            "UNI" => KeyKind::Unique,
            "MUL" => KeyKind::Multiple,
            _ => KeyKind::None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column metadata for table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared type exactly as the engine reports it
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub key: KeyKind,
}

/// A named table constraint, rendered for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    /// e.g. `PRIMARY KEY`, `FOREIGN KEY`, `UNIQUE`
    pub kind: String,
    pub definition: String,
}

/// Loosely typed cell as decoded from an engine row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(rust_decimal::Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// Query execution result
///
/// Cells are already rendered as text. `rows`/`columns` are meaningful when
/// `is_select` is set, `affected_rows` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub row_count: usize,
    pub is_select: bool,
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<String>>, duration: Duration) -> Self {
        Self {
            columns,
            row_count: rows.len(),
            rows,
            duration,
            is_select: true,
            affected_rows: 0,
        }
    }

    pub fn with_affected_rows(affected: u64, duration: Duration) -> Self {
        Self {
            affected_rows: affected,
            duration,
            ..Self::default()
        }
    }

    /// One-line summary handed to the history store
    pub fn summary(&self) -> String {
        let ms = self.duration.as_secs_f64() * 1000.0;
        if self.is_select {
            format!("{} row(s) in {:.2}ms", self.row_count, ms)
        } else {
            format!("{} row(s) affected in {:.2}ms", self.affected_rows, ms)
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(ms / 1000.0).map_err(serde::de::Error::custom)
    }
}

/// Columns and constraints of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub constraints: Vec<Constraint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_tag_parses_aliases_case_insensitively() {
        assert_eq!("Postgres".parse::<EngineTag>().unwrap(), EngineTag::Postgres);
        assert_eq!("postgresql".parse::<EngineTag>().unwrap(), EngineTag::Postgres);
        assert_eq!(" MariaDB ".parse::<EngineTag>().unwrap(), EngineTag::Mysql);
        assert_eq!("sqlite".parse::<EngineTag>().unwrap(), EngineTag::Sqlite);

        let err = "oracle".parse::<EngineTag>().expect_err("unknown engine");
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn password_never_reaches_debug_or_json() {
        let params = ConnectParams::new("db.internal", 5432)
            .with_credentials("app", "hunter2")
            .with_database("orders")
            .with_tunnel(TunnelConfig::new("bastion", "ops").with_password("s3cret"));

        let debug = format!("{params:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));

        let json = serde_json::to_string(&params).expect("serialize");
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn tunnel_config_deserializes_with_defaults() {
        let json = r#"{"host":"bastion","user":"ops","private_key_path":"~/.ssh/id_ed25519"}"#;
        let tunnel: TunnelConfig = serde_json::from_str(json).expect("should parse");

        assert_eq!(tunnel.port, 22);
        assert_eq!(tunnel.password, None);
        assert!(!tunnel.use_agent);
        assert_eq!(tunnel.address(), "bastion:22");
    }

    #[test]
    fn validation_depends_on_engine() {
        let empty_host = ConnectParams::new("", 5432).with_credentials("u", "p");
        assert!(empty_host.validate_for(EngineTag::Postgres).is_err());

        let file = ConnectParams::file("/tmp/app.db");
        assert!(file.validate_for(EngineTag::Sqlite).is_ok());
        assert!(ConnectParams::file("  ").validate_for(EngineTag::Sqlite).is_err());

        let bad_tunnel = ConnectParams::new("db", 3306)
            .with_credentials("u", "p")
            .with_tunnel(TunnelConfig::new("", "ops"));
        assert!(bad_tunnel.validate_for(EngineTag::Mysql).is_err());
    }

    #[test]
    fn effective_port_falls_back_to_engine_default() {
        let params = ConnectParams::new("db", 0);
        assert_eq!(params.effective_port(EngineTag::Postgres), 5432);
        assert_eq!(params.effective_port(EngineTag::Mysql), 3306);
        assert_eq!(ConnectParams::new("db", 6543).effective_port(EngineTag::Postgres), 6543);
    }

    #[test]
    fn display_target_omits_password() {
        let params = ConnectParams::new("db", 0)
            .with_credentials("app", "pw")
            .with_database("shop");
        assert_eq!(params.display_target(EngineTag::Mysql), "app@db:3306/shop");
    }

    #[test]
    fn key_kind_round_trips_catalog_text() {
        assert_eq!(KeyKind::from_catalog("PRI"), KeyKind::Primary);
        assert_eq!(KeyKind::from_catalog("uni"), KeyKind::Unique);
        assert_eq!(KeyKind::from_catalog("MUL").as_str(), "MUL");
        assert_eq!(KeyKind::from_catalog(""), KeyKind::None);
    }

    #[test]
    fn summary_reflects_statement_kind() {
        let select = QueryResult::with_rows(
            vec!["id".into()],
            vec![vec!["1".into()], vec!["2".into()]],
            Duration::from_millis(3),
        );
        assert_eq!(select.row_count, 2);
        assert!(select.summary().starts_with("2 row(s) in"));

        let update = QueryResult::with_affected_rows(5, Duration::from_millis(1));
        assert!(!update.is_select);
        assert!(update.summary().starts_with("5 row(s) affected"));
    }
}
