//! Driver Registry
//!
//! Maps an engine tag to a constructor for a fresh, unconnected adapter.
//! Each session gets its own driver instance.

use std::collections::HashMap;

use crate::engine::drivers::mysql::MySqlDriver;
use crate::engine::drivers::postgres::PostgresDriver;
use crate::engine::drivers::sqlite::SqliteDriver;
use crate::engine::error::{DriverError, DriverResult};
use crate::engine::traits::Driver;
use crate::engine::types::EngineTag;

/// Builds a new, unconnected driver
pub type DriverConstructor = fn() -> Box<dyn Driver>;

/// Registry that holds a constructor for each available engine
pub struct DriverRegistry {
    constructors: HashMap<EngineTag, DriverConstructor>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in SQLite, PostgreSQL and MySQL adapters
    pub fn with_default_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(EngineTag::Postgres, || Box::new(PostgresDriver::new()));
        registry.register(EngineTag::Mysql, || Box::new(MySqlDriver::new()));
        registry.register(EngineTag::Sqlite, || Box::new(SqliteDriver::new()));
        registry
    }

    /// Registers a constructor, replacing any previous one for `engine`
    pub fn register(&mut self, engine: EngineTag, constructor: DriverConstructor) {
        self.constructors.insert(engine, constructor);
    }

    /// Constructs a fresh driver for `engine`
    pub fn create(&self, engine: EngineTag) -> DriverResult<Box<dyn Driver>> {
        self.constructors
            .get(&engine)
            .map(|construct| construct())
            .ok_or_else(|| DriverError::UnsupportedEngine(engine.to_string()))
    }

    /// Parses `name` as an engine tag and constructs its driver
    pub fn create_by_name(&self, name: &str) -> DriverResult<Box<dyn Driver>> {
        let engine: EngineTag = name.parse()?;
        self.create(engine)
    }

    /// Lists registered engines in canonical order
    pub fn list(&self) -> Vec<EngineTag> {
        EngineTag::ALL
            .iter()
            .copied()
            .filter(|tag| self.constructors.contains_key(tag))
            .collect()
    }

    /// Returns the number of registered engines
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Returns true if no engines are registered
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_default_drivers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_every_engine() {
        let registry = DriverRegistry::default();

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.list(),
            vec![EngineTag::Postgres, EngineTag::Mysql, EngineTag::Sqlite]
        );
        for tag in EngineTag::ALL {
            let driver = registry.create(tag).expect("registered");
            assert_eq!(driver.engine(), tag);
        }
    }

    #[test]
    fn create_by_name_accepts_aliases() {
        let registry = DriverRegistry::with_default_drivers();

        let driver = registry.create_by_name("PostgreSQL").expect("alias");
        assert_eq!(driver.engine(), EngineTag::Postgres);

        let driver = registry.create_by_name("mariadb").expect("alias");
        assert_eq!(driver.engine(), EngineTag::Mysql);
    }

    #[test]
    fn unknown_or_unregistered_engines_are_rejected() {
        let registry = DriverRegistry::new();
        assert!(registry.is_empty());

        let err = registry.create(EngineTag::Sqlite).err().expect("empty registry");
        assert!(matches!(err, DriverError::UnsupportedEngine(ref name) if name == "sqlite"));

        let err = DriverRegistry::default()
            .create_by_name("oracle")
            .err()
            .expect("unknown engine");
        assert!(matches!(err, DriverError::UnsupportedEngine(_)));
    }

    #[test]
    fn each_create_returns_a_fresh_instance() {
        let mut registry = DriverRegistry::new();
        registry.register(EngineTag::Sqlite, || Box::new(SqliteDriver::new()));

        let first = registry.create(EngineTag::Sqlite).expect("first");
        let second = registry.create(EngineTag::Sqlite).expect("second");
        assert!(!std::ptr::eq(
            first.as_ref() as *const dyn Driver as *const u8,
            second.as_ref() as *const dyn Driver as *const u8
        ));
    }
}
