// dbterm - terminal database client
// Connectivity core

pub mod engine;
pub mod observability;

pub use engine::{
    Column, ConnectParams, Constraint, Driver, DriverError, DriverRegistry, DriverResult,
    EngineTag, KeyKind, QueryResult, TunnelConfig,
};
