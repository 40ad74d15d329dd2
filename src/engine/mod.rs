// Engine Module
// Connectivity and execution layer shared by every database engine

pub mod dispatcher;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod schema;
pub mod ssh_tunnel;
pub mod traits;
pub mod types;

pub use dispatcher::{execute_script, split_statements, ScriptOutcome};
pub use error::{DriverError, DriverResult};
pub use registry::DriverRegistry;
pub use schema::load_schema;
pub use ssh_tunnel::SshTunnel;
pub use traits::Driver;
pub use types::*;
