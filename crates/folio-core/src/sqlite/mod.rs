pub mod job_broker;
pub mod migrations;
mod session_store;
pub mod store;
mod task_store;

pub use job_broker::SqliteJobBroker;
pub use migrations::{SqliteMigration, current_schema_version, migration, migrations};
pub use store::SqliteStore;
