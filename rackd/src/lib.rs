pub mod commands;
pub mod daemon;
pub mod migrate;
pub mod supervisor;

pub use migrate::{ConfigMigrator, MigrateOutcome};
pub use supervisor::{CommandLauncher, SupervisorError, WorkerLauncher, WorkerStatus, WorkerSupervisor};
