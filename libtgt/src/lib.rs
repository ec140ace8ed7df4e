pub mod client;
pub mod config;
pub mod error;
pub mod reconciler;

pub use client::{ControlSocketClient, DaemonState, TargetDaemon};
pub use config::{LunDefinition, TargetConfig};
pub use error::TargetError;
pub use reconciler::{ReconcileOutcome, TargetHealth, TargetReconciler};
