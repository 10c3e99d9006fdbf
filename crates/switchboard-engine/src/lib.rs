//! Connection orchestration: the live session table, the pairing and
//! reconnect state machine, inbound ingestion and outbound dispatch.

pub mod config;
pub mod error;
pub mod ingest;
pub mod loopback;
pub mod orchestrator;
pub mod scheduler;
pub mod tenant;
mod transitions;

pub use config::{OrchestratorConfig, ReconnectPolicy};
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, RestoreSummary};
pub use tenant::TenantView;
