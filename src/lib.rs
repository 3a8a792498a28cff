//! Remote operations and transfer orchestration for agent-managed fleets.
//!
//! Gangway resolves human-supplied instance references to concrete targets,
//! runs sessions, commands and port forwards through the remote-management
//! agent, and moves files either inline or through a short-lived relay
//! object guarded by a grant scoped to one target and one object. Every
//! temporary artifact is recorded in a durable registry before it exists,
//! so the janitor can reclaim anything an interrupted operation leaves
//! behind.
//!
//! The cloud is reached through the collaborator traits in [`backend`];
//! [`aws`] implements them over the `aws` CLI and [`test_support`] provides
//! an in-memory fake.

pub mod aws;
pub mod backend;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod forward;
pub mod operation;
pub mod orchestrator;
pub mod pool;
pub mod power;
pub mod region;
pub mod registry;
pub mod resolver;
mod retry;
pub mod target;
pub mod telemetry;
pub mod test_support;
pub mod transfer;

pub use aws::AwsBackend;
pub use backend::{BackendError, PowerAction, SessionEnd};
pub use cleanup::{CleanupError, CleanupSummary, Janitor};
pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, GangwayConfig, Policy};
pub use error::{OperationFailure, OpsError};
pub use exec::{CommandRequest, CommandResult};
pub use forward::TunnelHandle;
pub use operation::OperationId;
pub use orchestrator::{Collaborators, Orchestrator, Selector};
pub use pool::FanOutReport;
pub use region::RegionResolver;
pub use registry::{FileRegistry, MemoryRegistry, Registry, RegistryEntry, ResourceKind};
pub use resolver::{FuzzyPicker, NonInteractivePicker, PickOutcome, Selection};
pub use target::{TagFilter, Target};
pub use telemetry::{LogFormat, LoggingConfig, init_logging};
pub use transfer::{TransferEngine, TransferReport};
