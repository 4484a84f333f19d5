//! # Salvage Orchestrator
//!
//! Crash-consistent backups of container volumes.
//!
//! ## Architecture
//!
//! ```text
//! TideScheduler ──► TideService ──► StateTransaction (stop / pause / commands)
//!                        │
//!                        └────────► BackupOperation ──► Vessel (crane container)
//!                                                            │
//!                                    ContainerEngine ◄───────┘
//! ```
//!
//! A tide names a schedule and a crane. When it is due, salvage discovers the
//! tide's volumes and the containers using them, splits them into groups
//! (see [`salvage_core::grouping`]) and handles one group at a time:
//!
//! 1. **Prepare**: run pre-commands, stop or pause containers
//! 2. **Backup**: start one crane container per volume, bounded by crane and
//!    tide capacity
//! 3. **Restore**: unpause or start containers, run post-commands
//!
//! Containers are restored even when a backup fails, and outcomes are sent to
//! the tide's webhooks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod operation;
pub mod reporter;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod transaction;
pub mod vessel;

#[cfg(test)]
pub(crate) mod testing;

// Error handling
pub use error::{OrchestratorError, Result};

// Container engine
pub use engine::{ContainerEngine, DockerCli};

// Configuration and discovery
pub use config::Configuration;
pub use discovery::{cleanup_leftovers, own_container, tide_containers, tide_volumes};

// Tide execution
pub use operation::BackupOperation;
pub use scheduler::{TideScheduler, SETTLE_BUFFER};
pub use service::{verify_crane_image, HookFactory, TideService};
pub use transaction::StateTransaction;
pub use vessel::{TideContext, Vessel};

// Reporting
pub use reporter::{WebhookHooks, WebhookReporter};

// Shutdown
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
