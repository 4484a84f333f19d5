//! Salvage Core - Shared types and the grouping engine
//!
//! This crate holds everything that does not talk to a container engine:
//! - data model for tides, cranes, volumes and containers
//! - grouping engine that splits a tide into downtime windows
//! - exit code policies for container commands
//! - run logs and their aggregation into a tide result
//! - backup metadata and the reporting hook trait
//!
//! The orchestrator (`salvage-orchestrator`) drives all of it.

#![warn(missing_docs)]

pub mod error;
pub mod exit_code;
pub mod grouping;
pub mod log;
pub mod meta;
pub mod traits;
pub mod types;

pub use error::*;
pub use exit_code::ExitCodePolicy;
pub use grouping::group;
pub use log::{RunState, SharedVolumeLog, StopWatch, TideLog, TideResult, VolumeLog};
pub use meta::{BackupMeta, HostMeta};
pub use traits::*;
pub use types::*;
