//! Container engine abstraction
//!
//! Everything the orchestrator needs from Docker goes through
//! [`ContainerEngine`]. The daemon uses [`DockerCli`], tests use an in-memory
//! engine.
//!
//! Any call may fail at any time, the engine is never assumed to stay
//! reachable for the duration of a tide.

mod docker;

pub use docker::DockerCli;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Receives output lines of a running process
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Live state of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Engine status string (`created`, `running`, `exited`, ...)
    pub status: String,
    /// Process is running (also true while paused)
    pub running: bool,
    /// Container is paused
    pub paused: bool,
    /// Container is being restarted by its restart policy
    pub restarting: bool,
}

/// Mount of an inspected container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Volume name, `None` for bind mounts
    pub name: Option<String>,
    /// Path inside the container
    pub destination: String,
}

/// Container as reported by inspect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container id
    pub id: String,
    /// Container name without leading slash
    pub name: String,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Configured user, empty if unset
    pub user: String,
    /// Container runs privileged
    pub privileged: bool,
    /// Live state
    pub state: ContainerState,
    /// Mounts
    pub mounts: Vec<MountInfo>,
}

/// Container as reported by list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id
    pub id: String,
    /// Container labels
    pub labels: BTreeMap<String, String>,
}

/// Filter for [`ContainerEngine::list_containers`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include containers that are not running
    pub all: bool,
    /// Label filters (`key` or `key=value`), all must match
    pub labels: Vec<String>,
    /// Volume names, any must be mounted
    pub volumes: Vec<String>,
}

impl ContainerFilter {
    /// Running and stopped containers carrying `label`
    pub fn all_with_label(label: impl Into<String>) -> Self {
        Self {
            all: true,
            labels: vec![label.into()],
            volumes: Vec::new(),
        }
    }

    /// Running containers mounting any of `volumes`
    pub fn mounting(volumes: impl IntoIterator<Item = String>) -> Self {
        Self {
            all: false,
            labels: Vec::new(),
            volumes: volumes.into_iter().collect(),
        }
    }
}

/// Volume as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume name
    pub name: String,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
    /// Volume driver
    pub driver: String,
    /// Driver options
    pub options: BTreeMap<String, String>,
}

/// Image as reported by inspect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image id
    pub id: String,
    /// Tags pointing at this image
    pub repo_tags: Vec<String>,
}

/// Mount of a container to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Volume name or host path
    pub source: String,
    /// Path inside the container
    pub target: String,
    /// Mount read-only
    pub read_only: bool,
}

/// Blueprint for [`ContainerEngine::create_container`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image to run
    pub image: String,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Mounts
    pub mounts: Vec<MountSpec>,
    /// Remove the container once it exits
    pub auto_remove: bool,
    /// Grace period before the engine kills the container on stop
    pub stop_timeout: Option<Duration>,
}

/// Operations the orchestrator needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check that the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// List containers matching `filter`
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Inspect a single container
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// List volumes carrying all `labels` (`key=value`)
    async fn list_volumes(&self, labels: &[String]) -> Result<Vec<VolumeInfo>>;

    /// Inspect a single volume
    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo>;

    /// Start a stopped container
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a running container, killing it after `timeout`
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Pause a running container
    async fn pause(&self, id: &str) -> Result<()>;

    /// Unpause a paused container
    async fn unpause(&self, id: &str) -> Result<()>;

    /// Run `command` inside a running container and return its exit code
    ///
    /// Combined stdout and stderr are fed line by line into `output`.
    async fn exec(
        &self,
        id: &str,
        command: &[String],
        user: Option<&str>,
        privileged: bool,
        output: LineSink<'_>,
    ) -> Result<i64>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Extract a tar archive into the container filesystem at `path`
    async fn copy_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()>;

    /// Start a created container, stream its output and wait for its exit code
    async fn start_attached(&self, id: &str, output: LineSink<'_>) -> Result<i64>;

    /// Remove a container
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Inspect an image, fails with `NotFound` if it is missing
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo>;

    /// Pull an image
    async fn pull_image(&self, image: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake;
