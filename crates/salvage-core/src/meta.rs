//! Metadata uploaded next to every volume backup
//!
//! The document lands in the crane container before it starts, so the crane
//! can store it with the backup and a restore can recreate the volume.

use crate::types::{Crane, Volume, VolumeMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the backup was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMeta {
    /// Creation time of this document, seconds since epoch
    pub timestamp: i64,
    /// Start of the tide execution, seconds since epoch
    pub execution_start: i64,
    /// Machine name
    pub host: String,
}

/// Full metadata document for one volume backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Host information
    pub host_meta: HostMeta,
    /// Volume as reported by the engine
    pub volume_meta: VolumeMeta,
    /// Crane name
    pub crane: String,
    /// Crane image
    pub image: String,
}

impl BackupMeta {
    /// Build the document for `volume` backed up by `crane`
    pub fn new(
        host: impl Into<String>,
        execution_start: DateTime<Utc>,
        now: DateTime<Utc>,
        volume: &Volume,
        crane: &Crane,
    ) -> Self {
        Self {
            host_meta: HostMeta {
                timestamp: now.timestamp(),
                execution_start: execution_start.timestamp(),
                host: host.into(),
            },
            volume_meta: volume.meta.clone(),
            crane: crane.name.clone(),
            image: crane.image.clone(),
        }
    }

    /// Serialize to pretty printed JSON
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
