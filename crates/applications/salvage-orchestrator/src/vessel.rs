//! Vessel: one crane container backing up one volume
//!
//! The crane container is created from the crane image with the volume
//! mounted read-only, receives a metadata document, and is started attached.
//! Its output feeds the volume log and its exit code decides the outcome.

use crate::engine::{ContainerEngine, ContainerSpec, MountSpec};
use crate::error::{OrchestratorError, Result};
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use salvage_core::log::lock;
use salvage_core::{BackupMeta, Crane, SharedVolumeLog, Volume};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace period for a crane to wrap up after being asked to stop
pub const CRANE_STOP_TIMEOUT: Duration = Duration::from_secs(120);

/// Path of the metadata document inside the crane container
pub const META_PATH: &str = "/salvage/meta/meta.json";

/// Mount point of the volume inside the crane container
pub const VOLUME_PATH: &str = "/salvage/volume";

/// Label marking containers created by salvage
pub const ENTITY_LABEL: &str = "salvage.entity";

/// Facts shared by every vessel of one tide execution
#[derive(Debug, Clone)]
pub struct TideContext {
    /// Machine name reported to cranes and webhooks
    pub machine: String,
    /// Start of the tide execution
    pub started: DateTime<Utc>,
}

impl TideContext {
    /// Context for a tide starting now
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            started: Utc::now(),
        }
    }
}

/// Runs `crane` against a single volume
pub struct Vessel<'a> {
    engine: &'a dyn ContainerEngine,
    context: &'a TideContext,
    crane: &'a Crane,
    volume: &'a Volume,
}

impl<'a> Vessel<'a> {
    /// Prepare a vessel, nothing is created yet
    pub fn new(
        engine: &'a dyn ContainerEngine,
        context: &'a TideContext,
        crane: &'a Crane,
        volume: &'a Volume,
    ) -> Self {
        Self {
            engine,
            context,
            crane,
            volume,
        }
    }

    /// Back up the volume and wait for the crane to exit
    ///
    /// Crane output is written into `log`. If `shutdown` fires while the crane
    /// is running, the crane is stopped and [`OrchestratorError::Cancelled`] is
    /// returned once it exited.
    pub async fn run(&self, log: &SharedVolumeLog, shutdown: &mut ShutdownSignal) -> Result<()> {
        if self.volume.dry_run {
            info!(volume = %self.volume.name, "Dry run, skipping crane");
            lock(log).log("dry run");
            return Ok(());
        }

        let spec = self.container_spec();
        let id = self.engine.create_container(&spec).await?;
        debug!(volume = %self.volume.name, container = %id, "Created crane container");

        match self.launch(&id, log, shutdown).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    /// Blueprint of the crane container
    pub fn container_spec(&self) -> ContainerSpec {
        let mut env = self.crane.env.clone();
        env.insert("SALVAGE_MACHINE_NAME".to_string(), self.context.machine.clone());
        env.insert("SALVAGE_CRANE_NAME".to_string(), self.crane.name.clone());
        env.insert("SALVAGE_VOLUME_NAME".to_string(), self.volume.name.clone());
        env.insert(
            "SALVAGE_TIDE_TIMESTAMP".to_string(),
            self.context.started.timestamp().to_string(),
        );

        let mut mounts = vec![MountSpec {
            source: self.volume.name.clone(),
            target: VOLUME_PATH.to_string(),
            read_only: true,
        }];
        mounts.extend(self.crane.mounts.iter().map(|(source, target)| MountSpec {
            source: source.clone(),
            target: target.clone(),
            read_only: false,
        }));

        ContainerSpec {
            image: self.crane.image.clone(),
            env,
            labels: [(ENTITY_LABEL.to_string(), "crane".to_string())].into(),
            mounts,
            auto_remove: true,
            stop_timeout: Some(CRANE_STOP_TIMEOUT),
        }
    }

    /// Tar archive holding the metadata document at [`META_PATH`]
    pub fn meta_archive(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let meta = BackupMeta::new(
            self.context.machine.clone(),
            self.context.started,
            now,
            self.volume,
            self.crane,
        );
        let json = meta.to_json()?;

        let mut header = tar::Header::new_gnu();
        header.set_path(META_PATH.trim_start_matches('/'))?;
        header.set_size(json.len() as u64);
        header.set_mode(0o444);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(now.timestamp().max(0) as u64);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, json.as_slice())?;
        Ok(builder.into_inner()?)
    }

    async fn launch(
        &self,
        id: &str,
        log: &SharedVolumeLog,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()> {
        let archive = self.meta_archive(Utc::now())?;
        self.engine.copy_archive(id, "/", archive).await?;

        let volume = self.volume.name.as_str();
        let mut sink = |line: &str| {
            let line = line.trim_end();
            debug!(volume = %volume, "[crane] {}", line);
            lock(log).log(line);
        };

        let attached = self.engine.start_attached(id, &mut sink);
        tokio::pin!(attached);

        let exit_code = tokio::select! {
            code = &mut attached => code?,
            _ = shutdown.triggered() => {
                warn!(volume = %volume, container = %id, "Shutdown requested, stopping crane");
                if let Err(e) = self.engine.stop(id, CRANE_STOP_TIMEOUT).await {
                    warn!(volume = %volume, error = %e, "Failed to stop crane");
                }
                let code = attached.await;
                debug!(volume = %volume, exit = ?code.as_ref().ok(), "Crane exited after stop");
                return Err(OrchestratorError::Cancelled);
            }
        };

        if exit_code != 0 {
            return Err(OrchestratorError::backup(format!(
                "crane '{}' exited with code {} while backing up volume '{}'",
                self.crane.name, exit_code, volume
            )));
        }

        info!(volume = %volume, crane = %self.crane.name, "Crane finished");
        Ok(())
    }

    /// Remove a crane container that never got to run
    async fn discard(&self, id: &str) {
        let status = match self.engine.inspect_container(id).await {
            Ok(info) => info.state.status,
            Err(OrchestratorError::NotFound { .. }) => return,
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to inspect crane container");
                return;
            }
        };

        if status == "created" {
            debug!(container = %id, "Removing crane container that never started");
            if let Err(e) = self.engine.remove_container(id, true).await {
                warn!(container = %id, error = %e, "Failed to remove crane container");
            }
        }
    }
}

/// Run a vessel on a shared engine handle
pub async fn backup_volume(
    engine: Arc<dyn ContainerEngine>,
    context: Arc<TideContext>,
    crane: Arc<Crane>,
    volume: Volume,
    log: SharedVolumeLog,
    mut shutdown: ShutdownSignal,
) -> Result<()> {
    Vessel::new(engine.as_ref(), &context, &crane, &volume)
        .run(&log, &mut shutdown)
        .await
}
