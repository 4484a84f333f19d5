//! Tide execution
//!
//! ```text
//!   ping ─► verify crane image ─► discover volumes ─► discover containers
//!     ─► group ─► for each group: prepare ─► backup ─► restore ─► report
//! ```
//!
//! Groups run strictly one after another. A group whose preparation fails is
//! rolled back and aborts the tide; later groups are not touched. Failed
//! volume backups only fail their own volume.

use crate::discovery::{tide_containers, tide_volumes};
use crate::engine::ContainerEngine;
use crate::error::{OrchestratorError, Result};
use crate::operation::BackupOperation;
use crate::shutdown::ShutdownSignal;
use crate::transaction::{StateTransaction, RESTART_RETRY_COUNT, RESTART_RETRY_DELAY};
use crate::vessel::TideContext;
use salvage_core::{group, Crane, Group, ReportingHook, RunState, Tide, TideLog, TideResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Creates the reporting hook of a tide execution
pub trait HookFactory: Send + Sync {
    /// Hook receiving the outcomes of `tide`
    fn hook_for(&self, tide: &Tide) -> Arc<dyn ReportingHook>;
}

impl<F> HookFactory for F
where
    F: Fn(&Tide) -> Arc<dyn ReportingHook> + Send + Sync,
{
    fn hook_for(&self, tide: &Tide) -> Arc<dyn ReportingHook> {
        self(tide)
    }
}

/// Executes tides against a container engine
pub struct TideService {
    engine: Arc<dyn ContainerEngine>,
    machine: String,
    own_container_id: String,
    hooks: Arc<dyn HookFactory>,
    restart_retry: (u32, Duration),
}

impl TideService {
    /// Create a service
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        machine: impl Into<String>,
        own_container_id: impl Into<String>,
        hooks: Arc<dyn HookFactory>,
    ) -> Self {
        Self {
            engine,
            machine: machine.into(),
            own_container_id: own_container_id.into(),
            hooks,
            restart_retry: (RESTART_RETRY_COUNT, RESTART_RETRY_DELAY),
        }
    }

    /// Override how long restarting containers are waited for
    pub fn with_restart_retry(mut self, count: u32, delay: Duration) -> Self {
        self.restart_retry = (count, delay);
        self
    }

    /// Run `tide` once and report its outcome
    ///
    /// Returns the aggregated result. A tide interrupted by `shutdown` is not
    /// reported and yields [`OrchestratorError::Cancelled`].
    pub async fn execute(&self, tide: &Tide, shutdown: &mut ShutdownSignal) -> Result<TideResult> {
        let span = info_span!("tide", tide = %tide.name);
        self.execute_in_span(tide, shutdown).instrument(span).await
    }

    async fn execute_in_span(
        &self,
        tide: &Tide,
        shutdown: &mut ShutdownSignal,
    ) -> Result<TideResult> {
        info!(crane = %tide.crane.name, grouping = %tide.grouping, "Executing tide");

        let hook = self.hooks.hook_for(tide);
        let mut log = TideLog::new(&tide.name, Arc::clone(&hook));
        log.start()?;

        match self.run(tide, &mut log, shutdown).await {
            Ok(()) => log.success()?,
            Err(OrchestratorError::Cancelled) => {
                warn!("Tide was interrupted, skipping reporting");
                return Err(OrchestratorError::Cancelled);
            }
            Err(e) => {
                error!(error = %e, "Tide failed");
                log.failure(e.to_string())?;
            }
        }

        let result = log.result();
        report(hook.as_ref(), tide, &log, &result);

        match result.state {
            RunState::Success => info!(
                duration = ?log.stop_watch().duration(),
                "Tide finished successfully"
            ),
            _ => warn!(reason = %result.message, "Tide finished with failures"),
        }
        Ok(result)
    }

    async fn run(
        &self,
        tide: &Tide,
        log: &mut TideLog,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()> {
        self.engine.ping().await?;
        verify_crane_image(self.engine.as_ref(), &tide.crane).await?;

        let volumes = tide_volumes(self.engine.as_ref(), &tide.name).await?;
        if volumes.is_empty() {
            info!("Tide has no volumes, nothing to do");
            return Ok(());
        }
        let containers =
            tide_containers(self.engine.as_ref(), &volumes, &self.own_container_id).await?;

        let groups = group(&containers, &volumes, tide.grouping);
        info!(
            volumes = volumes.len(),
            containers = containers.len(),
            groups = groups.len(),
            "Grouped tide"
        );

        let context = Arc::new(TideContext::new(&self.machine));
        let operation =
            BackupOperation::new(Arc::clone(&self.engine), context, tide.max_concurrent);

        for (index, group) in groups.iter().enumerate() {
            if shutdown.is_triggered() {
                return Err(OrchestratorError::Cancelled);
            }
            debug!(
                group = index,
                containers = ?group.container_ids(),
                volumes = ?group.volume_names(),
                "Backing up group"
            );

            if let Err(e) = self
                .backup_group(&operation, &tide.crane, group, log, shutdown)
                .await
            {
                if !e.is_cancelled() {
                    warn!(group = index, error = %e, "Group failed, aborting tide");
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn backup_group(
        &self,
        operation: &BackupOperation,
        crane: &Arc<Crane>,
        group: &Group,
        log: &mut TideLog,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()> {
        let (retry_count, retry_delay) = self.restart_retry;
        let mut transaction =
            StateTransaction::new(Arc::clone(&self.engine)).with_retry(retry_count, retry_delay);

        for container in &group.containers {
            if let Err(e) = transaction.prepare(container).await {
                error!(container = %container.name, error = %e, "Failed to prepare container");
                if let Err(restore) = transaction.close().await {
                    warn!(error = %restore, "Rollback after failed preparation was incomplete");
                }
                return Err(e);
            }
        }

        let backup = operation
            .backup_volumes(crane, &group.volumes, log, shutdown)
            .await;

        for container in &group.containers {
            if let Err(e) = transaction.restore(container).await {
                warn!(container = %container.name, error = %e, "Failed to restore container");
            }
        }
        if let Err(e) = transaction.close().await {
            warn!(error = %e, "Some containers could not be restored");
        }

        backup
    }
}

/// Make sure the crane image is present, pulling it when needed
pub async fn verify_crane_image(engine: &dyn ContainerEngine, crane: &Crane) -> Result<()> {
    let present = match engine.inspect_image(&crane.image).await {
        Ok(_) => true,
        Err(OrchestratorError::NotFound { .. }) => false,
        Err(e) => return Err(e),
    };

    if present && !crane.pull_on_run {
        debug!(crane = %crane.name, image = %crane.image, "Crane image present");
        return Ok(());
    }

    info!(crane = %crane.name, image = %crane.image, "Pulling crane image");
    engine.pull_image(&crane.image).await
}

fn report(hook: &dyn ReportingHook, tide: &Tide, log: &TideLog, result: &TideResult) {
    let duration = log.stop_watch().duration();
    if result.state == RunState::Success {
        hook.tide_success(tide, &log.volumes_in_state(RunState::Success), duration);
        return;
    }

    let succeeded = log.volumes_in_state(RunState::Success);
    let failed = log.volumes_in_state(RunState::Failure);
    if succeeded.is_empty() && failed.is_empty() {
        hook.tide_failure(tide, &result.message, duration);
    } else {
        hook.tide_failure_with_volumes(tide, &succeeded, &failed, &result.message, duration);
    }
}
