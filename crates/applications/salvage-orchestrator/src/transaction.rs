//! Container state transaction for one backup group
//!
//! ```text
//!   prepare(c)  ──►  [tracked: c -> inverse action]  ──►  restore(c)
//!                                │
//!                    close() / drop restores leftovers
//! ```
//!
//! Every container that was stopped, paused or had its pre-command run is
//! tracked by id until it is restored. [`StateTransaction::close`] restores
//! whatever is still tracked; dropping an unclosed transaction hands the
//! leftovers to a background task.

use crate::command::run_command;
use crate::engine::{ContainerEngine, ContainerState};
use crate::error::{OrchestratorError, Result};
use salvage_core::{Container, ContainerAction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How often a restarting container is polled again
pub const RESTART_RETRY_COUNT: u32 = 3;

/// Delay between polls of a restarting container
pub const RESTART_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Grace period for stopping a container
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Action undoing what `prepare` did to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InverseAction {
    Nothing,
    Start,
    Unpause,
}

#[derive(Debug)]
struct Affected {
    container: Container,
    inverse: InverseAction,
    pre_command_ran: bool,
}

/// Tracks container state changes of one group and reverts them
pub struct StateTransaction {
    engine: Arc<dyn ContainerEngine>,
    affected: HashMap<String, Affected>,
    order: Vec<String>,
    retry_count: u32,
    retry_delay: Duration,
    stop_timeout: Duration,
}

impl StateTransaction {
    /// Create an empty transaction
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            affected: HashMap::new(),
            order: Vec::new(),
            retry_count: RESTART_RETRY_COUNT,
            retry_delay: RESTART_RETRY_DELAY,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Override restart polling
    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    /// Override the stop grace period
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Number of containers waiting to be restored
    pub fn pending(&self) -> usize {
        self.affected.len()
    }

    /// Bring `container` into a backup-safe state
    pub async fn prepare(&mut self, container: &Container) -> Result<()> {
        if self.affected.contains_key(&container.id) {
            return Err(OrchestratorError::prepare(
                &container.name,
                "container is already part of this transaction",
            ));
        }

        let state = self.stable_state(container).await?;

        let mut pre_command_ran = false;
        if let Some(command) = &container.pre_command {
            if state.running && !state.paused {
                run_command(self.engine.as_ref(), container, command)
                    .await
                    .map_err(|e| {
                        OrchestratorError::prepare(
                            &container.name,
                            format!("pre-command '{}' failed: {}", command, e),
                        )
                    })?;
                pre_command_ran = true;
                // post-command must run even if the action below fails
                self.track(container, InverseAction::Nothing, true);
            }
        }

        let inverse = match container.action {
            ContainerAction::Ignore => {
                debug!(container = %container.name, "Container has no action, skipping");
                InverseAction::Nothing
            }
            ContainerAction::Stop if state.running => {
                if state.paused {
                    return Err(OrchestratorError::prepare(
                        &container.name,
                        "container is paused, cannot stop",
                    ));
                }
                debug!(container = %container.name, "Stopping container");
                self.engine.stop(&container.id, self.stop_timeout).await?;
                InverseAction::Start
            }
            ContainerAction::Pause if state.running && !state.paused => {
                debug!(container = %container.name, "Pausing container");
                self.engine.pause(&container.id).await?;
                InverseAction::Unpause
            }
            ContainerAction::Stop | ContainerAction::Pause => InverseAction::Nothing,
        };

        self.track(container, inverse, pre_command_ran);
        Ok(())
    }

    /// Undo what `prepare` did to `container` and run its post-command
    pub async fn restore(&mut self, container: &Container) -> Result<()> {
        let Some(affected) = self.untrack(&container.id) else {
            debug!(container = %container.name, "Container is not tracked, nothing to restore");
            return Ok(());
        };
        restore_affected(self.engine.as_ref(), affected).await
    }

    /// Restore every container still tracked
    ///
    /// All containers are attempted; failures are collected into a single
    /// [`OrchestratorError::Restore`].
    pub async fn close(mut self) -> Result<()> {
        let leftovers = self.drain();
        if leftovers.is_empty() {
            return Ok(());
        }

        warn!(
            count = leftovers.len(),
            "Found containers in backup state, rolling back container state"
        );
        let failed = restore_all(self.engine.as_ref(), leftovers).await;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Restore(failed))
        }
    }

    async fn stable_state(&self, container: &Container) -> Result<ContainerState> {
        let mut attempt = 0;
        loop {
            let info = self.engine.inspect_container(&container.id).await?;
            if !info.state.restarting {
                return Ok(info.state);
            }
            if attempt >= self.retry_count {
                return Err(OrchestratorError::UnstableContainer {
                    container: container.name.clone(),
                    attempts: self.retry_count,
                });
            }
            attempt += 1;
            debug!(
                container = %container.name,
                delay_ms = self.retry_delay.as_millis() as u64,
                remaining = self.retry_count - attempt,
                "Container is restarting, waiting"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn track(&mut self, container: &Container, inverse: InverseAction, pre_command_ran: bool) {
        if !self.affected.contains_key(&container.id) {
            self.order.push(container.id.clone());
        }
        self.affected.insert(
            container.id.clone(),
            Affected {
                container: container.clone(),
                inverse,
                pre_command_ran,
            },
        );
    }

    fn untrack(&mut self, id: &str) -> Option<Affected> {
        self.order.retain(|tracked| tracked != id);
        self.affected.remove(id)
    }

    fn drain(&mut self) -> Vec<Affected> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.affected.remove(&id))
            .collect()
    }
}

impl Drop for StateTransaction {
    fn drop(&mut self) {
        let leftovers = self.drain();
        if leftovers.is_empty() {
            return;
        }

        warn!(
            count = leftovers.len(),
            "State transaction dropped with containers in backup state, rolling back in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(&self.engine);
                handle.spawn(async move {
                    let failed = restore_all(engine.as_ref(), leftovers).await;
                    if !failed.is_empty() {
                        error!(containers = ?failed, "Background rollback failed");
                    }
                });
            }
            Err(_) => {
                let names: Vec<&str> = leftovers.iter().map(|a| a.container.name.as_str()).collect();
                error!(containers = ?names, "No runtime available, containers left in backup state");
            }
        }
    }
}

async fn restore_all(engine: &dyn ContainerEngine, leftovers: Vec<Affected>) -> Vec<String> {
    let mut failed = Vec::new();
    for affected in leftovers {
        let name = affected.container.name.clone();
        debug!(container = %name, "Rolling back container");
        if let Err(e) = restore_affected(engine, affected).await {
            warn!(container = %name, error = %e, "Failed to roll back container");
            failed.push(name);
        }
    }
    failed
}

async fn restore_affected(engine: &dyn ContainerEngine, affected: Affected) -> Result<()> {
    let container = &affected.container;
    match affected.inverse {
        InverseAction::Nothing => {}
        InverseAction::Start => {
            debug!(container = %container.name, "Starting container");
            engine.start(&container.id).await?;
        }
        InverseAction::Unpause => {
            debug!(container = %container.name, "Unpausing container");
            engine.unpause(&container.id).await?;
        }
    }

    if affected.pre_command_ran {
        if let Some(command) = &container.post_command {
            debug!(container = %container.name, command = %command, "Running post-command");
            run_command(engine, container, command).await?;
        }
    }
    Ok(())
}
