//! Backup operation: matches volumes to crane capacity
//!
//! One operation lives for a whole tide execution. Its worker pool bounds the
//! number of backups across all cranes, while each crane has its own token
//! pool sized to the crane's capacity. Both survive across groups.
//!
//! ```text
//!   pending ──try token──►  task ──pool permit──►  vessel
//!      ▲                     │
//!      └──── released ◄──────┘   (token returned before the log is resolved)
//! ```

use crate::engine::ContainerEngine;
use crate::error::{OrchestratorError, Result};
use crate::shutdown::{self, ShutdownSignal};
use crate::vessel::{backup_volume, TideContext};
use salvage_core::log::lock;
use salvage_core::{Crane, SharedVolumeLog, TideLog, Volume};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs volume backups of one tide execution
pub struct BackupOperation {
    engine: Arc<dyn ContainerEngine>,
    context: Arc<TideContext>,
    pool: Arc<Semaphore>,
    cranes: Mutex<HashMap<String, Arc<Semaphore>>>,
    released: Arc<Notify>,
}

impl BackupOperation {
    /// Create an operation running at most `max_concurrent` backups at once
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        context: Arc<TideContext>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            engine,
            context,
            pool: Arc::new(Semaphore::new(permits(max_concurrent))),
            cranes: Mutex::new(HashMap::new()),
            released: Arc::new(Notify::new()),
        }
    }

    /// Capacity tokens of `crane`, created on first use
    fn tokens(&self, crane: &Crane) -> Arc<Semaphore> {
        let mut cranes = self
            .cranes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            cranes
                .entry(crane.name.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(permits(crane.max_concurrent)))),
        )
    }

    /// Free capacity tokens of `crane`
    #[cfg(test)]
    pub(crate) fn available(&self, crane: &Crane) -> usize {
        self.tokens(crane).available_permits()
    }

    /// Back up `volumes` with `crane` and wait for all of them
    ///
    /// Outcomes are recorded in the volume logs of `tide_log`; a failing
    /// volume never affects its siblings. If `shutdown` fires, running
    /// backups are asked to stop, every task is awaited and
    /// [`OrchestratorError::Cancelled`] is returned.
    pub async fn backup_volumes(
        &self,
        crane: &Arc<Crane>,
        volumes: &[Volume],
        tide_log: &mut TideLog,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()> {
        let tokens = self.tokens(crane);
        let (cancel, cancel_signal) = shutdown::channel();
        let mut cancelled = false;
        let mut fault: Option<OrchestratorError> = None;

        let mut pending: Vec<Volume> = volumes.to_vec();
        let mut tasks = JoinSet::new();

        while !pending.is_empty() && !cancelled {
            if shutdown.is_triggered() {
                cancelled = true;
                break;
            }

            let mut dispatched = 0;
            let mut remaining = Vec::with_capacity(pending.len());
            for volume in pending.drain(..) {
                if fault.is_some() {
                    remaining.push(volume);
                    continue;
                }
                let token = match Arc::clone(&tokens).try_acquire_owned() {
                    Ok(token) => token,
                    Err(_) => {
                        remaining.push(volume);
                        continue;
                    }
                };
                let log = match tide_log.volume_log(&volume, crane) {
                    Ok(log) => log,
                    Err(e) => {
                        fault = Some(e.into());
                        continue;
                    }
                };

                debug!(volume = %volume.name, crane = %crane.name, "Dispatching backup");
                let task = BackupTask {
                    engine: Arc::clone(&self.engine),
                    context: Arc::clone(&self.context),
                    crane: Arc::clone(crane),
                    pool: Arc::clone(&self.pool),
                    released: Arc::clone(&self.released),
                    cancel: cancel_signal.clone(),
                };
                let span = info_span!("backup", volume = %volume.name, crane = %crane.name);
                tasks.spawn(task.run(volume, log, token).instrument(span));
                dispatched += 1;
            }
            pending = remaining;

            if fault.is_some() {
                break;
            }

            if dispatched == 0 && !pending.is_empty() {
                debug!(
                    pending = pending.len(),
                    crane = %crane.name,
                    "Crane at capacity, waiting for a backup to finish"
                );
                tokio::select! {
                    _ = self.released.notified() => {}
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => finished(joined),
                    _ = shutdown.triggered() => cancelled = true,
                }
            }
        }

        if cancelled || fault.is_some() {
            cancel.trigger();
        }

        while !tasks.is_empty() {
            tokio::select! {
                Some(joined) = tasks.join_next() => finished(joined),
                _ = shutdown.triggered(), if !cancelled => {
                    warn!(crane = %crane.name, "Shutdown requested, cancelling running backups");
                    cancelled = true;
                    cancel.trigger();
                }
                else => break,
            }
        }

        if cancelled {
            info!(
                crane = %crane.name,
                skipped = pending.len(),
                "Backup operation cancelled"
            );
            return Err(OrchestratorError::Cancelled);
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Semaphore size for a configured capacity
fn permits(capacity: usize) -> usize {
    capacity.clamp(1, Semaphore::MAX_PERMITS)
}

fn finished(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Backup task panicked");
    }
}

/// Everything a backup task needs, detached from the operation
struct BackupTask {
    engine: Arc<dyn ContainerEngine>,
    context: Arc<TideContext>,
    crane: Arc<Crane>,
    pool: Arc<Semaphore>,
    released: Arc<Notify>,
    cancel: ShutdownSignal,
}

impl BackupTask {
    async fn run(self, volume: Volume, log: SharedVolumeLog, token: OwnedSemaphorePermit) {
        let Self {
            engine,
            context,
            crane,
            pool,
            released,
            mut cancel,
        } = self;

        let permit = tokio::select! {
            permit = pool.acquire_owned() => permit.ok(),
            _ = cancel.triggered() => None,
        };

        let outcome = match permit {
            Some(_permit) => {
                if let Err(e) = lock(&log).start() {
                    warn!(error = %e, "Volume log was already started");
                }
                info!("Backing up volume");
                backup_volume(engine, context, crane, volume, Arc::clone(&log), cancel).await
            }
            None => Err(OrchestratorError::Cancelled),
        };

        drop(token);
        released.notify_one();

        let mut log = lock(&log);
        let resolved = match outcome {
            Ok(()) => {
                info!("Volume backup finished");
                log.success()
            }
            Err(OrchestratorError::Cancelled) => {
                warn!("Volume backup cancelled");
                return;
            }
            Err(e) => {
                error!(error = %e, "Volume backup failed");
                log.failure(e.to_string())
            }
        };
        if let Err(e) = resolved {
            warn!(error = %e, "Could not record volume outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::testing::RecordingHook;
    use salvage_core::RunState;
    use std::time::Duration;

    fn volumes(names: &[&str]) -> Vec<Volume> {
        names.iter().map(|n| Volume::new(*n)).collect()
    }

    fn operation(engine: Arc<FakeEngine>, max_concurrent: usize) -> BackupOperation {
        BackupOperation::new(engine, Arc::new(TideContext::new("node-1")), max_concurrent)
    }

    fn tide_log(hook: &Arc<RecordingHook>) -> TideLog {
        let mut log = TideLog::new("nightly", hook.clone());
        log.start().unwrap();
        log
    }

    #[tokio::test]
    async fn test_crane_capacity_bounds_concurrency() {
        let engine = Arc::new(FakeEngine::new().crane_delay(Duration::from_millis(20)));
        let op = operation(engine.clone(), usize::MAX);
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(2));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(
            &crane,
            &volumes(&["v1", "v2", "v3", "v4", "v5"]),
            &mut log,
            &mut ShutdownSignal::never(),
        )
        .await
        .unwrap();

        assert!(engine.max_concurrent_cranes() <= 2);
        assert_eq!(engine.max_concurrent_cranes(), 2);
        assert_eq!(log.volumes_in_state(RunState::Success).len(), 5);
        assert_eq!(op.available(&crane), 2);
    }

    #[tokio::test]
    async fn test_single_capacity_crane_runs_sequentially() {
        let engine = Arc::new(FakeEngine::new().crane_delay(Duration::from_millis(10)));
        let op = operation(engine.clone(), usize::MAX);
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(1));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(&crane, &volumes(&["v1", "v2"]), &mut log, &mut ShutdownSignal::never())
            .await
            .unwrap();

        let (_, first_end) = engine.window("v1").unwrap();
        let (second_start, _) = engine.window("v2").unwrap();
        assert!(second_start >= first_end);
        assert_eq!(engine.max_concurrent_cranes(), 1);
    }

    #[tokio::test]
    async fn test_pool_bounds_unbounded_crane() {
        let engine = Arc::new(FakeEngine::new().crane_delay(Duration::from_millis(10)));
        let op = operation(engine.clone(), 1);
        let crane = Arc::new(Crane::new("borg", "borg:1"));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(
            &crane,
            &volumes(&["v1", "v2", "v3"]),
            &mut log,
            &mut ShutdownSignal::never(),
        )
        .await
        .unwrap();

        assert_eq!(engine.max_concurrent_cranes(), 1);
        assert_eq!(log.volumes_in_state(RunState::Success).len(), 3);
    }

    #[tokio::test]
    async fn test_volume_duration_excludes_pool_wait() {
        let engine = Arc::new(FakeEngine::new().crane_delay(Duration::from_millis(30)));
        let op = operation(engine.clone(), 1);
        let crane = Arc::new(Crane::new("borg", "borg:1"));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(&crane, &volumes(&["v1", "v2"]), &mut log, &mut ShutdownSignal::never())
            .await
            .unwrap();

        let (v1, v2) = (engine.window("v1").unwrap(), engine.window("v2").unwrap());
        let (first, second) = if v1.0 <= v2.0 { (v1, "v2") } else { (v2, "v1") };
        let started = log
            .volume_logs()
            .iter()
            .map(lock)
            .find(|l| l.volume().name == second)
            .and_then(|l| l.stop_watch().started_at())
            .unwrap();
        assert!(started >= first.1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let engine = Arc::new(FakeEngine::new().crane_exit_code("v2", 3));
        let op = operation(engine.clone(), usize::MAX);
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(1));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(
            &crane,
            &volumes(&["v1", "v2", "v3"]),
            &mut log,
            &mut ShutdownSignal::never(),
        )
        .await
        .unwrap();

        let failed: Vec<String> = log
            .volumes_in_state(RunState::Failure)
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(failed, vec!["v2".to_string()]);
        assert_eq!(log.volumes_in_state(RunState::Success).len(), 2);

        let mut events = hook.events();
        events.sort();
        assert_eq!(
            events,
            vec!["volume_failure:v2", "volume_success:v1", "volume_success:v3"]
        );
    }

    #[tokio::test]
    async fn test_volume_logs_follow_dispatch_order() {
        let engine = Arc::new(FakeEngine::new());
        let op = operation(engine.clone(), usize::MAX);
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(1));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        op.backup_volumes(&crane, &volumes(&["c", "a", "b"]), &mut log, &mut ShutdownSignal::never())
            .await
            .unwrap();

        let order: Vec<String> = log
            .volume_logs()
            .iter()
            .map(|l| lock(l).volume().name.clone())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_cancellation_drains_all_tasks() {
        let engine = Arc::new(FakeEngine::new().crane_delay(Duration::from_secs(3600)));
        let op = Arc::new(operation(engine.clone(), usize::MAX));
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(2));
        let (trigger, signal) = shutdown::channel();

        let task = {
            let op = Arc::clone(&op);
            let crane = Arc::clone(&crane);
            tokio::spawn(async move {
                let hook = Arc::new(RecordingHook::default());
                let mut log = tide_log(&hook);
                let mut signal = signal;
                let result = op
                    .backup_volumes(&crane, &volumes(&["v1", "v2", "v3"]), &mut log, &mut signal)
                    .await;
                (result, hook.events(), log.volumes_in_state(RunState::Unknown).len())
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.trigger();
        let (result, events, unknown) = task.await.unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(engine.events_matching("crane_start:").len(), 2);
        assert_eq!(engine.events_matching("crane_end:").len(), 2);
        assert_eq!(engine.events_matching("stop:").len(), 2);
        assert!(events.is_empty());
        assert_eq!(unknown, 2);
        assert_eq!(op.available(&crane), 2);
    }

    #[tokio::test]
    async fn test_tokens_shared_across_calls() {
        let engine = Arc::new(FakeEngine::new());
        let op = operation(engine.clone(), usize::MAX);
        let crane = Arc::new(Crane::new("borg", "borg:1").with_max_concurrent(3));
        let hook = Arc::new(RecordingHook::default());
        let mut log = tide_log(&hook);

        for group in [["v1", "v2"], ["v3", "v4"]] {
            op.backup_volumes(&crane, &volumes(&group), &mut log, &mut ShutdownSignal::never())
                .await
                .unwrap();
            assert_eq!(op.available(&crane), 3);
        }
        assert_eq!(log.volumes_in_state(RunState::Success).len(), 4);
    }
}
