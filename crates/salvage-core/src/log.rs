//! Run logs for tides and volumes
//!
//! A log starts out as [`RunState::Unknown`] and is resolved exactly once to
//! either success or failure. Resolving it twice is a programming error and is
//! returned as [`SalvageError::AlreadyFinished`].
//!
//! Volume logs forward their outcome to the [`ReportingHook`] the moment they
//! are resolved. The tide outcome is aggregated by [`TideLog::result`] and
//! reported by the caller.

use crate::error::{Result, SalvageError};
use crate::traits::ReportingHook;
use crate::types::{Crane, Volume};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Outcome of a tide or volume backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Not resolved yet
    Unknown,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failure,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Unknown => write!(f, "UNKNOWN"),
            RunState::Success => write!(f, "SUCCESS"),
            RunState::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Measures one interval, started and stopped at most once
#[derive(Debug, Clone, Default)]
pub struct StopWatch {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl StopWatch {
    /// Create an idle stop watch
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring
    pub fn start(&mut self) -> Result<()> {
        if self.started.is_some() {
            return Err(SalvageError::StopWatch("has already been started"));
        }
        self.started = Some(Instant::now());
        Ok(())
    }

    /// Stop measuring
    pub fn stop(&mut self) -> Result<()> {
        if self.started.is_none() {
            return Err(SalvageError::StopWatch("has not been started"));
        }
        if self.stopped.is_some() {
            return Err(SalvageError::StopWatch("has already been stopped"));
        }
        self.stopped = Some(Instant::now());
        Ok(())
    }

    /// Measured interval, zero until stopped
    pub fn duration(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Instant the watch was started
    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    /// Instant the watch was stopped
    pub fn stopped_at(&self) -> Option<Instant> {
        self.stopped
    }
}

/// Outcome of a single volume backup
pub struct VolumeLog {
    volume: Volume,
    crane: Arc<Crane>,
    hook: Arc<dyn ReportingHook>,
    stop_watch: StopWatch,
    message: String,
    state: RunState,
}

impl fmt::Debug for VolumeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeLog")
            .field("volume", &self.volume.name)
            .field("crane", &self.crane.name)
            .field("state", &self.state)
            .field("message", &self.message)
            .finish()
    }
}

impl VolumeLog {
    fn new(volume: Volume, crane: Arc<Crane>, hook: Arc<dyn ReportingHook>) -> Self {
        Self {
            volume,
            crane,
            hook,
            stop_watch: StopWatch::new(),
            message: "Volume backup has never recorded any activity.".to_string(),
            state: RunState::Unknown,
        }
    }

    /// Remember the latest line of crane output
    pub fn log(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// Start the backup timer
    pub fn start(&mut self) -> Result<()> {
        self.stop_watch.start()
    }

    /// Resolve as successful and notify the hook
    pub fn success(&mut self) -> Result<()> {
        self.resolve(RunState::Success)?;
        self.hook
            .volume_success(&self.volume, &self.crane, self.stop_watch.duration());
        Ok(())
    }

    /// Resolve as failed and notify the hook
    pub fn failure(&mut self, message: impl Into<String>) -> Result<()> {
        self.resolve(RunState::Failure)?;
        self.message = message.into();
        self.hook.volume_failure(
            &self.volume,
            &self.crane,
            &self.message,
            self.stop_watch.duration(),
        );
        Ok(())
    }

    fn resolve(&mut self, state: RunState) -> Result<()> {
        if self.state != RunState::Unknown {
            return Err(SalvageError::AlreadyFinished {
                subject: format!("Volume '{}'", self.volume.name),
                state: self.state.to_string(),
            });
        }
        self.stop_watch.stop()?;
        self.state = state;
        Ok(())
    }

    /// Volume this log belongs to
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Crane backing up the volume
    pub fn crane(&self) -> &Arc<Crane> {
        &self.crane
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Last crane output line, or the failure reason
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backup timer
    pub fn stop_watch(&self) -> &StopWatch {
        &self.stop_watch
    }
}

/// Volume log shared between the tide log and a backup task
pub type SharedVolumeLog = Arc<Mutex<VolumeLog>>;

/// Lock a shared volume log, recovering from poisoning
pub fn lock(log: &SharedVolumeLog) -> MutexGuard<'_, VolumeLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Aggregated outcome of a tide execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TideResult {
    /// Final state
    pub state: RunState,
    /// Human readable reason
    pub message: String,
}

/// Outcome of a tide execution and all volume backups within it
pub struct TideLog {
    tide: String,
    hook: Arc<dyn ReportingHook>,
    volume_logs: Vec<SharedVolumeLog>,
    stop_watch: StopWatch,
    state: RunState,
    message: String,
}

impl fmt::Debug for TideLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TideLog")
            .field("tide", &self.tide)
            .field("volumes", &self.volume_logs.len())
            .field("state", &self.state)
            .field("message", &self.message)
            .finish()
    }
}

impl TideLog {
    /// Create an unresolved log for `tide`
    pub fn new(tide: impl Into<String>, hook: Arc<dyn ReportingHook>) -> Self {
        Self {
            tide: tide.into(),
            hook,
            volume_logs: Vec::new(),
            stop_watch: StopWatch::new(),
            state: RunState::Unknown,
            message: "No message has been reported by tide".to_string(),
        }
    }

    /// Get the log for `volume`, creating it on first use
    ///
    /// Logs are kept in creation order, which is the dispatch order of the
    /// backups.
    pub fn volume_log(&mut self, volume: &Volume, crane: &Arc<Crane>) -> Result<SharedVolumeLog> {
        if let Some(existing) = self
            .volume_logs
            .iter()
            .find(|log| lock(log).volume.name == volume.name)
        {
            let existing_crane = lock(existing).crane.name.clone();
            if existing_crane != crane.name {
                return Err(SalvageError::CraneMismatch {
                    volume: volume.name.clone(),
                    existing: existing_crane,
                    requested: crane.name.clone(),
                });
            }
            return Ok(Arc::clone(existing));
        }

        let log = Arc::new(Mutex::new(VolumeLog::new(
            volume.clone(),
            Arc::clone(crane),
            Arc::clone(&self.hook),
        )));
        self.volume_logs.push(Arc::clone(&log));
        Ok(log)
    }

    /// Start the tide timer
    pub fn start(&mut self) -> Result<()> {
        self.stop_watch.start()
    }

    /// Record that the tide itself completed
    pub fn success(&mut self) -> Result<()> {
        self.resolve(RunState::Success)
    }

    /// Record that the tide itself failed
    pub fn failure(&mut self, message: impl Into<String>) -> Result<()> {
        self.resolve(RunState::Failure)?;
        self.message = message.into();
        Ok(())
    }

    fn resolve(&mut self, state: RunState) -> Result<()> {
        if self.state != RunState::Unknown {
            return Err(SalvageError::AlreadyFinished {
                subject: format!("Tide '{}'", self.tide),
                state: self.state.to_string(),
            });
        }
        self.stop_watch.stop()?;
        self.state = state;
        Ok(())
    }

    /// Aggregate tide and volume outcomes
    ///
    /// The first failed volume wins, then the first volume that never
    /// resolved. Only without either does the tide's own outcome count.
    pub fn result(&self) -> TideResult {
        let states: Vec<(RunState, String, String)> = self
            .volume_logs
            .iter()
            .map(|log| {
                let log = lock(log);
                (log.state, log.volume.name.clone(), log.message.clone())
            })
            .collect();

        let severe = states
            .iter()
            .find(|(state, _, _)| *state == RunState::Failure)
            .or_else(|| states.iter().find(|(state, _, _)| *state == RunState::Unknown));

        match severe {
            Some((_, volume, message)) => TideResult {
                state: RunState::Failure,
                message: format!("volume backup '{}' reported: {}", volume, message),
            },
            None => TideResult {
                state: self.state,
                message: self.message.clone(),
            },
        }
    }

    /// Volumes with the given outcome, in dispatch order
    pub fn volumes_in_state(&self, state: RunState) -> Vec<Volume> {
        self.volume_logs
            .iter()
            .filter_map(|log| {
                let log = lock(log);
                (log.state == state).then(|| log.volume.clone())
            })
            .collect()
    }

    /// All volume logs in dispatch order
    pub fn volume_logs(&self) -> &[SharedVolumeLog] {
        &self.volume_logs
    }

    /// Tide name
    pub fn tide(&self) -> &str {
        &self.tide
    }

    /// Tide-level state, ignoring volumes
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Tide timer
    pub fn stop_watch(&self) -> &StopWatch {
        &self.stop_watch
    }
}
