//! Tide scheduler
//!
//! Keeps every tide paired with its next execution time, sleeps until the
//! earliest one is due and executes it. Tides never overlap; a tide that is
//! due while another one runs starts right after it.

use crate::error::{OrchestratorError, Result};
use crate::service::TideService;
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use salvage_core::Tide;
use std::time::Duration;
use tracing::{error, info, warn};

/// Extra delay after the scheduled time, so a tide never fires early
pub const SETTLE_BUFFER: Duration = Duration::from_secs(1);

/// Runs tides on their schedules until shutdown
pub struct TideScheduler {
    service: TideService,
    queue: Vec<(Tide, DateTime<Utc>)>,
}

impl TideScheduler {
    /// Compute the first execution of every tide
    ///
    /// Fails if a tide will never run again.
    pub fn new(service: TideService, tides: Vec<Tide>, now: DateTime<Utc>) -> Result<Self> {
        let mut queue = Vec::with_capacity(tides.len());
        for tide in tides {
            let next = next_execution(&tide, &now)?;
            queue.push((tide, next));
        }
        Ok(Self { service, queue })
    }

    /// Tide due next and when
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<(&Tide, DateTime<Utc>)> {
        earliest(&self.queue).map(|i| (&self.queue[i].0, self.queue[i].1))
    }

    /// Run until `shutdown` fires
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<()> {
        for (tide, next) in &self.queue {
            info!(tide = %tide.name, next = %next, "Scheduled tide");
        }

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let Some(index) = earliest(&self.queue) else {
                break;
            };
            let (tide, due) = self.queue.swap_remove(index);

            let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO) + SETTLE_BUFFER;
            info!(tide = %tide.name, due = %due, wait_secs = wait.as_secs(), "Waiting for next tide");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.triggered() => break,
            }

            match self.service.execute(&tide, &mut shutdown).await {
                Ok(_) => {}
                Err(OrchestratorError::Cancelled) => break,
                Err(e) => error!(tide = %tide.name, error = %e, "Tide execution failed"),
            }

            self.reschedule(tide, &Utc::now());
        }

        if self.queue.is_empty() {
            warn!("No tide has a future execution left");
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// Queue the next execution of `tide`, dropping it if there is none
    fn reschedule(&mut self, tide: Tide, after: &DateTime<Utc>) {
        match next_execution(&tide, after) {
            Ok(next) => {
                info!(tide = %tide.name, next = %next, "Rescheduled tide");
                self.queue.push((tide, next));
            }
            Err(e) => warn!(tide = %tide.name, error = %e, "Dropping tide from schedule"),
        }
    }
}

fn next_execution(tide: &Tide, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    tide.schedule.next_after(after).ok_or_else(|| {
        OrchestratorError::config(format!(
            "tide '{}' has no future execution for schedule '{}'",
            tide.name, tide.schedule
        ))
    })
}

/// Index of the entry due first, ties broken by position
fn earliest(queue: &[(Tide, DateTime<Utc>)]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .min_by_key(|(_, (_, due))| *due)
        .map(|(i, _)| i)
}
