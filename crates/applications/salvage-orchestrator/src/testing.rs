//! Test helpers shared across modules

use salvage_core::{Crane, ReportingHook, Tide, Volume};
use std::sync::Mutex;
use std::time::Duration;

/// Reporting hook that records every notification as a string
#[derive(Default)]
pub struct RecordingHook {
    events: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn names(volumes: &[Volume]) -> String {
    volumes
        .iter()
        .map(|v| v.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

impl ReportingHook for RecordingHook {
    fn volume_success(&self, volume: &Volume, _crane: &Crane, _duration: Duration) {
        self.push(format!("volume_success:{}", volume.name));
    }

    fn volume_failure(&self, volume: &Volume, _crane: &Crane, _message: &str, _duration: Duration) {
        self.push(format!("volume_failure:{}", volume.name));
    }

    fn tide_success(&self, tide: &Tide, volumes: &[Volume], _duration: Duration) {
        self.push(format!("tide_success:{}:{}", tide.name, names(volumes)));
    }

    fn tide_failure(&self, tide: &Tide, message: &str, _duration: Duration) {
        self.push(format!("tide_failure:{}:{}", tide.name, message));
    }

    fn tide_failure_with_volumes(
        &self,
        tide: &Tide,
        succeeded: &[Volume],
        failed: &[Volume],
        _message: &str,
        _duration: Duration,
    ) {
        self.push(format!(
            "tide_failure_with_volumes:{}:{}:{}",
            tide.name,
            names(succeeded),
            names(failed)
        ));
    }
}
