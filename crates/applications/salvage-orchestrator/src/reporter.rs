//! Webhook reporting
//!
//! Each tide may configure up to four endpoints (tide success/failure, volume
//! success/failure). Notifications are sent in the background; a slow or
//! broken endpoint never delays a backup, delivery errors are only logged.

use crate::error::Result;
use crate::service::HookFactory;
use salvage_core::{Crane, ReportingHook, ReportingUrls, Tide, Volume};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Longest message forwarded to a webhook
pub const MAX_MESSAGE_LENGTH: usize = 3000;

/// Per request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEvent {
    /// A volume was backed up
    VolumeSuccess,
    /// A volume backup failed
    VolumeFailure,
    /// A tide completed
    TideSuccess,
    /// A tide failed
    TideFailure,
}

/// JSON body of a POST notification
///
/// `content` carries a one line summary so chat webhooks render something
/// readable without a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    /// Kind of notification
    pub event: ReportEvent,
    /// One line summary
    pub content: String,
    /// Machine name
    pub host: String,
    /// Tide name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tide: Option<String>,
    /// Volume name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// Crane name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crane: Option<String>,
    /// Volumes that were backed up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<Vec<String>>,
    /// Volumes whose backup failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<String>>,
    /// Human readable duration
    pub duration: String,
    /// Failure reason, abbreviated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reporting hook posting to the webhooks of one tide
pub struct WebhookReporter {
    client: reqwest::Client,
    host: String,
    urls: ReportingUrls,
}

impl WebhookReporter {
    /// Create a reporter for `urls`
    pub fn new(client: reqwest::Client, host: impl Into<String>, urls: ReportingUrls) -> Self {
        Self {
            client,
            host: host.into(),
            urls,
        }
    }

    fn payload(&self, event: ReportEvent, content: String, duration: Duration) -> WebhookPayload {
        WebhookPayload {
            event,
            content,
            host: self.host.clone(),
            tide: None,
            volume: None,
            crane: None,
            succeeded: None,
            failed: None,
            duration: format_duration(duration),
            message: None,
        }
    }

    fn send(&self, url: Option<&String>, payload: WebhookPayload) {
        let Some(url) = url else {
            return;
        };

        let request = if self.urls.use_get {
            self.client.get(url)
        } else {
            self.client.post(url).json(&payload)
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(event = ?payload.event, "No runtime available, dropping webhook");
                return;
            }
        };

        let url = url.clone();
        handle.spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    debug!(url = %url, status = %response.status(), event = ?payload.event, "Webhook delivered");
                }
                Err(e) => {
                    error!(url = %url, event = ?payload.event, error = %e, "Failed to deliver webhook");
                }
            }
        });
    }
}

fn names(volumes: &[Volume]) -> Vec<String> {
    volumes.iter().map(|v| v.name.clone()).collect()
}

impl ReportingHook for WebhookReporter {
    fn volume_success(&self, volume: &Volume, crane: &Crane, duration: Duration) {
        let mut payload = self.payload(
            ReportEvent::VolumeSuccess,
            format!(
                "[{}] volume `{}` backed up by crane `{}` in {}",
                self.host,
                volume.name,
                crane.name,
                format_duration(duration)
            ),
            duration,
        );
        payload.volume = Some(volume.name.clone());
        payload.crane = Some(crane.name.clone());
        self.send(self.urls.volume_success.as_ref(), payload);
    }

    fn volume_failure(&self, volume: &Volume, crane: &Crane, message: &str, duration: Duration) {
        let message = abbreviate(message, MAX_MESSAGE_LENGTH);
        let mut payload = self.payload(
            ReportEvent::VolumeFailure,
            format!(
                "[{}] backup of volume `{}` by crane `{}` failed: {}",
                self.host, volume.name, crane.name, message
            ),
            duration,
        );
        payload.volume = Some(volume.name.clone());
        payload.crane = Some(crane.name.clone());
        payload.message = Some(message);
        self.send(self.urls.volume_failure.as_ref(), payload);
    }

    fn tide_success(&self, tide: &Tide, volumes: &[Volume], duration: Duration) {
        let mut payload = self.payload(
            ReportEvent::TideSuccess,
            format!(
                "[{}] tide `{}` backed up {} volumes in {}",
                self.host,
                tide.name,
                volumes.len(),
                format_duration(duration)
            ),
            duration,
        );
        payload.tide = Some(tide.name.clone());
        payload.crane = Some(tide.crane.name.clone());
        payload.succeeded = Some(names(volumes));
        self.send(self.urls.tide_success.as_ref(), payload);
    }

    fn tide_failure(&self, tide: &Tide, message: &str, duration: Duration) {
        let message = abbreviate(message, MAX_MESSAGE_LENGTH);
        let mut payload = self.payload(
            ReportEvent::TideFailure,
            format!("[{}] tide `{}` failed: {}", self.host, tide.name, message),
            duration,
        );
        payload.tide = Some(tide.name.clone());
        payload.crane = Some(tide.crane.name.clone());
        payload.message = Some(message);
        self.send(self.urls.tide_failure.as_ref(), payload);
    }

    fn tide_failure_with_volumes(
        &self,
        tide: &Tide,
        succeeded: &[Volume],
        failed: &[Volume],
        message: &str,
        duration: Duration,
    ) {
        let message = abbreviate(message, MAX_MESSAGE_LENGTH);
        let mut payload = self.payload(
            ReportEvent::TideFailure,
            format!(
                "[{}] tide `{}` failed ({} succeeded, {} failed): {}",
                self.host,
                tide.name,
                succeeded.len(),
                failed.len(),
                message
            ),
            duration,
        );
        payload.tide = Some(tide.name.clone());
        payload.crane = Some(tide.crane.name.clone());
        payload.succeeded = Some(names(succeeded));
        payload.failed = Some(names(failed));
        payload.message = Some(message);
        self.send(self.urls.tide_failure.as_ref(), payload);
    }
}

/// Creates a [`WebhookReporter`] per tide, sharing one HTTP client
#[derive(Clone)]
pub struct WebhookHooks {
    client: reqwest::Client,
    host: String,
}

impl WebhookHooks {
    /// Create the factory for machine `host`
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

impl HookFactory for WebhookHooks {
    fn hook_for(&self, tide: &Tide) -> Arc<dyn ReportingHook> {
        Arc::new(WebhookReporter::new(
            self.client.clone(),
            self.host.clone(),
            tide.reporting.clone(),
        ))
    }
}

/// Cut `message` to at most `max` characters, ending in `...` if shortened
pub fn abbreviate(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = message.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Render a duration as `1h 2m 3s`, `2m 3s` or `3.4s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salvage_core::{GroupingMode, Schedule};

    fn reporter() -> WebhookReporter {
        WebhookReporter::new(reqwest::Client::new(), "node-1", ReportingUrls::default())
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short", 10), "short");
        assert_eq!(abbreviate("exactly10!", 10), "exactly10!");
        assert_eq!(abbreviate("this is far too long", 10), "this is...");

        let long = "x".repeat(MAX_MESSAGE_LENGTH * 2);
        assert_eq!(abbreviate(&long, MAX_MESSAGE_LENGTH).chars().count(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(3400)), "3.4s");
        assert_eq!(format_duration(Duration::from_secs(123)), "2m 3s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[test]
    fn test_payload_shape() {
        let reporter = reporter();
        let mut payload = reporter.payload(
            ReportEvent::VolumeFailure,
            "summary".to_string(),
            Duration::from_secs(90),
        );
        payload.volume = Some("app_data".to_string());
        payload.message = Some("crane exited with code 2".to_string());

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "volume_failure");
        assert_eq!(json["host"], "node-1");
        assert_eq!(json["volume"], "app_data");
        assert_eq!(json["duration"], "1m 30s");
        assert_eq!(json["message"], "crane exited with code 2");
        assert!(json.get("tide").is_none());
        assert!(json.get("succeeded").is_none());
    }

    #[test]
    fn test_unconfigured_urls_are_silent() {
        // no runtime and no URLs: every hook returns without spawning
        let reporter = reporter();
        let crane = Arc::new(Crane::new("borg", "borg:1"));
        let tide = Tide::new(
            "nightly",
            Arc::clone(&crane),
            GroupingMode::Smart,
            Schedule::parse("0 4 * * *").unwrap(),
        );
        let volume = Volume::new("v1");

        reporter.volume_success(&volume, &crane, Duration::ZERO);
        reporter.volume_failure(&volume, &crane, "boom", Duration::ZERO);
        reporter.tide_success(&tide, &[volume.clone()], Duration::ZERO);
        reporter.tide_failure(&tide, "boom", Duration::ZERO);
        reporter.tide_failure_with_volumes(&tide, &[], &[volume], "boom", Duration::ZERO);
    }
}
