//! Core types shared across Salvage components
//!
//! Tides and cranes are loaded once and live for the whole process. Volumes,
//! containers and groups are rebuilt from the container engine on every tide
//! execution and never cached.

use crate::error::{Result, SalvageError};
use crate::exit_code::ExitCodePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Capacity used when no concurrency limit is configured
pub const UNBOUNDED: usize = usize::MAX;

/// Controls how the volumes of a tide are split into downtime windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupingMode {
    /// Back up each volume on its own, even if that means stopping the same
    /// container several times
    Individual,

    /// Merge volumes that share a container, ignore compose projects
    Smart,

    /// Like `Smart`, but never split the containers of a compose project
    Project,
}

impl FromStr for GroupingMode {
    type Err = SalvageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "individual" => Ok(Self::Individual),
            "smart" => Ok(Self::Smart),
            "project" => Ok(Self::Project),
            other => Err(SalvageError::config(format!("Unknown grouping mode: {}", other))),
        }
    }
}

impl fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingMode::Individual => write!(f, "individual"),
            GroupingMode::Smart => write!(f, "smart"),
            GroupingMode::Project => write!(f, "project"),
        }
    }
}

/// What happens to a container while its volumes are backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerAction {
    /// Leave the container alone (pre- and post-commands still run)
    Ignore,
    /// Stop the container and start it again afterwards
    Stop,
    /// Pause the container and unpause it afterwards
    Pause,
}

impl FromStr for ContainerAction {
    type Err = SalvageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ignore" => Ok(Self::Ignore),
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            other => Err(SalvageError::config(format!("Unknown container action: {}", other))),
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerAction::Ignore => write!(f, "ignore"),
            ContainerAction::Stop => write!(f, "stop"),
            ContainerAction::Pause => write!(f, "pause"),
        }
    }
}

/// Crontab schedule of a tide
///
/// Accepts the classic five field UNIX format (`minute hour day month weekday`).
/// Numeric weekdays follow crontab, where `0` and `7` are Sunday.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    inner: cron::Schedule,
}

impl Schedule {
    /// Parse a five field crontab expression
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SalvageError::schedule(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let weekday = weekday_names(fields[4]);
        let normalized = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], weekday
        );

        let inner = cron::Schedule::from_str(&normalized)
            .map_err(|e| SalvageError::schedule(expression, e))?;

        Ok(Self {
            expression: expression.to_string(),
            inner,
        })
    }

    /// First occurrence strictly after `after`, if the schedule has one
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(after).next()
    }

    /// Original expression as configured
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// Replace crontab weekday numbers by names, leaving step values untouched
///
/// Crontab counts `0` and `7` as Sunday, the `cron` crate orders weekdays
/// `Sun..=Sat`, so ranges touching Sunday at the end are split.
fn weekday_names(field: &str) -> String {
    const NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

    let map = |token: &str| -> String {
        match token.parse::<usize>() {
            Ok(n) if n < NAMES.len() => NAMES[n].to_string(),
            _ => token.to_string(),
        }
    };

    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let Some((start, end)) = base.split_once('-') else {
                return match step {
                    Some(step) => format!("{}/{}", map(base), step),
                    None => map(base),
                };
            };

            let numeric = (start.parse::<usize>(), end.parse::<usize>());
            match (numeric, step) {
                ((Ok(a), Ok(b)), Some(step)) if a <= b && b < NAMES.len() => {
                    match step.parse::<usize>() {
                        Ok(n) if n > 0 => expand_weekdays(a, b, n, &NAMES),
                        _ => format!("{}-{}/{}", map(start), map(end), step),
                    }
                }
                ((Ok(0), Ok(7)), None) => "Sun-Sat".to_string(),
                ((Ok(a), Ok(7)), None) if a < 7 => format!("{}-Sat,Sun", NAMES[a]),
                (_, Some(step)) => format!("{}-{}/{}", map(start), map(end), step),
                (_, None) => format!("{}-{}", map(start), map(end)),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Explicit list of the weekdays in `start..=end` taken every `step` days
fn expand_weekdays(start: usize, end: usize, step: usize, names: &[&str; 8]) -> String {
    let mut days: Vec<&str> = Vec::new();
    for n in (start..=end).step_by(step) {
        if !days.contains(&names[n]) {
            days.push(names[n]);
        }
    }
    days.join(",")
}

/// Backup worker template, invoked once per volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crane {
    /// Crane name as configured
    pub name: String,

    /// Image the crane container is created from
    pub image: String,

    /// Environment passed to every crane container
    pub env: BTreeMap<String, String>,

    /// Additional mounts, source to target path
    pub mounts: BTreeMap<String, String>,

    /// Maximum number of volumes this crane backs up at once
    pub max_concurrent: usize,

    /// Pull the image before every tide, not only when it is missing
    pub pull_on_run: bool,
}

impl Crane {
    /// Create a crane with no env, no mounts and unbounded capacity
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            mounts: BTreeMap::new(),
            max_concurrent: UNBOUNDED,
            pull_on_run: false,
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a mount
    pub fn with_mount(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.mounts.insert(source.into(), target.into());
        self
    }

    /// Limit concurrent backups (values below 1 are raised to 1)
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Always pull the image before a tide
    pub fn with_pull_on_run(mut self, pull: bool) -> Self {
        self.pull_on_run = pull;
        self
    }
}

/// Webhook endpoints of a tide
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportingUrls {
    /// Called after a successful tide
    pub tide_success: Option<String>,
    /// Called after a failed tide
    pub tide_failure: Option<String>,
    /// Called after each successful volume
    pub volume_success: Option<String>,
    /// Called after each failed volume
    pub volume_failure: Option<String>,
    /// Use GET without body instead of POST with JSON
    pub use_get: bool,
}

/// A scheduled backup job bound to exactly one crane
#[derive(Debug, Clone)]
pub struct Tide {
    /// Tide name as configured
    pub name: String,

    /// Crane used for every volume of this tide
    pub crane: Arc<Crane>,

    /// How volumes are grouped into downtime windows
    pub grouping: GroupingMode,

    /// When the tide runs
    pub schedule: Schedule,

    /// Upper bound on concurrent backups, regardless of crane capacity
    pub max_concurrent: usize,

    /// Where outcomes are reported
    pub reporting: ReportingUrls,
}

impl Tide {
    /// Create a tide with unbounded concurrency and no reporting
    pub fn new(
        name: impl Into<String>,
        crane: Arc<Crane>,
        grouping: GroupingMode,
        schedule: Schedule,
    ) -> Self {
        Self {
            name: name.into(),
            crane,
            grouping,
            schedule,
            max_concurrent: UNBOUNDED,
            reporting: ReportingUrls::default(),
        }
    }

    /// Limit concurrent backups (values below 1 are raised to 1)
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set reporting endpoints
    pub fn with_reporting(mut self, reporting: ReportingUrls) -> Self {
        self.reporting = reporting;
        self
    }
}

/// Volume metadata as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// Engine volume name
    pub name: String,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
    /// Volume driver
    pub driver: String,
    /// Driver options
    pub driver_options: BTreeMap<String, String>,
}

/// A volume that belongs to the tide being executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Engine volume name
    pub name: String,
    /// Metadata uploaded alongside the backup
    pub meta: VolumeMeta,
    /// Skip the crane and only rehearse the container handling
    pub dry_run: bool,
}

impl Volume {
    /// Create a volume with default metadata
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            meta: VolumeMeta {
                name: name.clone(),
                driver: "local".to_string(),
                ..Default::default()
            },
            name,
            dry_run: false,
        }
    }

    /// Mark as dry run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Command executed inside a container before or after a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    /// Shell command line
    pub command: String,
    /// User the command runs as, container default if unset
    pub user: Option<String>,
    /// Accepted exit codes
    pub policy: ExitCodePolicy,
}

impl ContainerCommand {
    /// Create a command running as the container user, failing on non-zero exit
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            user: None,
            policy: ExitCodePolicy::default(),
        }
    }

    /// Run as `user`
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Use a different exit code policy
    pub fn with_policy(mut self, policy: ExitCodePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)
    }
}

/// A container depending on at least one volume of the tide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Engine container id
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Compose project, if any
    pub project: Option<String>,

    /// Names of the tide volumes this container mounts
    pub volumes: Vec<String>,

    /// What to do with the container during backup
    pub action: ContainerAction,

    /// Command run before the backup
    pub pre_command: Option<ContainerCommand>,

    /// Command run after the backup, only if the pre-command ran
    pub post_command: Option<ContainerCommand>,
}

impl Container {
    /// Create a container that is stopped during backup
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project: None,
            volumes: Vec::new(),
            action: ContainerAction::Stop,
            pre_command: None,
            post_command: None,
        }
    }

    /// Set the compose project
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Add a mounted tide volume
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Set the backup action
    pub fn with_action(mut self, action: ContainerAction) -> Self {
        self.action = action;
        self
    }

    /// Set the pre-command
    pub fn with_pre_command(mut self, command: ContainerCommand) -> Self {
        self.pre_command = Some(command);
        self
    }

    /// Set the post-command
    pub fn with_post_command(mut self, command: ContainerCommand) -> Self {
        self.post_command = Some(command);
        self
    }
}

/// Containers and volumes that share one downtime window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    /// Containers to prepare before and restore after the backup
    pub containers: Vec<Container>,
    /// Volumes backed up while the containers are prepared
    pub volumes: Vec<Volume>,
}

impl Group {
    /// Ids of the containers in this group
    pub fn container_ids(&self) -> Vec<&str> {
        self.containers.iter().map(|c| c.id.as_str()).collect()
    }

    /// Names of the volumes in this group
    pub fn volume_names(&self) -> Vec<&str> {
        self.volumes.iter().map(|v| v.name.as_str()).collect()
    }
}
