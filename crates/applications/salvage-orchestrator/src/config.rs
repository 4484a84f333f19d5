//! Label based configuration
//!
//! ## Daemon container
//!
//! Tides and cranes are read from the labels of the container salvage runs
//! in, the one labelled `salvage.root`:
//!
//! ```text
//! salvage.cranes.<crane>.image          = restic/restic:0.16
//! salvage.cranes.<crane>.env.<KEY>      = value
//! salvage.cranes.<crane>.mount.<source> = /target
//! salvage.cranes.<crane>.maxConcurrent  = 2
//! salvage.cranes.<crane>.pullOnRun      = true
//! salvage.tides.<tide>.cron             = 0 4 * * *
//! salvage.tides.<tide>.crane            = <crane>
//! salvage.tides.<tide>.grouping         = individual | smart | project
//! salvage.tides.<tide>.maxConcurrent    = 4
//! salvage.tides.<tide>.report.tide.success = https://...
//! salvage.tides.<tide>.report.method    = POST | GET
//! ```
//!
//! ## Application containers
//!
//! `salvage.action`, `salvage.command.{pre,post}`, `salvage.command.user` and
//! `salvage.command.{pre,post}.exitCode` tune how a container is treated while
//! its volumes are backed up.

use crate::engine::ContainerInfo;
use crate::error::{OrchestratorError, Result};
use salvage_core::{
    Container, ContainerAction, ContainerCommand, Crane, ExitCodePolicy, GroupingMode,
    ReportingUrls, Schedule, Tide, Volume, UNBOUNDED,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Marks the container salvage runs in
pub const ROOT_LABEL: &str = "salvage.root";

/// Prefix of tide configuration labels
pub const TIDE_PREFIX: &str = "salvage.tides.";

/// Prefix of crane configuration labels
pub const CRANE_PREFIX: &str = "salvage.cranes.";

/// Compose project of a container or volume
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Compose-local name of a volume
pub const COMPOSE_VOLUME_LABEL: &str = "com.docker.compose.volume";

/// Container action override
pub const ACTION_LABEL: &str = "salvage.action";

/// User for pre- and post-commands
pub const COMMAND_USER_LABEL: &str = "salvage.command.user";

/// Command run before the backup
pub const COMMAND_PRE_LABEL: &str = "salvage.command.pre";

/// Command run after the backup
pub const COMMAND_POST_LABEL: &str = "salvage.command.post";

/// Suffix selecting the exit code policy of a command
pub const EXIT_CODE_SUFFIX: &str = ".exitCode";

/// Prefix of the per-container tide volume lists
pub const TIDE_VOLUMES_PREFIX: &str = "salvage.tide.";

/// Volume label requesting a dry run
pub const DRY_RUN_LABEL: &str = "salvage.dryRun";

/// Volume name prefix bypassing compose project resolution
pub const GLOBAL_VOLUME_PREFIX: &str = "g:";

/// Everything salvage learns from its own container
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Machine name, reported to cranes and webhooks
    pub machine: String,
    /// Id of the container salvage runs in
    pub own_container_id: String,
    /// Configured tides, sorted by name
    pub tides: Vec<Tide>,
    /// Configured cranes by name
    pub cranes: BTreeMap<String, Arc<Crane>>,
}

impl Configuration {
    /// Build the configuration from the labels of the daemon container
    pub fn from_labels(
        machine: impl Into<String>,
        own_container_id: impl Into<String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let machine = machine.into();
        if machine.trim().is_empty() {
            return Err(OrchestratorError::config("machine name must not be empty"));
        }

        let mut cranes = BTreeMap::new();
        for name in entity_names(labels, CRANE_PREFIX) {
            let crane = parse_crane(&name, labels)?;
            debug!(crane = %name, image = %crane.image, "Loaded crane");
            cranes.insert(name, Arc::new(crane));
        }

        let mut tides = Vec::new();
        for name in entity_names(labels, TIDE_PREFIX) {
            let tide = parse_tide(&name, labels, &cranes)?;
            debug!(tide = %name, schedule = %tide.schedule, crane = %tide.crane.name, "Loaded tide");
            tides.push(tide);
        }

        if tides.is_empty() {
            return Err(OrchestratorError::config(
                "no tides configured, add salvage.tides.<name>.* labels",
            ));
        }

        Ok(Self {
            machine,
            own_container_id: own_container_id.into(),
            tides,
            cranes,
        })
    }

    /// Look up a tide by name
    pub fn tide(&self, name: &str) -> Option<&Tide> {
        self.tides.iter().find(|t| t.name == name)
    }
}

/// Names between `prefix` and the next dot
fn entity_names(labels: &BTreeMap<String, String>, prefix: &str) -> BTreeSet<String> {
    labels
        .keys()
        .filter_map(|key| key.strip_prefix(prefix))
        .filter_map(|rest| rest.split_once('.').map(|(name, _)| name))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_crane(name: &str, labels: &BTreeMap<String, String>) -> Result<Crane> {
    let prefix = format!("{}{}", CRANE_PREFIX, name);
    let image = labels.get(&format!("{}.image", prefix)).ok_or_else(|| {
        OrchestratorError::config(format!("crane '{}' has no image", name))
    })?;

    let mut crane = Crane::new(name, image.clone());

    let env_prefix = format!("{}.env.", prefix);
    let mount_prefix = format!("{}.mount.", prefix);
    for (key, value) in labels {
        if let Some(var) = key.strip_prefix(&env_prefix) {
            crane = crane.with_env(var, value.clone());
        } else if let Some(source) = key.strip_prefix(&mount_prefix) {
            crane = crane.with_mount(source, value.clone());
        }
    }

    if let Some(max) = labels.get(&format!("{}.maxConcurrent", prefix)) {
        crane = crane.with_max_concurrent(parse_capacity(&format!("crane '{}'", name), max)?);
    }
    if let Some(pull) = labels.get(&format!("{}.pullOnRun", prefix)) {
        crane = crane.with_pull_on_run(parse_flag(pull));
    }

    Ok(crane)
}

fn parse_tide(
    name: &str,
    labels: &BTreeMap<String, String>,
    cranes: &BTreeMap<String, Arc<Crane>>,
) -> Result<Tide> {
    let prefix = format!("{}{}", TIDE_PREFIX, name);
    let required = |suffix: &str| {
        labels.get(&format!("{}.{}", prefix, suffix)).ok_or_else(|| {
            OrchestratorError::config(format!("tide '{}' has no {} label", name, suffix))
        })
    };

    let schedule = Schedule::parse(required("cron")?)?;

    let crane_name = required("crane")?;
    let crane = cranes.get(crane_name).ok_or_else(|| {
        OrchestratorError::config(format!(
            "tide '{}' uses unknown crane '{}'",
            name, crane_name
        ))
    })?;

    let grouping: GroupingMode = required("grouping")?.parse()?;

    let mut tide = Tide::new(name, Arc::clone(crane), grouping, schedule)
        .with_reporting(parse_reporting(name, &prefix, labels)?);

    if let Some(max) = labels.get(&format!("{}.maxConcurrent", prefix)) {
        tide = tide.with_max_concurrent(parse_capacity(&format!("tide '{}'", name), max)?);
    }

    Ok(tide)
}

fn parse_reporting(
    name: &str,
    prefix: &str,
    labels: &BTreeMap<String, String>,
) -> Result<ReportingUrls> {
    let url = |suffix: &str| -> Result<Option<String>> {
        match labels.get(&format!("{}.report.{}", prefix, suffix)) {
            None => Ok(None),
            Some(raw) => reqwest::Url::parse(raw)
                .map(|url| Some(url.to_string()))
                .map_err(|e| {
                    OrchestratorError::config(format!(
                        "tide '{}' has invalid report URL '{}': {}",
                        name, raw, e
                    ))
                }),
        }
    };

    let use_get = match labels.get(&format!("{}.report.method", prefix)) {
        None => false,
        Some(method) if method.eq_ignore_ascii_case("post") => false,
        Some(method) if method.eq_ignore_ascii_case("get") => true,
        Some(other) => {
            return Err(OrchestratorError::config(format!(
                "tide '{}' has unsupported report method '{}'",
                name, other
            )));
        }
    };

    Ok(ReportingUrls {
        tide_success: url("tide.success")?,
        tide_failure: url("tide.failure")?,
        volume_success: url("volume.success")?,
        volume_failure: url("volume.failure")?,
        use_get,
    })
}

fn parse_capacity(subject: &str, raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(OrchestratorError::config(format!(
            "{} has invalid maxConcurrent '{}', expected a positive number",
            subject, raw
        ))),
        Ok(n) => Ok(n),
    }
}

/// `true` in any letter case
pub fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

/// Turn an inspected container into its backup configuration
///
/// Only mounts of `tide_volumes` are kept, other volumes of the container are
/// none of this tide's business.
pub fn container_from_info(info: &ContainerInfo, tide_volumes: &[Volume]) -> Result<Container> {
    let labels = &info.labels;

    let user = labels
        .get(COMMAND_USER_LABEL)
        .cloned()
        .unwrap_or_else(|| info.user.clone());
    let command = |label: &str| -> Result<Option<ContainerCommand>> {
        let Some(line) = labels.get(label) else {
            return Ok(None);
        };
        let mut command = ContainerCommand::new(line.clone());
        if !user.is_empty() {
            command = command.with_user(user.clone());
        }
        if let Some(policy) = labels.get(&format!("{}{}", label, EXIT_CODE_SUFFIX)) {
            command = command.with_policy(policy.parse::<ExitCodePolicy>()?);
        }
        Ok(Some(command))
    };

    let pre = command(COMMAND_PRE_LABEL)?;
    let post = command(COMMAND_POST_LABEL)?;

    let action = match labels.get(ACTION_LABEL) {
        Some(action) => action.parse::<ContainerAction>()?,
        None if pre.is_some() || post.is_some() => ContainerAction::Ignore,
        None => ContainerAction::Stop,
    };

    let mut container = Container::new(&info.id, &info.name).with_action(action);
    if let Some(project) = labels.get(COMPOSE_PROJECT_LABEL) {
        container = container.with_project(project.clone());
    }
    if let Some(pre) = pre {
        container = container.with_pre_command(pre);
    }
    if let Some(post) = post {
        container = container.with_post_command(post);
    }

    for mount in &info.mounts {
        let Some(name) = &mount.name else { continue };
        if tide_volumes.iter().any(|v| &v.name == name) && !container.volumes.contains(name) {
            container = container.with_volume(name.clone());
        }
    }

    Ok(container)
}

/// Capacity rendered for logs
pub fn capacity_label(capacity: usize) -> String {
    if capacity == UNBOUNDED {
        "unbounded".to_string()
    } else {
        capacity.to_string()
    }
}
