//! In-memory container engine for tests

use super::{
    ContainerEngine, ContainerFilter, ContainerInfo, ContainerSpec, ContainerState,
    ContainerSummary, ImageInfo, LineSink, MountInfo, VolumeInfo,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, ContainerInfo>,
    volumes: BTreeMap<String, VolumeInfo>,
    images: HashSet<String>,
    restarting_polls: HashMap<String, u32>,
    exec_exit_codes: HashMap<String, i64>,
    failing: HashSet<String>,
    crane_exit_codes: HashMap<String, i64>,
    crane_delay: Duration,
    created: HashMap<String, ContainerSpec>,
    stopped_cranes: HashSet<String>,
    crane_status: HashMap<String, String>,
    archives: HashMap<String, Vec<u8>>,
    windows: HashMap<String, (Instant, Instant)>,
    events: Vec<String>,
    next_id: usize,
    unreachable: bool,
}

/// Scriptable engine recording every state changing call
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    crane_stopped: Notify,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// Running container with the given id, also used as its name
pub fn running(id: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: id.to_string(),
        state: ContainerState {
            status: "running".to_string(),
            running: true,
            paused: false,
            restarting: false,
        },
        ..Default::default()
    }
}

/// Local volume with the given name
pub fn volume(name: &str) -> VolumeInfo {
    VolumeInfo {
        name: name.to_string(),
        driver: "local".to_string(),
        ..Default::default()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_container(self, info: ContainerInfo) -> Self {
        self.state().containers.insert(info.id.clone(), info);
        self
    }

    pub fn with_volume(self, info: VolumeInfo) -> Self {
        self.state().volumes.insert(info.name.clone(), info);
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state().images.insert(image.to_string());
        self
    }

    pub fn restarting_for(self, id: &str, polls: u32) -> Self {
        self.state().restarting_polls.insert(id.to_string(), polls);
        self
    }

    pub fn exec_exit_code(self, command: &str, code: i64) -> Self {
        self.state().exec_exit_codes.insert(command.to_string(), code);
        self
    }

    /// Make an operation fail, e.g. `start:db`
    pub fn fail_on(self, operation: &str) -> Self {
        self.state().failing.insert(operation.to_string());
        self
    }

    pub fn crane_exit_code(self, volume: &str, code: i64) -> Self {
        self.state().crane_exit_codes.insert(volume.to_string(), code);
        self
    }

    pub fn crane_delay(self, delay: Duration) -> Self {
        self.state().crane_delay = delay;
        self
    }

    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Recorded events starting with `prefix`
    pub fn events_matching(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn max_concurrent_cranes(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Start and end of the crane run for `volume`
    pub fn window(&self, volume: &str) -> Option<(Instant, Instant)> {
        self.state().windows.get(volume).copied()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state().created.values().cloned().collect()
    }

    pub fn archive(&self, id: &str) -> Option<Vec<u8>> {
        self.state().archives.get(id).cloned()
    }

    pub fn container(&self, id: &str) -> Option<ContainerInfo> {
        self.state().containers.get(id).cloned()
    }

    fn record(&self, event: String) {
        self.state().events.push(event);
    }

    fn check(&self, operation: &str, id: &str) -> Result<()> {
        let state = self.state();
        if state.unreachable {
            return Err(OrchestratorError::docker("connection refused"));
        }
        if state.failing.contains(&format!("{}:{}", operation, id)) {
            return Err(OrchestratorError::docker(format!("{} {} failed", operation, id)));
        }
        Ok(())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ContainerState)) -> Result<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("Container", id))?;
        f(&mut container.state);
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<()> {
        self.check("ping", "")
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        self.check("list", "")?;
        let state = self.state();
        Ok(state
            .containers
            .values()
            .filter(|c| filter.all || c.state.running)
            .filter(|c| {
                filter.labels.iter().all(|label| match label.split_once('=') {
                    Some((k, v)) => c.labels.get(k).map(String::as_str) == Some(v),
                    None => c.labels.contains_key(label),
                })
            })
            .filter(|c| {
                filter.volumes.is_empty()
                    || c.mounts
                        .iter()
                        .any(|m| m.name.as_ref().is_some_and(|n| filter.volumes.contains(n)))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.check("inspect", id)?;
        let mut state = self.state();
        let restarting = match state.restarting_polls.get_mut(id) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                true
            }
            _ => false,
        };
        if let Some(status) = state.crane_status.get(id) {
            let mut info = running(id);
            info.state.running = status == "running";
            info.state.status = status.clone();
            return Ok(info);
        }
        let mut info = state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Container", id))?;
        info.state.restarting = restarting;
        Ok(info)
    }

    async fn list_volumes(&self, labels: &[String]) -> Result<Vec<VolumeInfo>> {
        self.check("list_volumes", "")?;
        let state = self.state();
        Ok(state
            .volumes
            .values()
            .filter(|v| {
                labels.iter().all(|label| match label.split_once('=') {
                    Some((k, val)) => v.labels.get(k).map(String::as_str) == Some(val),
                    None => v.labels.contains_key(label),
                })
            })
            .cloned()
            .collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        self.check("inspect_volume", name)?;
        self.state()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Volume", name))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check("start", id)?;
        self.update(id, |s| {
            s.running = true;
            s.status = "running".to_string();
        })?;
        self.record(format!("start:{}", id));
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.check("stop", id)?;
        let is_crane = self.state().created.contains_key(id);
        if is_crane {
            self.state().stopped_cranes.insert(id.to_string());
            self.crane_stopped.notify_waiters();
        } else {
            self.update(id, |s| {
                s.running = false;
                s.status = "exited".to_string();
            })?;
        }
        self.record(format!("stop:{}", id));
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.check("pause", id)?;
        self.update(id, |s| s.paused = true)?;
        self.record(format!("pause:{}", id));
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.check("unpause", id)?;
        self.update(id, |s| s.paused = false)?;
        self.record(format!("unpause:{}", id));
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        user: Option<&str>,
        _privileged: bool,
        output: LineSink<'_>,
    ) -> Result<i64> {
        self.check("exec", id)?;
        let line = command.last().cloned().unwrap_or_default();
        let code = self.state().exec_exit_codes.get(&line).copied().unwrap_or(0);
        self.record(format!("exec:{}:{}:{}", id, user.unwrap_or(""), line));
        output(format!("ran {}", line).as_str());
        Ok(code)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check("create", &spec.image)?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("crane-{}", state.next_id);
        state.created.insert(id.clone(), spec.clone());
        state.crane_status.insert(id.clone(), "created".to_string());
        let volume = spec.env.get("SALVAGE_VOLUME_NAME").cloned().unwrap_or_default();
        state.events.push(format!("create:{}", volume));
        Ok(id)
    }

    async fn copy_archive(&self, id: &str, _path: &str, archive: Vec<u8>) -> Result<()> {
        self.check("copy", id)?;
        self.state().archives.insert(id.to_string(), archive);
        Ok(())
    }

    async fn start_attached(&self, id: &str, output: LineSink<'_>) -> Result<i64> {
        self.check("start_attached", id)?;
        let (volume, delay) = {
            let state = self.state();
            let spec = state
                .created
                .get(id)
                .ok_or_else(|| OrchestratorError::not_found("Container", id))?;
            let volume = spec.env.get("SALVAGE_VOLUME_NAME").cloned().unwrap_or_default();
            (volume, state.crane_delay)
        };
        self.state()
            .crane_status
            .insert(id.to_string(), "running".to_string());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let started = Instant::now();
        self.record(format!("crane_start:{}", volume));
        output(format!("backing up {}", volume).as_str());

        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        let stopped = loop {
            let notified = self.crane_stopped.notified();
            let stopped_now = self.state().stopped_cranes.contains(id);
            if stopped_now {
                break true;
            }
            tokio::select! {
                _ = &mut deadline => break false,
                _ = notified => continue,
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.state();
        state.windows.insert(volume.clone(), (started, Instant::now()));
        state.events.push(format!("crane_end:{}", volume));
        state.crane_status.insert(id.to_string(), "exited".to_string());
        if stopped {
            return Ok(137);
        }
        Ok(state.crane_exit_codes.get(&volume).copied().unwrap_or(0))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.check("remove", id)?;
        self.record(format!("remove:{}:{}", id, force));
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        self.check("inspect_image", image)?;
        if self.state().images.contains(image) {
            Ok(ImageInfo {
                id: format!("sha256:{}", image),
                repo_tags: vec![image.to_string()],
            })
        } else {
            Err(OrchestratorError::not_found("Image", image))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check("pull", image)?;
        self.state().images.insert(image.to_string());
        self.record(format!("pull:{}", image));
        Ok(())
    }
}

/// Attach a named volume mount to a container
pub fn mounting(mut info: ContainerInfo, volumes: &[&str]) -> ContainerInfo {
    for v in volumes {
        info.mounts.push(MountInfo {
            name: Some(v.to_string()),
            destination: format!("/data/{}", v),
        });
    }
    info
}

/// Add a label to a container
pub fn labelled(mut info: ContainerInfo, key: &str, value: &str) -> ContainerInfo {
    info.labels.insert(key.to_string(), value.to_string());
    info
}
