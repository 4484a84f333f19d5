//! Docker engine driven through the `docker` command line client
//!
//! Every call spawns the client binary. Structured data comes from
//! `docker inspect`, which is parsed with serde; list calls only collect ids and
//! inspect them afterwards, since the list formats flatten labels.

use super::{
    ContainerEngine, ContainerFilter, ContainerInfo, ContainerSpec, ContainerState,
    ContainerSummary, ImageInfo, LineSink, MountInfo, VolumeInfo,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default client binary
pub const DEFAULT_DOCKER_BIN: &str = "docker";

/// Docker engine reached through the CLI client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Use `docker` from `PATH`
    pub fn new() -> Self {
        Self {
            binary: DEFAULT_DOCKER_BIN.to_string(),
        }
    }

    /// Use a different client binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    /// Run the client to completion and return stdout
    async fn run(&self, args: &[String], context: &str) -> Result<Vec<u8>> {
        trace!(args = ?args, "Invoking docker");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::docker(format!("{}: failed to run docker: {}", context, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(context, stderr.trim()));
        }

        Ok(output.stdout)
    }

    /// Run the client and return trimmed non-empty stdout lines
    async fn run_lines(&self, args: &[String], context: &str) -> Result<Vec<String>> {
        let stdout = self.run(args, context).await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Spawn the client, forward combined output line by line and return its exit code
    async fn stream(&self, args: &[String], output: LineSink<'_>) -> Result<i64> {
        trace!(args = ?args, "Streaming docker");
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::docker(format!("failed to run docker: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let forward_out = forward_lines(stdout, tx.clone());
        let forward_err = forward_lines(stderr, tx);
        let consume = async {
            while let Some(line) = rx.recv().await {
                output(line.as_str());
            }
        };
        futures::future::join3(forward_out, forward_err, consume).await;

        let status = child.wait().await?;
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn inspect_containers(&self, ids: &[String]) -> Result<Vec<ContainerInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(ids.iter().cloned());
        let stdout = self.run(&args, "inspect container").await?;
        let raw: Vec<RawContainer> = serde_json::from_slice(&stdout)?;
        Ok(raw.into_iter().map(ContainerInfo::from).collect())
    }

    async fn inspect_volumes(&self, names: &[String]) -> Result<Vec<VolumeInfo>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["volume".to_string(), "inspect".to_string()];
        args.extend(names.iter().cloned());
        let stdout = self.run(&args, "inspect volume").await?;
        let raw: Vec<RawVolume> = serde_json::from_slice(&stdout)?;
        Ok(raw.into_iter().map(VolumeInfo::from).collect())
    }
}

async fn forward_lines<R>(reader: Option<R>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Map client error output to an error, recognising missing objects
fn classify(context: &str, stderr: &str) -> OrchestratorError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such") || lower.contains("not found") {
        let kind = if lower.contains("image") {
            "Image"
        } else if lower.contains("volume") {
            "Volume"
        } else {
            "Container"
        };
        return OrchestratorError::not_found(kind, stderr.to_string());
    }
    OrchestratorError::docker(format!("{}: {}", context, stderr))
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let version = self.run_lines(&args, "ping").await?;
        debug!(version = ?version.first(), "Docker engine reachable");
        Ok(())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps".to_string(), "-q".to_string(), "--no-trunc".to_string()];
        if filter.all {
            args.push("-a".to_string());
        }
        for label in &filter.labels {
            args.push("--filter".to_string());
            args.push(format!("label={}", label));
        }
        for volume in &filter.volumes {
            args.push("--filter".to_string());
            args.push(format!("volume={}", volume));
        }

        let ids = self.run_lines(&args, "list containers").await?;
        let containers = self.inspect_containers(&ids).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                labels: c.labels,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.inspect_containers(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::not_found("Container", id))
    }

    async fn list_volumes(&self, labels: &[String]) -> Result<Vec<VolumeInfo>> {
        let mut args = vec!["volume".to_string(), "ls".to_string(), "-q".to_string()];
        for label in labels {
            args.push("--filter".to_string());
            args.push(format!("label={}", label));
        }
        let names = self.run_lines(&args, "list volumes").await?;
        self.inspect_volumes(&names).await
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        self.inspect_volumes(&[name.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::not_found("Volume", name))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start".to_string(), id.to_string()], "start container")
            .await
            .map(|_| ())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            id.to_string(),
        ];
        self.run(&args, "stop container").await.map(|_| ())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run(&["pause".to_string(), id.to_string()], "pause container")
            .await
            .map(|_| ())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.run(&["unpause".to_string(), id.to_string()], "unpause container")
            .await
            .map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        user: Option<&str>,
        privileged: bool,
        output: LineSink<'_>,
    ) -> Result<i64> {
        let mut args = vec!["exec".to_string()];
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        if privileged {
            args.push("--privileged".to_string());
        }
        args.push(id.to_string());
        args.extend(command.iter().cloned());

        self.stream(&args, output).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args = vec!["create".to_string()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            args.push("-v".to_string());
            let mode = if mount.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", mount.source, mount.target, mode));
        }
        if spec.auto_remove {
            args.push("--rm".to_string());
        }
        if let Some(timeout) = spec.stop_timeout {
            args.push("--stop-timeout".to_string());
            args.push(timeout.as_secs().to_string());
        }
        args.push(spec.image.clone());

        self.run_lines(&args, "create container")
            .await?
            .pop()
            .ok_or_else(|| OrchestratorError::docker("create container: no id returned"))
    }

    async fn copy_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let target = format!("{}:{}", id, path);
        let mut child = self
            .command(["cp", "-", target.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::docker(format!("copy archive: failed to run docker: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&archive).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify("copy archive", stderr.trim()));
        }
        Ok(())
    }

    async fn start_attached(&self, id: &str, output: LineSink<'_>) -> Result<i64> {
        let args = vec!["start".to_string(), "-a".to_string(), id.to_string()];
        self.stream(&args, output).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string(), "-v".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id.to_string());
        self.run(&args, "remove container").await.map(|_| ())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        let args = vec!["image".to_string(), "inspect".to_string(), image.to_string()];
        let stdout = self.run(&args, "inspect image").await?;
        let raw: Vec<RawImage> = serde_json::from_slice(&stdout)?;
        raw.into_iter()
            .next()
            .map(|i| ImageInfo {
                id: i.id,
                repo_tags: i.repo_tags.unwrap_or_default(),
            })
            .ok_or_else(|| OrchestratorError::not_found("Image", image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let args = vec!["pull".to_string(), "-q".to_string(), image.to_string()];
        self.run(&args, "pull image").await.map(|_| ())
    }
}

/// `docker inspect --type container` entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    #[serde(default)]
    name: String,
    config: RawConfig,
    #[serde(default)]
    host_config: RawHostConfig,
    state: RawState,
    #[serde(default)]
    mounts: Vec<RawMount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHostConfig {
    #[serde(default)]
    privileged: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    restarting: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMount {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    destination: String,
}

impl From<RawContainer> for ContainerInfo {
    fn from(raw: RawContainer) -> Self {
        Self {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            labels: raw.config.labels.unwrap_or_default(),
            user: raw.config.user,
            privileged: raw.host_config.privileged,
            state: ContainerState {
                status: raw.state.status,
                running: raw.state.running,
                paused: raw.state.paused,
                restarting: raw.state.restarting,
            },
            mounts: raw
                .mounts
                .into_iter()
                .map(|m| MountInfo {
                    name: m.name.filter(|n| !n.is_empty()),
                    destination: m.destination,
                })
                .collect(),
        }
    }
}

/// `docker volume inspect` entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawVolume {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    options: Option<BTreeMap<String, String>>,
}

impl From<RawVolume> for VolumeInfo {
    fn from(raw: RawVolume) -> Self {
        Self {
            name: raw.name,
            labels: raw.labels.unwrap_or_default(),
            driver: raw.driver,
            options: raw.options.unwrap_or_default(),
        }
    }
}

/// `docker image inspect` entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_inspect() {
        let json = r#"[{
            "Id": "4f1c",
            "Name": "/app-db-1",
            "Config": {
                "User": "postgres",
                "Labels": {
                    "com.docker.compose.project": "app",
                    "salvage.tide.nightly": "data,g:shared"
                }
            },
            "HostConfig": { "Privileged": true },
            "State": { "Status": "running", "Running": true, "Paused": false, "Restarting": false },
            "Mounts": [
                { "Type": "volume", "Name": "app_data", "Destination": "/var/lib/postgresql/data" },
                { "Type": "bind", "Source": "/etc/localtime", "Destination": "/etc/localtime" }
            ]
        }]"#;

        let raw: Vec<RawContainer> = serde_json::from_str(json).unwrap();
        let info = ContainerInfo::from(raw.into_iter().next().unwrap());

        assert_eq!(info.id, "4f1c");
        assert_eq!(info.name, "app-db-1");
        assert_eq!(info.user, "postgres");
        assert!(info.privileged);
        assert!(info.state.running);
        assert_eq!(info.labels.get("salvage.tide.nightly").unwrap(), "data,g:shared");
        assert_eq!(info.mounts[0].name.as_deref(), Some("app_data"));
        assert_eq!(info.mounts[1].name, None);
    }

    #[test]
    fn test_parse_null_labels() {
        let json = r#"[{
            "Id": "abc",
            "Name": "/plain",
            "Config": { "Labels": null },
            "State": { "Status": "exited" }
        }]"#;

        let raw: Vec<RawContainer> = serde_json::from_str(json).unwrap();
        let info = ContainerInfo::from(raw.into_iter().next().unwrap());
        assert!(info.labels.is_empty());
        assert!(!info.state.running);
        assert!(!info.privileged);
    }

    #[test]
    fn test_parse_volume_inspect() {
        let json = r#"[{
            "Name": "app_data",
            "Driver": "local",
            "Labels": { "com.docker.compose.volume": "data" },
            "Options": null
        }]"#;

        let raw: Vec<RawVolume> = serde_json::from_str(json).unwrap();
        let info = VolumeInfo::from(raw.into_iter().next().unwrap());
        assert_eq!(info.name, "app_data");
        assert_eq!(info.driver, "local");
        assert!(info.options.is_empty());
        assert_eq!(info.labels.get("com.docker.compose.volume").unwrap(), "data");
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify("inspect image", "Error: No such image: borg:latest");
        assert!(matches!(err, OrchestratorError::NotFound { kind: "Image", .. }));

        let err = classify("start container", "permission denied");
        assert!(matches!(err, OrchestratorError::Docker(_)));
    }
}
