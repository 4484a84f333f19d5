//! Label based discovery of salvage's own container, tide volumes and the
//! containers depending on them
//!
//! ## How It Works
//!
//! 1. The daemon container carries `salvage.root` and holds the configuration
//! 2. Application containers list their volumes per tide in
//!    `salvage.tide.<tide>=data,db,g:shared`
//! 3. Plain names are resolved inside the container's compose project, names
//!    prefixed with `g:` are looked up globally
//! 4. Running containers mounting any of the resolved volumes are affected by
//!    the tide
//!
//! Nothing here is cached, every tide execution discovers from scratch.

use crate::config::{
    container_from_info, parse_flag, COMPOSE_PROJECT_LABEL, COMPOSE_VOLUME_LABEL, DRY_RUN_LABEL,
    GLOBAL_VOLUME_PREFIX, ROOT_LABEL, TIDE_VOLUMES_PREFIX,
};
use crate::engine::{ContainerEngine, ContainerFilter, ContainerInfo, VolumeInfo};
use crate::error::{OrchestratorError, Result};
use crate::vessel::ENTITY_LABEL;
use salvage_core::{Container, Volume, VolumeMeta};
use tracing::{debug, info, warn};

/// Find the single container labelled `salvage.root`
pub async fn own_container(engine: &dyn ContainerEngine) -> Result<ContainerInfo> {
    let candidates = engine
        .list_containers(&ContainerFilter::all_with_label(ROOT_LABEL))
        .await?;

    match candidates.as_slice() {
        [only] => engine.inspect_container(&only.id).await,
        [] => Err(OrchestratorError::config(format!(
            "no container labelled '{}' found, salvage must run inside its own container",
            ROOT_LABEL
        ))),
        many => Err(OrchestratorError::config(format!(
            "found {} containers labelled '{}', expected exactly one",
            many.len(),
            ROOT_LABEL
        ))),
    }
}

/// Force remove crane containers left behind by a previous run
pub async fn cleanup_leftovers(engine: &dyn ContainerEngine) -> Result<usize> {
    let leftovers = engine
        .list_containers(&ContainerFilter::all_with_label(ENTITY_LABEL))
        .await?;

    for container in &leftovers {
        warn!(container = %container.id, "Removing leftover salvage container");
        engine.remove_container(&container.id, true).await?;
    }
    Ok(leftovers.len())
}

/// Volumes assigned to `tide`, in discovery order without duplicates
pub async fn tide_volumes(engine: &dyn ContainerEngine, tide: &str) -> Result<Vec<Volume>> {
    let label = format!("{}{}", TIDE_VOLUMES_PREFIX, tide);
    let containers = engine
        .list_containers(&ContainerFilter::all_with_label(&label))
        .await?;

    let mut volumes: Vec<Volume> = Vec::new();
    for container in containers {
        let Some(list) = container.labels.get(&label) else {
            continue;
        };
        let project = container.labels.get(COMPOSE_PROJECT_LABEL);

        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let info = match name.strip_prefix(GLOBAL_VOLUME_PREFIX) {
                Some(global) => engine.inspect_volume(global).await?,
                None => match project {
                    Some(project) => project_volume(engine, project, name).await?,
                    None => {
                        warn!(
                            container = %container.id,
                            volume = %name,
                            "Container is not part of a compose project, use '{}{}' for global volumes",
                            GLOBAL_VOLUME_PREFIX,
                            name
                        );
                        continue;
                    }
                },
            };

            if volumes.iter().any(|v| v.name == info.name) {
                continue;
            }
            debug!(tide = %tide, volume = %info.name, "Discovered volume");
            volumes.push(volume_from_info(info));
        }
    }

    info!(tide = %tide, count = volumes.len(), "Discovered tide volumes");
    Ok(volumes)
}

/// Resolve a compose-local volume name, exactly one match is accepted
async fn project_volume(
    engine: &dyn ContainerEngine,
    project: &str,
    name: &str,
) -> Result<VolumeInfo> {
    let filters = vec![
        format!("{}={}", COMPOSE_PROJECT_LABEL, project),
        format!("{}={}", COMPOSE_VOLUME_LABEL, name),
    ];
    let mut found = engine.list_volumes(&filters).await?;
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(OrchestratorError::not_found(
            "Volume",
            format!("{} (project {})", name, project),
        )),
        n => Err(OrchestratorError::config(format!(
            "volume '{}' of project '{}' is ambiguous, {} volumes match",
            name, project, n
        ))),
    }
}

fn volume_from_info(info: VolumeInfo) -> Volume {
    let dry_run = info.labels.get(DRY_RUN_LABEL).is_some_and(|v| parse_flag(v));
    Volume {
        name: info.name.clone(),
        meta: VolumeMeta {
            name: info.name,
            labels: info.labels,
            driver: info.driver,
            driver_options: info.options,
        },
        dry_run,
    }
}

/// Running containers mounting any of `volumes`, excluding salvage itself
pub async fn tide_containers(
    engine: &dyn ContainerEngine,
    volumes: &[Volume],
    own_container_id: &str,
) -> Result<Vec<Container>> {
    if volumes.is_empty() {
        return Ok(Vec::new());
    }

    let filter = ContainerFilter::mounting(volumes.iter().map(|v| v.name.clone()));
    let summaries = engine.list_containers(&filter).await?;

    let mut containers = Vec::with_capacity(summaries.len());
    for summary in summaries {
        if summary.id == own_container_id {
            continue;
        }
        let info = engine.inspect_container(&summary.id).await?;
        let container = container_from_info(&info, volumes)?;
        debug!(
            container = %container.name,
            action = %container.action,
            volumes = ?container.volumes,
            "Discovered affected container"
        );
        containers.push(container);
    }
    Ok(containers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{labelled, mounting, running, volume, FakeEngine};

    fn compose_volume(project: &str, name: &str) -> VolumeInfo {
        let mut info = volume(&format!("{}_{}", project, name));
        info.labels
            .insert(COMPOSE_PROJECT_LABEL.to_string(), project.to_string());
        info.labels
            .insert(COMPOSE_VOLUME_LABEL.to_string(), name.to_string());
        info
    }

    #[tokio::test]
    async fn test_own_container_must_be_unique() {
        let engine = FakeEngine::new();
        assert!(own_container(&engine).await.is_err());

        let engine = engine.with_container(labelled(running("self"), ROOT_LABEL, "true"));
        assert_eq!(own_container(&engine).await.unwrap().id, "self");

        let engine = engine.with_container(labelled(running("other"), ROOT_LABEL, "true"));
        assert!(own_container(&engine).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_leftovers() {
        let mut stopped = labelled(running("old-crane"), ENTITY_LABEL, "crane");
        stopped.state.running = false;
        let engine = FakeEngine::new()
            .with_container(stopped)
            .with_container(running("app"));

        assert_eq!(cleanup_leftovers(&engine).await.unwrap(), 1);
        assert_eq!(engine.events(), vec!["remove:old-crane:true"]);
    }

    #[tokio::test]
    async fn test_tide_volumes_resolution() {
        let mut shared = volume("shared");
        shared.labels.insert(DRY_RUN_LABEL.to_string(), "True".to_string());

        let app = labelled(running("app"), COMPOSE_PROJECT_LABEL, "shop");
        let app = labelled(app, "salvage.tide.nightly", "data, db,g:shared");
        let loose = labelled(running("loose"), "salvage.tide.nightly", "data,g:shared");
        let other = labelled(running("other"), "salvage.tide.weekly", "g:shared");

        let engine = FakeEngine::new()
            .with_container(app)
            .with_container(loose)
            .with_container(other)
            .with_volume(compose_volume("shop", "data"))
            .with_volume(compose_volume("shop", "db"))
            .with_volume(compose_volume("blog", "data"))
            .with_volume(shared);

        let volumes = tide_volumes(&engine, "nightly").await.unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();

        assert_eq!(names, vec!["shop_data", "shop_db", "shared"]);
        assert!(volumes[2].dry_run);
        assert!(!volumes[0].dry_run);
        assert_eq!(volumes[0].meta.labels[COMPOSE_PROJECT_LABEL], "shop");
    }

    #[tokio::test]
    async fn test_missing_project_volume_fails() {
        let app = labelled(running("app"), COMPOSE_PROJECT_LABEL, "shop");
        let app = labelled(app, "salvage.tide.nightly", "missing");
        let engine = FakeEngine::new().with_container(app);

        let err = tide_volumes(&engine, "nightly").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_tide_containers_skip_self_and_unrelated() {
        let engine = FakeEngine::new()
            .with_container(mounting(running("self"), &["v1"]))
            .with_container(mounting(running("app"), &["v1", "other"]))
            .with_container(mounting(running("db"), &["v2"]))
            .with_container(running("idle"));
        let volumes = vec![Volume::new("v1"), Volume::new("v2")];

        let containers = tide_containers(&engine, &volumes, "self").await.unwrap();
        let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();

        assert_eq!(ids, vec!["app", "db"]);
        assert_eq!(containers[0].volumes, vec!["v1".to_string()]);
        assert!(tide_containers(&engine, &[], "self").await.unwrap().is_empty());
    }
}
