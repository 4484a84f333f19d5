//! Pre- and post-commands executed inside containers
//!
//! Commands run through `sh -c` as the configured user, inherit the container
//! environment and are judged by their exit code policy.

use crate::engine::ContainerEngine;
use crate::error::{OrchestratorError, Result};
use salvage_core::{Container, ContainerCommand};
use tracing::{debug, trace};

/// Run `command` inside the running `container`
///
/// Returns the exit code if the policy accepts it.
pub async fn run_command(
    engine: &dyn ContainerEngine,
    container: &Container,
    command: &ContainerCommand,
) -> Result<i64> {
    let info = engine.inspect_container(&container.id).await?;
    let argv = vec!["sh".to_string(), "-c".to_string(), command.command.clone()];

    debug!(
        container = %container.name,
        command = %command.command,
        user = ?command.user,
        "Running container command"
    );

    let mut sink = |line: &str| {
        trace!(container = %container.name, "[exec] {}", line.trim());
    };
    let exit_code = engine
        .exec(
            &container.id,
            &argv,
            command.user.as_deref(),
            info.privileged,
            &mut sink,
        )
        .await?;

    if !command.policy.accepts(exit_code) {
        return Err(OrchestratorError::Command {
            container: container.name.clone(),
            command: command.command.clone(),
            exit_code,
        });
    }

    debug!(container = %container.name, exit_code, "Container command finished");
    Ok(exit_code)
}
