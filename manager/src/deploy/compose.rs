//! Docker Compose invocation

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::process::{run_command, run_command_unchecked, CommandSpec, LineSink};
use crate::deploy::runtime::ComposeProject;
use crate::errors::BotError;

/// Which compose front-end the host provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeCommand {
    /// `docker compose`
    Plugin,
    /// `docker-compose`
    Standalone,
}

impl ComposeCommand {
    /// Prefer the plugin, fall back to the standalone binary
    pub async fn detect(timeout: Duration) -> Self {
        let plugin = CommandSpec::new("docker")
            .args(["compose", "version"])
            .timeout(timeout);
        match run_command_unchecked(&plugin, None).await {
            Ok(output) if output.success() => {
                debug!("Using docker compose plugin");
                return ComposeCommand::Plugin;
            }
            _ => {}
        }

        let standalone = CommandSpec::new("docker-compose")
            .arg("version")
            .timeout(timeout);
        match run_command_unchecked(&standalone, None).await {
            Ok(output) if output.success() => {
                debug!("Using standalone docker-compose");
                ComposeCommand::Standalone
            }
            _ => {
                warn!("No compose front-end found, assuming docker compose plugin");
                ComposeCommand::Plugin
            }
        }
    }

    /// Command for `args` against `project`
    pub fn command<I, S>(&self, project: &ComposeProject, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let base = match self {
            ComposeCommand::Plugin => CommandSpec::new("docker").arg("compose"),
            ComposeCommand::Standalone => CommandSpec::new("docker-compose"),
        };
        let mut spec = base
            .arg("-p")
            .arg(project.name.clone())
            .arg("-f")
            .arg(project.file.display().to_string())
            .args(args);
        if let Some(dir) = project.file.parent() {
            spec = spec.current_dir(dir);
        }
        spec
    }
}

/// `up -d` for a project
pub async fn compose_up(
    compose: ComposeCommand,
    project: &ComposeProject,
    timeout: Duration,
    kill_grace: Duration,
    sink: Option<&LineSink<'_>>,
) -> Result<(), BotError> {
    info!("Deploying compose project {}", project.name);
    if tokio::fs::metadata(&project.file).await.is_err() {
        return Err(BotError::NotFound(format!(
            "Compose file does not exist: {}",
            project.file.display()
        )));
    }
    let spec = compose
        .command(project, ["up", "-d", "--remove-orphans"])
        .timeout(timeout)
        .kill_grace(kill_grace);
    run_command(&spec, sink).await?;
    info!("Compose project {} is up", project.name);
    Ok(())
}

/// `down --remove-orphans` for a project
pub async fn compose_down(
    compose: ComposeCommand,
    project: &ComposeProject,
    timeout: Duration,
    kill_grace: Duration,
    sink: Option<&LineSink<'_>>,
) -> Result<(), BotError> {
    info!("Tearing down compose project {}", project.name);
    let spec = compose
        .command(project, ["down", "--remove-orphans"])
        .timeout(timeout)
        .kill_grace(kill_grace);
    run_command(&spec, sink).await?;
    Ok(())
}
