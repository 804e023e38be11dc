//! Container runtime backed by the docker CLI

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::deploy::compose::{self, ComposeCommand};
use crate::deploy::process::{run_command, run_command_unchecked, CommandSpec, LineSink};
use crate::deploy::runtime::{
    ComposeProject, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStats,
    ContainerSummary, ImageBuild,
};
use crate::errors::BotError;
use crate::storage::settings::TimeoutSettings;

/// `docker` invocations, one subprocess per call
pub struct DockerCli {
    timeouts: TimeoutSettings,
    compose: OnceCell<ComposeCommand>,
}

impl DockerCli {
    pub fn new(timeouts: TimeoutSettings) -> Self {
        Self {
            timeouts,
            compose: OnceCell::new(),
        }
    }

    fn docker(&self, timeout: Duration) -> CommandSpec {
        CommandSpec::new("docker")
            .timeout(timeout)
            .kill_grace(self.timeouts.kill_grace())
    }

    fn quick(&self) -> CommandSpec {
        self.docker(self.timeouts.quick())
    }

    async fn compose_command(&self) -> ComposeCommand {
        *self
            .compose
            .get_or_init(|| ComposeCommand::detect(self.timeouts.quick()))
            .await
    }
}

/// Arguments of `docker create` for `spec`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if let Some(hostname) = &spec.hostname {
        args.extend(["--hostname".to_string(), hostname.clone()]);
    }
    if let Some(restart) = &spec.restart {
        args.extend(["--restart".to_string(), restart.clone()]);
    }
    for (key, value) in &spec.env {
        args.extend(["--env".to_string(), format!("{}={}", key, value)]);
    }
    for (key, value) in &spec.labels {
        args.extend(["--label".to_string(), format!("{}={}", key, value)]);
    }
    for volume in &spec.volumes {
        args.extend(["--volume".to_string(), volume.clone()]);
    }
    for port in &spec.expose {
        args.extend(["--expose".to_string(), port.clone()]);
    }
    match (&spec.network_mode, spec.networks.first()) {
        (Some(mode), _) => args.extend(["--network".to_string(), mode.clone()]),
        (None, Some(network)) => {
            args.extend(["--network".to_string(), network.name.clone()]);
            for alias in &network.aliases {
                args.extend(["--network-alias".to_string(), alias.clone()]);
            }
        }
        (None, None) => {}
    }
    if let Some(entrypoint) = &spec.entrypoint {
        if let Some(first) = entrypoint.first() {
            args.extend(["--entrypoint".to_string(), first.clone()]);
        }
    }
    args.push(spec.image.clone());
    if let Some(entrypoint) = &spec.entrypoint {
        args.extend(entrypoint.iter().skip(1).cloned());
    }
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// Parse `docker ps --format '{{json .}}'` output
pub fn parse_ps_output(output: &str) -> Result<Vec<ContainerSummary>, BotError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let ps: PsLine = serde_json::from_str(line)?;
            let labels: BTreeMap<String, String> = ps
                .labels
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Ok(ContainerSummary {
                id: ps.id,
                name: ps.names.split(',').next().unwrap_or_default().to_string(),
                image: ps.image,
                state: ps.state,
                status: ps.status,
                labels,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct StatsLine {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

fn parse_stats_output(output: &str) -> Result<ContainerStats, BotError> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| BotError::Internal("docker stats returned no data".to_string()))?;
    let stats: StatsLine = serde_json::from_str(line)?;
    Ok(ContainerStats {
        container: stats.name,
        cpu_percent: stats.cpu,
        memory_usage: stats.mem_usage,
        memory_percent: stats.mem_perc,
        net_io: stats.net_io,
        block_io: stats.block_io,
        pids: stats.pids,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BotError> {
        debug!("Creating container {}", spec.name);
        let create = self.docker(self.timeouts.deploy()).args(create_args(spec));
        let output = run_command(&create, None).await?;
        let id = output.stdout.trim().to_string();

        if spec.network_mode.is_none() {
            for network in spec.networks.iter().skip(1) {
                let mut connect = self.quick().args(["network", "connect"]);
                for alias in &network.aliases {
                    connect = connect.args(["--alias", alias.as_str()]);
                }
                run_command(&connect.args([network.name.as_str(), id.as_str()]), None).await?;
            }
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), BotError> {
        run_command(&self.quick().args(["start", id]), None).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), BotError> {
        let grace = self.timeouts.kill_grace_secs.to_string();
        let spec = self
            .docker(self.timeouts.quick() + self.timeouts.kill_grace())
            .args(["stop", "-t", grace.as_str(), id]);
        run_command(&spec, None).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), BotError> {
        run_command(&self.quick().args(["rm", "-f", id]), None).await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BotError> {
        let filter_arg = match filter {
            ContainerFilter::Label { key, value } => format!("label={}={}", key, value),
            ContainerFilter::NamePrefix(prefix) => format!("name={}", prefix),
        };
        let spec = self.quick().args([
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            filter_arg.as_str(),
            "--format",
            "{{json .}}",
        ]);
        let output = run_command(&spec, None).await?;
        let mut containers = parse_ps_output(&output.stdout)?;
        // docker's name filter matches substrings
        if let ContainerFilter::NamePrefix(prefix) = filter {
            containers.retain(|c| c.name.starts_with(prefix.as_str()));
        }
        Ok(containers)
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<String, BotError> {
        let tail = tail.to_string();
        let spec = self.quick().args(["logs", "--tail", tail.as_str(), id]);
        let output = run_command(&spec, None).await?;
        // docker logs writes the container's stderr to our stderr
        let mut combined = output.stdout;
        combined.push_str(&output.stderr);
        Ok(combined)
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, BotError> {
        let spec = self
            .quick()
            .args(["stats", "--no-stream", "--format", "{{json .}}", id]);
        let output = run_command(&spec, None).await?;
        parse_stats_output(&output.stdout)
    }

    async fn build_image(
        &self,
        build: &ImageBuild,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        info!("Building image {}", build.tag);
        let mut spec = self
            .docker(self.timeouts.build())
            .args(["build", "--progress", "plain", "-t"])
            .arg(build.tag.clone())
            .arg("-f")
            .arg(build.dockerfile.display().to_string());
        if build.no_cache {
            spec = spec.arg("--no-cache");
        }
        let spec = spec
            .arg(build.context.display().to_string())
            .env("DOCKER_BUILDKIT", "1");
        run_command(&spec, sink).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str, sink: Option<&LineSink<'_>>) -> Result<(), BotError> {
        info!("Pulling image {}", image);
        let spec = self.docker(self.timeouts.build()).args(["pull", image]);
        run_command(&spec, sink).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, BotError> {
        let spec = self.quick().args(["image", "inspect", "--format", "{{.Id}}", image]);
        Ok(run_command_unchecked(&spec, None).await?.success())
    }

    async fn remove_image(&self, image: &str) -> Result<(), BotError> {
        run_command(&self.quick().args(["rmi", "-f", image]), None).await?;
        Ok(())
    }

    async fn list_volumes(&self, prefix: &str) -> Result<Vec<String>, BotError> {
        let filter = format!("name={}", prefix);
        let spec = self.quick().args([
            "volume",
            "ls",
            "--filter",
            filter.as_str(),
            "--format",
            "{{.Name}}",
        ]);
        let output = run_command(&spec, None).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), BotError> {
        run_command(&self.quick().args(["volume", "rm", "-f", name]), None).await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), BotError> {
        let inspect = self.quick().args(["network", "inspect", name]);
        if run_command_unchecked(&inspect, None).await?.success() {
            return Ok(());
        }
        info!("Creating network {}", name);
        let create = self
            .quick()
            .args(["network", "create", "--driver", "bridge", name]);
        run_command(&create, None).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BotError> {
        run_command(&self.quick().args(["network", "rm", name]), None).await?;
        Ok(())
    }

    async fn compose_up(
        &self,
        project: &ComposeProject,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        let command = self.compose_command().await;
        compose::compose_up(
            command,
            project,
            self.timeouts.deploy(),
            self.timeouts.kill_grace(),
            sink,
        )
        .await
    }

    async fn compose_down(
        &self,
        project: &ComposeProject,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        let command = self.compose_command().await;
        compose::compose_down(
            command,
            project,
            self.timeouts.deploy(),
            self.timeouts.kill_grace(),
            sink,
        )
        .await
    }
}
