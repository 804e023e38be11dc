//! Direct container deployment of a transformed compose document

use std::collections::{BTreeMap, HashSet};

use serde_yaml::Value;
use tracing::debug;

use crate::buildlog::BuildLog;
use crate::compose::document::ComposeDocument;
use crate::compose::schema::{ServiceSpec, VolumeEntry};
use crate::deploy::runtime::{
    ContainerFilter, ContainerRuntime, ContainerSpec, NetworkAttachment, COMPOSE_PROJECT_LABEL,
};
use crate::errors::BotError;

/// Per-app bridge network every service joins
pub fn app_network(app_id: &str) -> String {
    format!("{}_default", app_id)
}

/// Container name of a service, prefixed by the app id
pub fn container_name(app_id: &str, service: &str) -> String {
    format!("{}-{}-1", app_id, service)
}

/// Named volume of an app, prefixed by the app id
pub fn volume_name(app_id: &str, volume: &str) -> String {
    format!("{}_{}", app_id, volume)
}

/// Services ordered so dependencies come first
pub fn start_order(specs: &[ServiceSpec]) -> Result<Vec<String>, BotError> {
    let by_name: BTreeMap<&str, &ServiceSpec> =
        specs.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut order = Vec::with_capacity(specs.len());
    let mut done = HashSet::new();
    let mut visiting = HashSet::new();

    fn visit<'a>(
        name: &'a str,
        by_name: &BTreeMap<&'a str, &'a ServiceSpec>,
        done: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), BotError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(BotError::ComposeError(format!(
                "dependency cycle through service '{}'",
                name
            )));
        }
        let spec: &'a ServiceSpec = by_name
            .get(name)
            .copied()
            .ok_or_else(|| BotError::ComposeError(format!("unknown service '{}'", name)))?;
        for dependency in &spec.depends_on {
            visit(dependency, by_name, done, visiting, order)?;
        }
        visiting.remove(name);
        done.insert(name);
        order.push(name.to_string());
        Ok(())
    }

    for spec in specs {
        visit(&spec.name, &by_name, &mut done, &mut visiting, &mut order)?;
    }
    Ok(order)
}

/// Networks and containers to create for one app
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandalonePlan {
    pub networks: Vec<String>,
    pub containers: Vec<ContainerSpec>,
}

fn external_networks(document: &ComposeDocument) -> HashSet<String> {
    document
        .root()
        .get("networks")
        .and_then(Value::as_mapping)
        .map(|networks| {
            networks
                .iter()
                .filter(|(_, def)| {
                    def.get("external").and_then(Value::as_bool).unwrap_or(false)
                })
                .filter_map(|(name, _)| name.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn volume_arg(app_id: &str, volume: &VolumeEntry) -> String {
    let source = match (volume.source(), volume.named_volume()) {
        (Some(_), Some(named)) => Some(volume_name(app_id, named)),
        (Some(source), None) => Some(source.to_string()),
        (None, _) => None,
    };
    let mut arg = match source {
        Some(source) => format!("{}:{}", source, volume.target()),
        None => volume.target().to_string(),
    };
    if let VolumeEntry::Short { mode: Some(mode), .. } = volume {
        arg.push(':');
        arg.push_str(mode);
    } else if volume.read_only() {
        arg.push_str(":ro");
    }
    arg
}

/// Translate the document into container specs in dependency order
pub fn plan(document: &ComposeDocument, app_id: &str) -> Result<StandalonePlan, BotError> {
    let specs = document.service_specs()?;
    let order = start_order(&specs)?;
    let external = external_networks(document);

    let default_network = app_network(app_id);
    let mut networks = vec![default_network.clone()];
    let mut containers = Vec::with_capacity(specs.len());

    for name in order {
        let Some(spec) = specs.iter().find(|s| s.name == name) else {
            continue;
        };
        let image = spec.image.clone().ok_or_else(|| {
            BotError::ComposeError(format!("service '{}' has no image to run", name))
        })?;

        let mut attachments = Vec::new();
        if spec.network_mode.is_none() {
            let aliases = vec![spec.name.clone()];
            let declared: Vec<&str> = if spec.networks.is_empty() {
                vec!["default"]
            } else {
                spec.networks.iter().map(String::as_str).collect()
            };
            for network in declared {
                let resolved = if network == "default" {
                    default_network.clone()
                } else if external.contains(network) {
                    network.to_string()
                } else {
                    format!("{}_{}", app_id, network)
                };
                if !networks.contains(&resolved) {
                    networks.push(resolved.clone());
                }
                attachments.push(NetworkAttachment {
                    name: resolved,
                    aliases: aliases.clone(),
                });
            }
        }

        let env = spec
            .environment
            .pairs()
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();

        let mut labels = spec.labels.clone();
        labels.retain(|(k, _)| k != COMPOSE_PROJECT_LABEL);
        labels.push((COMPOSE_PROJECT_LABEL.to_string(), app_id.to_string()));

        containers.push(ContainerSpec {
            name: container_name(app_id, &spec.name),
            image,
            hostname: spec.hostname.clone(),
            env,
            labels,
            volumes: spec.volumes.iter().map(|v| volume_arg(app_id, v)).collect(),
            expose: spec.expose.clone(),
            networks: attachments,
            network_mode: spec.network_mode.clone(),
            restart: spec.restart.clone(),
            entrypoint: spec.entrypoint.as_ref().map(|e| e.argv()),
            command: spec.command.as_ref().map(|c| c.argv()).unwrap_or_default(),
        });
    }

    Ok(StandalonePlan {
        networks,
        containers,
    })
}

/// Create and start every planned container, returning their ids
pub async fn deploy(
    runtime: &dyn ContainerRuntime,
    plan: &StandalonePlan,
    log: &BuildLog,
) -> Result<Vec<String>, BotError> {
    for network in &plan.networks {
        runtime.ensure_network(network).await?;
    }

    let sink = |line: &str| log.info(line);
    let mut ids = Vec::with_capacity(plan.containers.len());
    for spec in &plan.containers {
        let stale = runtime
            .list_containers(&ContainerFilter::NamePrefix(spec.name.clone()))
            .await?;
        for container in stale.iter().filter(|c| c.name == spec.name) {
            debug!("Removing stale container {}", container.name);
            runtime.remove_container(&container.id).await?;
        }

        if !runtime.image_exists(&spec.image).await? {
            log.info(format!("Pulling {}", spec.image));
            runtime.pull_image(&spec.image, Some(&sink)).await?;
        }

        log.info(format!("Creating container {}", spec.name));
        let id = runtime.create_container(spec).await?;
        runtime.start_container(&id).await?;
        ids.push(id);
    }
    Ok(ids)
}

/// Stop and remove each container, continuing past failures.
///
/// Returns how many could not be removed.
pub async fn teardown(runtime: &dyn ContainerRuntime, ids: &[String], log: &BuildLog) -> usize {
    let mut failed = 0;
    for id in ids {
        if let Err(e) = runtime.stop_container(id).await {
            log.warning(format!("Failed to stop container {}: {}", short(id), e));
        }
        if let Err(e) = runtime.remove_container(id).await {
            log.warning(format!("Failed to remove container {}: {}", short(id), e));
            failed += 1;
        }
    }
    failed
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
