//! Container runtime capability

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deploy::process::LineSink;
use crate::errors::BotError;

/// A network a container joins, with the aliases it answers to there
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub name: String,
    pub aliases: Vec<String>,
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    /// `source:target[:mode]` mounts
    pub volumes: Vec<String>,
    pub expose: Vec<String>,
    /// First entry is used at creation, the rest are connected afterwards
    pub networks: Vec<NetworkAttachment>,
    pub network_mode: Option<String>,
    pub restart: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
}

/// Listed container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    /// `running`, `exited`, `created`, ...
    pub state: String,
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// One-shot resource usage of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container: String,
    pub cpu_percent: String,
    pub memory_usage: String,
    pub memory_percent: String,
    pub net_io: String,
    pub block_io: String,
    pub pids: String,
}

/// Label compose puts on every container of a project
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Which containers to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFilter {
    /// Label equal to a value
    Label { key: String, value: String },
    /// Names starting with the prefix
    NamePrefix(String),
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuild {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
    pub no_cache: bool,
}

/// A compose project on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub file: PathBuf,
}

/// Operations the manager needs from the container engine.
///
/// Implementations run each call as an isolated, time-limited invocation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BotError>;

    async fn start_container(&self, id: &str) -> Result<(), BotError>;

    async fn stop_container(&self, id: &str) -> Result<(), BotError>;

    /// Remove a container, stopping it first if needed
    async fn remove_container(&self, id: &str) -> Result<(), BotError>;

    /// Containers in any state matching `filter`
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BotError>;

    /// Last `tail` lines of a container's output
    async fn container_logs(&self, id: &str, tail: usize) -> Result<String, BotError>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, BotError>;

    async fn build_image(
        &self,
        build: &ImageBuild,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError>;

    async fn pull_image(&self, image: &str, sink: Option<&LineSink<'_>>) -> Result<(), BotError>;

    async fn image_exists(&self, image: &str) -> Result<bool, BotError>;

    async fn remove_image(&self, image: &str) -> Result<(), BotError>;

    /// Volume names starting with `prefix`
    async fn list_volumes(&self, prefix: &str) -> Result<Vec<String>, BotError>;

    async fn remove_volume(&self, name: &str) -> Result<(), BotError>;

    /// Create a bridge network unless it exists
    async fn ensure_network(&self, name: &str) -> Result<(), BotError>;

    async fn remove_network(&self, name: &str) -> Result<(), BotError>;

    async fn compose_up(
        &self,
        project: &ComposeProject,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError>;

    async fn compose_down(
        &self,
        project: &ComposeProject,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError>;
}
