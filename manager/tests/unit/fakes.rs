//! In-memory stand-ins for the container runtime and git

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use botyard::buildlog::LogCollector;
use botyard::compose::document::ComposeDocument;
use botyard::deploy::executor::{BotExecutor, ExecutorParts};
use botyard::deploy::git::{AheadBehind, RepoInfo, Repository};
use botyard::deploy::process::LineSink;
use botyard::deploy::runtime::{
    ComposeProject, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStats,
    ContainerSummary, ImageBuild, COMPOSE_PROJECT_LABEL,
};
use botyard::detect::FileDetector;
use botyard::errors::BotError;
use botyard::platform::DeploymentTarget;
use botyard::storage::bots::BotStore;
use botyard::storage::credentials::MemoryCredentialStore;
use botyard::storage::layout::StorageLayout;
use botyard::storage::settings::{PlatformSettings, TimeoutSettings};

#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    pub containers: Mutex<BTreeMap<String, ContainerSummary>>,
    pub images: Mutex<BTreeSet<String>>,
    pub networks: Mutex<BTreeSet<String>>,
    pub builds: Mutex<Vec<ImageBuild>>,
    pub removal_attempts: Mutex<Vec<String>>,
    /// Ids whose removal fails
    pub failing_removals: Mutex<BTreeSet<String>>,
    pub compose_ups: Mutex<Vec<ComposeProject>>,
}

impl FakeRuntime {
    pub fn insert(&self, name: &str, image: &str, labels: &[(String, String)], state: &str) -> String {
        let id = format!("c{:03}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            ContainerSummary {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                state: state.to_string(),
                status: state.to_string(),
                labels: labels.iter().cloned().collect(),
            },
        );
        id
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn set_state(&self, id: &str, state: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.state = state.to_string();
        }
    }
}

fn missing(id: &str) -> BotError {
    BotError::ToolError {
        program: "docker".to_string(),
        code: Some(1),
        stderr: format!("No such container: {}", id),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BotError> {
        Ok(self.insert(&spec.name, &spec.image, &spec.labels, "created"))
    }

    async fn start_container(&self, id: &str) -> Result<(), BotError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), BotError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.state = "exited".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), BotError> {
        self.removal_attempts.lock().unwrap().push(id.to_string());
        if self.failing_removals.lock().unwrap().contains(id) {
            return Err(BotError::ToolError {
                program: "docker".to_string(),
                code: Some(1),
                stderr: "device or resource busy".to_string(),
            });
        }
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| missing(id))
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BotError> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .values()
            .filter(|c| match filter {
                ContainerFilter::Label { key, value } => c.labels.get(key) == Some(value),
                ContainerFilter::NamePrefix(prefix) => c.name.starts_with(prefix.as_str()),
            })
            .cloned()
            .collect())
    }

    async fn container_logs(&self, id: &str, _tail: usize) -> Result<String, BotError> {
        Ok(format!("output of {}\n", id))
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, BotError> {
        Ok(ContainerStats {
            container: id.to_string(),
            cpu_percent: "0.50%".to_string(),
            ..Default::default()
        })
    }

    async fn build_image(
        &self,
        build: &ImageBuild,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        if let Some(sink) = sink {
            sink("#1 building");
        }
        self.builds.lock().unwrap().push(build.clone());
        self.images.lock().unwrap().insert(build.tag.clone());
        Ok(())
    }

    async fn pull_image(&self, image: &str, _sink: Option<&LineSink<'_>>) -> Result<(), BotError> {
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, BotError> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), BotError> {
        self.images.lock().unwrap().remove(image);
        Ok(())
    }

    async fn list_volumes(&self, _prefix: &str) -> Result<Vec<String>, BotError> {
        Ok(Vec::new())
    }

    async fn remove_volume(&self, _name: &str) -> Result<(), BotError> {
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), BotError> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BotError> {
        self.networks.lock().unwrap().remove(name);
        Ok(())
    }

    async fn compose_up(
        &self,
        project: &ComposeProject,
        _sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        let text = tokio::fs::read_to_string(&project.file).await?;
        let document = ComposeDocument::parse(&text)?;
        for spec in document.service_specs()? {
            let name = format!("{}-{}-1", project.name, spec.name);
            let image = spec.image.clone().unwrap_or_default();
            let mut labels = spec.labels.clone();
            labels.push((COMPOSE_PROJECT_LABEL.to_string(), project.name.clone()));
            self.insert(&name, &image, &labels, "running");
        }
        self.compose_ups.lock().unwrap().push(project.clone());
        Ok(())
    }

    async fn compose_down(
        &self,
        project: &ComposeProject,
        _sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        self.containers.lock().unwrap().retain(|_, c| {
            c.labels.get(COMPOSE_PROJECT_LABEL) != Some(&project.name)
        });
        Ok(())
    }
}

/// Repository whose clones contain a fixed set of files
#[derive(Default)]
pub struct FakeRepo {
    pub files: Mutex<BTreeMap<String, String>>,
    pub pulls: AtomicUsize,
}

impl FakeRepo {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: Mutex::new(
                files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            pulls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Repository for FakeRepo {
    async fn clone_repo(
        &self,
        _url: &str,
        _branch: &str,
        target: &Path,
        _sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        tokio::fs::create_dir_all(target).await?;
        let files = self.files.lock().unwrap().clone();
        for (name, contents) in files {
            tokio::fs::write(target.join(name), contents).await?;
        }
        Ok(())
    }

    async fn pull(
        &self,
        _dir: &Path,
        _branch: &str,
        _sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn info(&self, _dir: &Path) -> Result<RepoInfo, BotError> {
        Ok(RepoInfo {
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            commit_message: "initial".to_string(),
            commit_author: "dev".to_string(),
            commit_date: "2026-01-01T00:00:00Z".to_string(),
        })
    }

    async fn ahead_behind(&self, _dir: &Path) -> Result<AheadBehind, BotError> {
        Ok(AheadBehind { ahead: 0, behind: 2 })
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub executor: Arc<BotExecutor>,
    pub runtime: Arc<FakeRuntime>,
    pub repo: Arc<FakeRepo>,
    pub layout: StorageLayout,
    pub platform: PlatformSettings,
}

pub async fn harness(target: DeploymentTarget, repo: FakeRepo) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path().join("state"));
    layout.setup().await.unwrap();

    let platform = PlatformSettings {
        data_root: tmp.path().join("data"),
        metadata_root: tmp.path().join("apps"),
        ..Default::default()
    };
    let runtime = Arc::new(FakeRuntime::default());
    let repo = Arc::new(repo);

    let executor = BotExecutor::new(ExecutorParts {
        store: Arc::new(BotStore::new(layout.registry_file())),
        layout: layout.clone(),
        logs: Arc::new(LogCollector::default()),
        runtime: runtime.clone(),
        repo: repo.clone(),
        detector: Arc::new(FileDetector),
        credentials: MemoryCredentialStore::new(),
        platform: platform.clone(),
        timeouts: TimeoutSettings::default(),
        target,
    });

    Harness {
        tmp,
        executor: Arc::new(executor),
        runtime,
        repo,
        layout,
        platform,
    }
}
