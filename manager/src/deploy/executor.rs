//! Bot build/deploy executor

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::buildlog::{BuildLog, LogCollector};
use crate::compose::document::{find_compose_file, ComposeDocument};
use crate::compose::generate::generate_document;
use crate::compose::schema::BuildSpec;
use crate::compose::transform::{apply_all, resolve_app_id, TransformContext, LABEL_BOT_ID};
use crate::compose::variables::{
    build_variables, ensure_identity_tokens, substitute_document, validate_required,
};
use crate::deploy::fsm::{transition, BotEvent};
use crate::deploy::git::Repository;
use crate::deploy::runtime::{
    ComposeProject, ContainerFilter, ContainerRuntime, ContainerSummary, ImageBuild,
    COMPOSE_PROJECT_LABEL,
};
use crate::deploy::standalone;
use crate::detect::{default_dockerfile, SourceDetector};
use crate::errors::BotError;
use crate::models::bot::{default_app_id, BotConfig, BotSource, BotStatus, DetectedSource};
use crate::platform::casaos::RegistryProcessor;
use crate::platform::DeploymentTarget;
use crate::storage::bots::BotStore;
use crate::storage::credentials::CredentialStore;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{PlatformSettings, TimeoutSettings};

/// Uniform result of a lifecycle operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl From<Result<(), BotError>> for OperationOutcome {
    fn from(result: Result<(), BotError>) -> Self {
        match result {
            Ok(()) => OperationOutcome::ok(),
            Err(e) => OperationOutcome::failure(e.to_string()),
        }
    }
}

/// Per-bot leases serialising lifecycle operations on the same bot
#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OperationLocks {
    fn lock_for(&self, bot_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(bot_id.to_string()).or_default().clone()
    }

    /// Wait for the bot's lease
    pub async fn acquire(&self, bot_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(bot_id).lock_owned().await
    }

    /// The bot's lease if nobody holds it
    pub fn try_acquire(&self, bot_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(bot_id).try_lock_owned().ok()
    }

    pub fn forget(&self, bot_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(bot_id);
    }
}

/// Build flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Build the image from scratch
    pub no_cache: bool,
    /// Fetch the latest source and drop the cached image first
    pub refresh_source: bool,
}

/// Collaborators of the executor
pub struct ExecutorParts {
    pub store: Arc<BotStore>,
    pub layout: StorageLayout,
    pub logs: Arc<LogCollector>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub repo: Arc<dyn Repository>,
    pub detector: Arc<dyn SourceDetector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub platform: PlatformSettings,
    pub timeouts: TimeoutSettings,
    pub target: DeploymentTarget,
}

/// Drives bots through build, start and stop
pub struct BotExecutor {
    pub(crate) store: Arc<BotStore>,
    pub(crate) layout: StorageLayout,
    pub(crate) logs: Arc<LogCollector>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) detector: Arc<dyn SourceDetector>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) platform: PlatformSettings,
    pub(crate) target: DeploymentTarget,
    pub(crate) registry: RegistryProcessor,
    pub(crate) locks: OperationLocks,
    /// Held while an app id is chosen and claimed
    app_ids: tokio::sync::Mutex<()>,
}

impl BotExecutor {
    pub fn new(parts: ExecutorParts) -> Self {
        let registry = RegistryProcessor::new(parts.platform.clone(), parts.timeouts.clone());
        Self {
            store: parts.store,
            layout: parts.layout,
            logs: parts.logs,
            runtime: parts.runtime,
            repo: parts.repo,
            detector: parts.detector,
            credentials: parts.credentials,
            platform: parts.platform,
            target: parts.target,
            registry,
            locks: OperationLocks::default(),
            app_ids: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<BotStore> {
        &self.store
    }

    pub fn logs(&self) -> &Arc<LogCollector> {
        &self.logs
    }

    pub fn target(&self) -> DeploymentTarget {
        self.target
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    // =============================== OPERATIONS ================================== //

    /// Build the bot's compose document and, when it has a build target, its image
    pub async fn build(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let log = self.logs.get(bot_id);
        log.clear();
        self.run_build(bot_id, &log, BuildOptions::default())
            .await
            .into()
    }

    /// Deploy the bot, building first when no compose document exists yet
    pub async fn start(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let log = self.logs.get(bot_id);
        log.clear();
        self.run_start(bot_id, &log).await.into()
    }

    /// Tear the bot's containers down
    pub async fn stop(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let log = self.logs.get(bot_id);
        self.run_stop(bot_id, &log).await.into()
    }

    /// Stop if running, then start
    pub async fn restart(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let log = self.logs.get(bot_id);
        log.clear();
        let result: Result<(), BotError> = async {
            let bot = self.store.require(bot_id).await?;
            if bot.status == BotStatus::Running || bot.status == BotStatus::Error {
                self.run_stop(bot_id, &log).await?;
            }
            self.run_start(bot_id, &log).await
        }
        .await;
        result.into()
    }

    /// Fetch the latest source, rebuild from scratch and restore the running state
    pub async fn pull_rebuild(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let log = self.logs.get(bot_id);
        log.clear();
        let result: Result<(), BotError> = async {
            let bot = self.store.require(bot_id).await?;
            let was_running = bot.status == BotStatus::Running;
            if was_running {
                log.system("Stopping bot before rebuilding");
                self.run_stop(bot_id, &log).await?;
            }
            self.run_build(
                bot_id,
                &log,
                BuildOptions {
                    no_cache: true,
                    refresh_source: true,
                },
            )
            .await?;
            if was_running {
                self.run_start(bot_id, &log).await?;
            }
            Ok(())
        }
        .await;
        result.into()
    }

    // ================================ BUILD ====================================== //

    pub(crate) async fn run_build(
        &self,
        bot_id: &str,
        log: &BuildLog,
        options: BuildOptions,
    ) -> Result<(), BotError> {
        let bot = self.store.require(bot_id).await?;
        self.begin(&bot, BotEvent::Build, log)?;
        let bot = self.advance(bot_id, BotEvent::Build, |_| {}).await?;
        log.system(format!("Build started for {}", bot.name));

        match self.build_steps(&bot, log, options).await {
            Ok(app_id) => {
                self.advance(bot_id, BotEvent::BuildSucceeded, |_| {})
                    .await?;
                log.success(format!("Build complete for {}", app_id));
                Ok(())
            }
            Err(e) => {
                self.mark_failed(bot_id, log, &e).await;
                Err(e)
            }
        }
    }

    async fn build_steps(
        &self,
        bot: &BotConfig,
        log: &BuildLog,
        options: BuildOptions,
    ) -> Result<String, BotError> {
        let sink = |line: &str| log.info(line);
        let repo_dir = self.layout.repo_dir(&bot.id);
        let bot_dir = self.layout.bot_dir(&bot.id);
        bot_dir.create().await?;

        // Source
        let mut detected: Option<DetectedSource> = None;
        match &bot.source {
            BotSource::Git { url, branch } => {
                if !repo_dir.exists().await {
                    log.info(format!("Cloning {} ({})", url, branch));
                    self.repo
                        .clone_repo(url, branch, repo_dir.path(), Some(&sink))
                        .await?;
                } else if options.refresh_source {
                    log.info(format!("Pulling latest changes on {}", branch));
                    self.repo.pull(repo_dir.path(), branch, Some(&sink)).await?;
                }
                let found = self.detector.detect(repo_dir.path()).await?;
                log.info(format!(
                    "Detected language: {}{}",
                    found.language.as_deref().unwrap_or("unknown"),
                    if found.has_database { ", uses a database" } else { "" }
                ));
                detected = Some(found);
            }
            BotSource::Image { image_ref } => {
                if options.refresh_source {
                    log.info(format!("Pulling {}", image_ref));
                    self.runtime.pull_image(image_ref, Some(&sink)).await?;
                }
            }
        }

        if options.refresh_source && bot.is_git() {
            let tag = bot.image_tag();
            if self.runtime.image_exists(&tag).await? {
                log.info(format!("Removing cached image {}", tag));
                if let Err(e) = self.runtime.remove_image(&tag).await {
                    log.warning(format!("Could not remove cached image {}: {}", tag, e));
                }
            }
        }

        // Compose document
        let tokens = ensure_identity_tokens(self.credentials.as_ref(), &bot.id).await?;
        let user_compose = match bot.source {
            BotSource::Git { .. } => find_compose_file(repo_dir.path()).await,
            BotSource::Image { .. } => None,
        };

        let (mut document, app_id) = match user_compose {
            Some(path) => {
                log.info(format!(
                    "Adapting repository compose file {}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                ));
                let text = tokio::fs::read_to_string(&path).await?;
                validate_required(&text, bot)?;
                let mut document = ComposeDocument::parse(&text)?;
                let requested = resolve_app_id(&mut document, &default_app_id(&bot.id));
                let app_id = self.claim_app_id(bot, requested).await?;
                document.set_project_name(&app_id);
                (document, app_id)
            }
            None => {
                let app_id = self.claim_app_id(bot, bot.app_id()).await?;
                let with_database = detected.as_ref().map(|d| d.has_database).unwrap_or(false);
                if let Some(found) = &detected {
                    if !found.has_dockerfile {
                        self.write_default_dockerfile(repo_dir.path().to_path_buf(), found, log)
                            .await?;
                    }
                }
                log.info(if with_database {
                    "Generating compose document with a database sidecar"
                } else {
                    "Generating compose document"
                });
                let document = generate_document(bot, &app_id, repo_dir.path(), with_database)?;
                (document, app_id)
            }
        };

        let mut resolved = bot.clone();
        resolved.app_name = Some(app_id.clone());
        let vars = build_variables(&resolved, &tokens, &self.platform);
        substitute_document(&mut document, &vars);

        let ctx = TransformContext {
            app_id: app_id.clone(),
            bot_id: bot.id.clone(),
            bot_name: bot.name.clone(),
            puid: self.platform.puid,
            pgid: self.platform.pgid,
            data_root: self.platform.data_root.clone(),
            network_name: self.platform.network_name.clone(),
            repo_dir: bot.is_git().then(|| repo_dir.path().to_path_buf()),
            image_tag: bot.image_tag(),
        };
        let report = apply_all(&mut document, &ctx)?;
        debug!("Transform report for {}: {:?}", bot.id, report);

        let yaml = document.to_yaml()?;
        self.layout.compose_file(&bot.id).write_atomic(yaml.as_bytes()).await?;
        let env_file = self.layout.env_file(&bot.id);
        env_file.write_json_atomic(&vars).await?;
        env_file.set_permissions_600().await?;
        log.info("Compose document written");

        // Registry processing
        if self.target.uses_registry() {
            self.registry.provision_bind_mounts(&document, log).await;
            if !bot.has_started {
                self.registry
                    .run_pre_install(&document, bot_dir.path(), &vars, log)
                    .await?;
            }
            self.registry.publish_metadata(&app_id, &yaml, log).await;
        }

        // Image
        match &report.build_target {
            Some(target) => {
                let service = document.service(target).and_then(|s| s.get("build"));
                let build = match service {
                    Some(value) => BuildSpec::parse(target, value)?,
                    None => {
                        return Err(BotError::ComposeError(format!(
                            "build target '{}' has no build section",
                            target
                        )))
                    }
                };
                let context = PathBuf::from(&build.context);
                let dockerfile = context.join(build.dockerfile.as_deref().unwrap_or("Dockerfile"));
                log.info(format!("Building image {} from service {}", bot.image_tag(), target));
                self.runtime
                    .build_image(
                        &ImageBuild {
                            context,
                            dockerfile,
                            tag: bot.image_tag(),
                            no_cache: options.no_cache,
                        },
                        Some(&sink),
                    )
                    .await?;
            }
            None => log.info("No build target; images are pulled at deploy time"),
        }

        let detected_for_store = detected.clone();
        let persisted_app_id = app_id.clone();
        self.store
            .update(&bot.id, move |b| {
                b.app_name = Some(persisted_app_id);
                if detected_for_store.is_some() {
                    b.detected = detected_for_store;
                }
            })
            .await?;

        Ok(app_id)
    }

    async fn write_default_dockerfile(
        &self,
        repo_dir: PathBuf,
        detected: &DetectedSource,
        log: &BuildLog,
    ) -> Result<(), BotError> {
        let template = default_dockerfile(detected.language.as_deref()).ok_or_else(|| {
            BotError::ValidationError(
                "Repository has no Dockerfile and no template exists for its language"
                    .to_string(),
            )
        })?;
        tokio::fs::write(repo_dir.join("Dockerfile"), template).await?;
        log.info(format!(
            "Using the default {} Dockerfile",
            detected.language.as_deref().unwrap_or_default()
        ));
        Ok(())
    }

    // ================================ START ====================================== //

    pub(crate) async fn run_start(&self, bot_id: &str, log: &BuildLog) -> Result<(), BotError> {
        let bot = self.store.require(bot_id).await?;
        self.begin(&bot, BotEvent::Start, log)?;

        if !self.layout.compose_file(bot_id).exists().await {
            log.system("No compose document yet, building first");
            self.run_build(bot_id, log, BuildOptions::default()).await?;
        }

        self.advance(bot_id, BotEvent::Start, |_| {}).await?;
        log.system(format!("Starting {}", bot.name));

        match self.start_steps(bot_id, log).await {
            Ok(ids) => {
                let count = ids.len();
                self.advance(bot_id, BotEvent::StartSucceeded, move |b| {
                    b.container_ids = ids;
                    b.has_started = true;
                })
                .await?;
                log.success(format!("Bot is running ({} containers)", count));
                Ok(())
            }
            Err(e) => {
                self.mark_failed(bot_id, log, &e).await;
                Err(e)
            }
        }
    }

    async fn start_steps(&self, bot_id: &str, log: &BuildLog) -> Result<Vec<String>, BotError> {
        let bot = self.store.require(bot_id).await?;
        let app_id = bot.app_id();
        let compose_file = self.layout.compose_file(bot_id);
        let document = ComposeDocument::parse(&compose_file.read_string().await?)?;
        let sink = |line: &str| log.info(line);

        self.runtime
            .ensure_network(&self.platform.network_name)
            .await?;

        match self.target {
            DeploymentTarget::Casaos => {
                let project = ComposeProject {
                    name: app_id.clone(),
                    file: compose_file.path().to_path_buf(),
                };
                self.runtime.compose_up(&project, Some(&sink)).await?;
            }
            DeploymentTarget::Standalone => {
                let plan = standalone::plan(&document, &app_id)?;
                standalone::deploy(self.runtime.as_ref(), &plan, log).await?;
            }
        }

        let containers = self.discover_containers(&bot).await?;
        if containers.is_empty() {
            return Err(BotError::Internal(format!(
                "No containers found for {} after deploy",
                app_id
            )));
        }
        for container in &containers {
            log.info(format!("Container {} is {}", container.name, container.state));
        }

        if self.target.uses_registry() {
            self.registry.normalize_ownership(&app_id, log).await;
            if !bot.has_started {
                let vars: BTreeMap<String, String> =
                    self.layout.env_file(bot_id).read_json_or_default().await?;
                self.registry
                    .run_post_install(&document, self.layout.bot_dir(bot_id).path(), &vars, log)
                    .await;
            }
        }

        Ok(containers.into_iter().map(|c| c.id).collect())
    }

    // ================================= STOP ====================================== //

    pub(crate) async fn run_stop(&self, bot_id: &str, log: &BuildLog) -> Result<(), BotError> {
        let bot = self.store.require(bot_id).await?;
        if bot.status == BotStatus::Stopped {
            log.info(format!("{} is already stopped", bot.name));
            return Ok(());
        }
        self.begin(&bot, BotEvent::Stop, log)?;
        self.advance(bot_id, BotEvent::Stop, |_| {}).await?;
        log.system(format!("Stopping {}", bot.name));

        match self.stop_steps(&bot, log).await {
            Ok(()) => {
                self.advance(bot_id, BotEvent::StopSucceeded, |_| {})
                    .await?;
                log.success(format!("{} stopped", bot.name));
                Ok(())
            }
            Err(e) => {
                self.mark_failed(bot_id, log, &e).await;
                Err(e)
            }
        }
    }

    async fn stop_steps(&self, bot: &BotConfig, log: &BuildLog) -> Result<(), BotError> {
        let app_id = bot.app_id();
        let compose_file = self.layout.compose_file(&bot.id);

        if self.target == DeploymentTarget::Casaos && compose_file.exists().await {
            let sink = |line: &str| log.info(line);
            let project = ComposeProject {
                name: app_id,
                file: compose_file.path().to_path_buf(),
            };
            return self.runtime.compose_down(&project, Some(&sink)).await;
        }

        let ids = self.tracked_container_ids(bot).await;
        let failed = standalone::teardown(self.runtime.as_ref(), &ids, log).await;
        if let Err(e) = self
            .runtime
            .remove_network(&standalone::app_network(&app_id))
            .await
        {
            debug!("App network of {} not removed: {}", app_id, e);
        }
        if failed > 0 {
            return Err(BotError::Internal(format!(
                "{} of {} containers could not be removed",
                failed,
                ids.len()
            )));
        }
        Ok(())
    }

    // =============================== HELPERS ===================================== //

    /// Validate the transition before any side effect
    fn begin(&self, bot: &BotConfig, event: BotEvent, log: &BuildLog) -> Result<(), BotError> {
        if let Err(e) = transition(bot.status, &event) {
            log.warning(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Apply `event` to the stored status and persist it together with `mutate`.
    ///
    /// Entering `stopped` clears the container list; `last_error` is set only by
    /// a failure.
    pub(crate) async fn advance<F>(
        &self,
        bot_id: &str,
        event: BotEvent,
        mutate: F,
    ) -> Result<BotConfig, BotError>
    where
        F: FnOnce(&mut BotConfig) + Send,
    {
        let current = self.store.require(bot_id).await?;
        let next = transition(current.status, &event)?;
        let error = match &event {
            BotEvent::Failed(message) => Some(message.clone()),
            _ => None,
        };
        self.store
            .update(bot_id, move |bot| {
                bot.status = next;
                if next == BotStatus::Stopped {
                    bot.container_ids.clear();
                }
                bot.last_error = error;
                mutate(bot);
            })
            .await
    }

    /// Reserve `requested` as the bot's app id, or `<requested>-<bot id>` when
    /// another bot already deploys under it. A suffixed id, once claimed, is kept.
    ///
    /// The id names the compose project, the containers, the volumes and the
    /// data directory, so two bots may never share one.
    async fn claim_app_id(&self, bot: &BotConfig, requested: String) -> Result<String, BotError> {
        let _claim = self.app_ids.lock().await;
        let taken: HashSet<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|other| other.id != bot.id)
            .map(|other| other.app_id())
            .collect();

        let suffixed = format!("{}-{}", requested, bot.id);
        let app_id = if taken.contains(&requested) || bot.app_name.as_ref() == Some(&suffixed) {
            if taken.contains(&suffixed) {
                return Err(BotError::Conflict(format!(
                    "App id {} is already used by another bot",
                    suffixed
                )));
            }
            debug!("App id {} is taken, using {}", requested, suffixed);
            suffixed
        } else {
            requested
        };

        let claimed = app_id.clone();
        self.store
            .update(&bot.id, move |b| b.app_name = Some(claimed))
            .await?;
        Ok(app_id)
    }

    /// Record a failed operation on the bot and in its log
    pub(crate) async fn mark_failed(&self, bot_id: &str, log: &BuildLog, error: &BotError) {
        let message = error.to_string();
        log.error(message.clone());
        if let Err(e) = self
            .advance(bot_id, BotEvent::Failed(message), |_| {})
            .await
        {
            warn!("Failed to record error status of bot {}: {}", bot_id, e);
        }
    }

    /// Containers belonging to the bot: those carrying its id label or its
    /// compose project label
    pub async fn discover_containers(
        &self,
        bot: &BotConfig,
    ) -> Result<Vec<ContainerSummary>, BotError> {
        let filters = [
            ContainerFilter::Label {
                key: LABEL_BOT_ID.to_string(),
                value: bot.id.clone(),
            },
            ContainerFilter::Label {
                key: COMPOSE_PROJECT_LABEL.to_string(),
                value: bot.app_id(),
            },
        ];

        let mut found: Vec<ContainerSummary> = Vec::new();
        for filter in &filters {
            for container in self.runtime.list_containers(filter).await? {
                if !found.iter().any(|c| c.id == container.id) {
                    found.push(container);
                }
            }
        }
        Ok(found)
    }

    /// Recorded container ids plus whatever discovery finds
    pub(crate) async fn tracked_container_ids(&self, bot: &BotConfig) -> Vec<String> {
        let mut ids = bot.container_ids.clone();
        match self.discover_containers(bot).await {
            Ok(containers) => {
                for container in containers {
                    if !ids.contains(&container.id) {
                        ids.push(container.id);
                    }
                }
            }
            Err(e) => warn!("Container discovery for {} failed: {}", bot.id, e),
        }
        ids
    }
}
