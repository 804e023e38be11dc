//! Bot registration, removal, queries and state reconciliation

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::buildlog::BuildLogEntry;
use crate::deploy::executor::{BotExecutor, OperationOutcome};
use crate::deploy::fsm::{transition, BotEvent};
use crate::deploy::git::{AheadBehind, RepoInfo};
use crate::deploy::runtime::{ComposeProject, ContainerStats};
use crate::deploy::standalone;
use crate::errors::BotError;
use crate::models::bot::{BotConfig, BotSource, BotStatus};
use crate::platform::DeploymentTarget;
use crate::utils::{constant_time_eq, generate_uuid, sha256_hash, short_id};

static ENV_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern is valid")
});

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_LOG_TAIL: usize = 200;
const MAX_ID_ATTEMPTS: usize = 16;
const GIT_SCHEMES: &[&str] = &["http", "https", "ssh", "git", "file"];

/// Fields needed to register a bot
#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub source: BotSource,
    pub env_vars: BTreeMap<String, String>,
}

/// Logs of one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLogs {
    pub container: String,
    pub logs: String,
}

/// Checkout state of a git-sourced bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    pub info: RepoInfo,
    pub drift: AheadBehind,
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub skipped: usize,
}

fn validate_env_keys(vars: &BTreeMap<String, String>) -> Result<(), BotError> {
    for key in vars.keys() {
        if !ENV_KEY.is_match(key) {
            return Err(BotError::ValidationError(format!(
                "Invalid environment variable name '{}'",
                key
            )));
        }
    }
    Ok(())
}

fn normalize_source(source: BotSource) -> Result<BotSource, BotError> {
    match source {
        BotSource::Git { url, branch } => {
            let url = url.trim().to_string();
            if url.is_empty() {
                return Err(BotError::ValidationError(
                    "A git bot needs a repository URL".to_string(),
                ));
            }
            if url.starts_with('-') || url.contains(char::is_whitespace) {
                return Err(BotError::ValidationError(format!(
                    "Invalid repository URL '{}'",
                    url
                )));
            }
            // scp-style `user@host:path` has no scheme and is passed through
            if url.contains("://") {
                let parsed = Url::parse(&url).map_err(|e| {
                    BotError::ValidationError(format!("Invalid repository URL '{}': {}", url, e))
                })?;
                if !GIT_SCHEMES.contains(&parsed.scheme()) {
                    return Err(BotError::ValidationError(format!(
                        "Unsupported repository scheme '{}'",
                        parsed.scheme()
                    )));
                }
            }
            let branch = branch.trim();
            Ok(BotSource::Git {
                url,
                branch: if branch.is_empty() {
                    DEFAULT_BRANCH.to_string()
                } else {
                    branch.to_string()
                },
            })
        }
        BotSource::Image { image_ref } => {
            let image_ref = image_ref.trim().to_string();
            if image_ref.is_empty() || image_ref.starts_with('-') || image_ref.contains(' ') {
                return Err(BotError::ValidationError(format!(
                    "Invalid image reference '{}'",
                    image_ref
                )));
            }
            Ok(BotSource::Image { image_ref })
        }
    }
}

impl BotExecutor {
    // =============================== REGISTRY ==================================== //

    /// Validate and register a bot. Nothing is cloned or built yet.
    pub async fn create_bot(&self, request: NewBot) -> Result<BotConfig, BotError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(BotError::ValidationError("A bot needs a name".to_string()));
        }
        let source = normalize_source(request.source)?;
        validate_env_keys(&request.env_vars)?;

        let mut id = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = short_id();
            if !self.store.contains(&candidate).await? {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or_else(|| BotError::Internal("Could not allocate a bot id".to_string()))?;

        let update_token = generate_uuid();
        let now = Utc::now();
        let bot = BotConfig {
            id: id.clone(),
            name,
            source,
            status: BotStatus::Stopped,
            container_ids: Vec::new(),
            auth_hash: sha256_hash(update_token.as_bytes()),
            update_token,
            env_vars: request.env_vars,
            detected: None,
            app_name: None,
            has_started: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.layout.bot_dir(&id).create().await?;
        self.store.insert(bot.clone()).await?;
        self.logs
            .get(&id)
            .system(format!("Registered {} bot {}", bot.source.kind(), bot.name));
        info!("Created bot {} ({})", bot.id, bot.name);
        Ok(bot)
    }

    /// Merge or replace the bot's environment. An empty value removes the key when merging.
    pub async fn update_env(
        &self,
        bot_id: &str,
        vars: BTreeMap<String, String>,
        replace: bool,
    ) -> Result<BotConfig, BotError> {
        validate_env_keys(&vars)?;
        self.store
            .update(bot_id, move |bot| {
                if replace {
                    bot.env_vars = vars;
                    return;
                }
                for (key, value) in vars {
                    if value.is_empty() {
                        bot.env_vars.remove(&key);
                    } else {
                        bot.env_vars.insert(key, value);
                    }
                }
            })
            .await
    }

    pub async fn get_bot(&self, bot_id: &str) -> Result<BotConfig, BotError> {
        self.store.require(bot_id).await
    }

    pub async fn list_bots(&self) -> Result<Vec<BotConfig>, BotError> {
        self.store.list().await
    }

    /// Remove every trace of a bot, continuing past individual failures
    pub async fn delete_bot(&self, bot_id: &str) -> OperationOutcome {
        let _lease = self.locks.acquire(bot_id).await;
        let bot = match self.store.require(bot_id).await {
            Ok(bot) => bot,
            Err(e) => return OperationOutcome::failure(e.to_string()),
        };
        let log = self.logs.get(bot_id);
        let app_id = bot.app_id();
        log.system(format!("Deleting {}", bot.name));

        let ids = self.tracked_container_ids(&bot).await;
        let failed = standalone::teardown(self.runtime.as_ref(), &ids, &log).await;
        if failed > 0 {
            warn!("{} containers of bot {} could not be removed", failed, bot_id);
        }

        let compose_file = self.layout.compose_file(bot_id);
        if self.target == DeploymentTarget::Casaos && compose_file.exists().await {
            let project = ComposeProject {
                name: app_id.clone(),
                file: compose_file.path().to_path_buf(),
            };
            if let Err(e) = self.runtime.compose_down(&project, None).await {
                log.warning(format!("compose down failed: {}", e));
            }
        }

        match self.runtime.list_volumes(&format!("{}_", app_id)).await {
            Ok(volumes) => {
                for volume in volumes {
                    if let Err(e) = self.runtime.remove_volume(&volume).await {
                        log.warning(format!("Could not remove volume {}: {}", volume, e));
                    }
                }
            }
            Err(e) => log.warning(format!("Could not list volumes: {}", e)),
        }

        if let Err(e) = self
            .runtime
            .remove_network(&standalone::app_network(&app_id))
            .await
        {
            debug!("App network of {} not removed: {}", app_id, e);
        }

        if bot.is_git() {
            let tag = bot.image_tag();
            match self.runtime.image_exists(&tag).await {
                Ok(true) => {
                    if let Err(e) = self.runtime.remove_image(&tag).await {
                        log.warning(format!("Could not remove image {}: {}", tag, e));
                    }
                }
                Ok(false) => {}
                Err(e) => log.warning(format!("Could not inspect image {}: {}", tag, e)),
            }
        }

        self.registry.cleanup(&app_id, &log).await;

        if let Err(e) = self.credentials.delete_all(bot_id).await {
            warn!("Could not delete credentials of bot {}: {}", bot_id, e);
        }
        if let Err(e) = self.layout.bot_dir(bot_id).delete().await {
            warn!("Could not remove working tree of bot {}: {}", bot_id, e);
        }

        let removed = self.store.remove(bot_id).await;
        self.logs.destroy(bot_id);
        self.locks.forget(bot_id);
        match removed {
            Ok(_) => {
                info!("Deleted bot {} ({})", bot_id, bot.name);
                OperationOutcome::ok()
            }
            Err(e) => OperationOutcome::failure(e.to_string()),
        }
    }

    // ================================ QUERIES ==================================== //

    /// Recent output of each of the bot's containers
    pub async fn container_logs(
        &self,
        bot_id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<ContainerLogs>, BotError> {
        let bot = self.store.require(bot_id).await?;
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL);
        let mut logs = Vec::new();
        for container in self.discover_containers(&bot).await? {
            let output = self.runtime.container_logs(&container.id, tail).await?;
            logs.push(ContainerLogs {
                container: container.name,
                logs: output,
            });
        }
        Ok(logs)
    }

    /// Resource usage of the bot's running containers
    pub async fn container_stats(&self, bot_id: &str) -> Result<Vec<ContainerStats>, BotError> {
        let bot = self.store.require(bot_id).await?;
        let mut stats = Vec::new();
        for container in self.discover_containers(&bot).await? {
            if container.is_running() {
                stats.push(self.runtime.container_stats(&container.id).await?);
            }
        }
        Ok(stats)
    }

    pub fn build_log(&self, bot_id: &str) -> Vec<BuildLogEntry> {
        self.logs.get(bot_id).snapshot()
    }

    /// Branch, last commit and drift from upstream of a git-sourced bot
    pub async fn repo_status(&self, bot_id: &str) -> Result<RepoStatus, BotError> {
        let bot = self.store.require(bot_id).await?;
        if !bot.is_git() {
            return Err(BotError::ValidationError(format!(
                "Bot {} is not built from a repository",
                bot_id
            )));
        }
        let repo_dir = self.layout.repo_dir(bot_id);
        if !repo_dir.exists().await {
            return Err(BotError::NotFound(format!(
                "Repository of bot {} has not been cloned yet",
                bot_id
            )));
        }
        let info = self.repo.info(repo_dir.path()).await?;
        let drift = match self.repo.ahead_behind(repo_dir.path()).await {
            Ok(drift) => drift,
            Err(e) => {
                warn!("Could not compare bot {} with upstream: {}", bot_id, e);
                AheadBehind::default()
            }
        };
        Ok(RepoStatus { info, drift })
    }

    /// Check a webhook token against the stored hash
    pub async fn verify_update_token(&self, bot_id: &str, token: &str) -> Result<bool, BotError> {
        let bot = self.store.require(bot_id).await?;
        Ok(constant_time_eq(
            &sha256_hash(token.as_bytes()),
            &bot.auth_hash,
        ))
    }

    // ============================= RECONCILIATION ================================ //

    /// Align recorded statuses with the containers actually present.
    ///
    /// Bots with an operation in flight are skipped. A transient status with
    /// nothing in flight means the operation was interrupted.
    pub async fn reconcile(&self) -> Result<ReconcileReport, BotError> {
        let mut report = ReconcileReport::default();
        for bot in self.store.list().await? {
            let Some(_lease) = self.locks.try_acquire(&bot.id) else {
                report.skipped += 1;
                continue;
            };
            report.checked += 1;

            let containers = match self.discover_containers(&bot).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!("Skipping reconciliation of bot {}: {}", bot.id, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let running: Vec<String> = containers
                .iter()
                .filter(|c| c.is_running())
                .map(|c| c.id.clone())
                .collect();

            let next = match (bot.status, running.is_empty()) {
                (BotStatus::Running, false) if running == bot.container_ids => None,
                (_, false) => Some((BotStatus::Running, None)),
                (BotStatus::Running, true) if containers.is_empty() => {
                    Some((BotStatus::Stopped, None))
                }
                (BotStatus::Running, true) => Some((
                    BotStatus::Error,
                    Some("Containers exited unexpectedly".to_string()),
                )),
                (BotStatus::Stopping, true) => Some((BotStatus::Stopped, None)),
                (BotStatus::Building | BotStatus::Starting, true) => Some((
                    BotStatus::Error,
                    Some(format!("{} was interrupted", bot.status)),
                )),
                (BotStatus::Stopped | BotStatus::Error, true) => None,
            };

            if let Some((observed, error)) = next {
                let status = transition(bot.status, &BotEvent::Observed(observed))?;
                info!(
                    "Reconciled bot {}: {} -> {}",
                    bot.id, bot.status, status
                );
                self.store
                    .update(&bot.id, move |b| {
                        b.status = status;
                        b.container_ids = if status == BotStatus::Running {
                            running
                        } else {
                            Vec::new()
                        };
                        if status == BotStatus::Running {
                            b.has_started = true;
                        }
                        b.last_error = error;
                    })
                    .await?;
                report.updated += 1;
            }
        }
        debug!("Reconciliation pass: {:?}", report);
        Ok(report)
    }
}
