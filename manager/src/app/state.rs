//! Application state management

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::app::options::AppOptions;
use crate::buildlog::LogCollector;
use crate::deploy::docker::DockerCli;
use crate::deploy::executor::{BotExecutor, ExecutorParts};
use crate::deploy::git::GitCli;
use crate::detect::FileDetector;
use crate::errors::BotError;
use crate::platform::DeploymentTarget;
use crate::storage::bots::BotStore;
use crate::storage::credentials::FileCredentialStore;
use crate::workers::jobs::{Job, JobQueue};

/// Main application state
pub struct AppState {
    /// Bot lifecycle executor
    pub executor: Arc<BotExecutor>,

    /// Queue of accepted lifecycle operations
    pub jobs: Arc<JobQueue>,

    /// When the manager started
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the executor to the host's container runtime and git
    pub async fn init(options: &AppOptions) -> Result<(Self, mpsc::Receiver<Job>), BotError> {
        info!("Initializing application state...");

        let layout = options.storage.layout.clone();
        layout.setup().await?;

        let target = DeploymentTarget::resolve(
            options.platform.deployment_target,
            &options.platform.metadata_root,
        )
        .await;

        let executor = BotExecutor::new(ExecutorParts {
            store: Arc::new(BotStore::new(layout.registry_file())),
            logs: Arc::new(LogCollector::new(options.storage.build_log_capacity)),
            runtime: Arc::new(DockerCli::new(options.timeouts.clone())),
            repo: Arc::new(GitCli::new(options.timeouts.clone())),
            detector: Arc::new(FileDetector),
            credentials: Arc::new(FileCredentialStore::new(layout.clone())),
            platform: options.platform.clone(),
            timeouts: options.timeouts.clone(),
            target,
            layout,
        });

        Ok(Self::with_executor(Arc::new(executor), options.job_queue_capacity))
    }

    /// State around an already built executor
    pub fn with_executor(
        executor: Arc<BotExecutor>,
        job_queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Job>) {
        let (jobs, job_rx) = JobQueue::new(job_queue_capacity);
        let state = Self {
            executor,
            jobs: Arc::new(jobs),
            started_at: Utc::now(),
        };
        (state, job_rx)
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), BotError> {
        info!("Shutting down application state...");
        Ok(())
    }
}
