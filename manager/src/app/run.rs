//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::BotError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::jobs::{self, Job};
use crate::workers::reconciler;

/// Run the botyard manager
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BotError> {
    info!("Initializing botyard {}...", version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start botyard: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, BotError> {
    let (app_state, job_rx) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;

    // Settle statuses left behind by a previous run before accepting work
    match app_state.executor.reconcile().await {
        Ok(report) => info!(
            "Start-up reconciliation: {} bots checked, {} updated",
            report.checked, report.updated
        ),
        Err(e) => warn!("Start-up reconciliation failed: {}", e),
    }

    init_job_worker(
        app_state.clone(),
        job_rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_reconciler {
        init_reconciler_worker(
            options.reconciler.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    if options.enable_server {
        init_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

async fn init_job_worker(
    app_state: Arc<AppState>,
    job_rx: mpsc::Receiver<Job>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BotError> {
    info!("Initializing job worker...");

    let executor = app_state.executor.clone();
    let events = app_state.jobs.events();

    let jobs_handle = tokio::spawn(async move {
        jobs::run(
            executor,
            job_rx,
            events,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_job_worker_handle(jobs_handle)?;
    Ok(())
}

async fn init_reconciler_worker(
    options: reconciler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BotError> {
    info!("Initializing reconciler worker...");

    let executor = app_state.executor.clone();

    let reconciler_handle = tokio::spawn(async move {
        reconciler::run(
            &options,
            executor.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reconciler_worker_handle(reconciler_handle)?;
    Ok(())
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BotError> {
    info!("Initializing HTTP API...");

    let server_state = ServerState::new(
        app_state.executor.clone(),
        app_state.jobs.clone(),
        app_state.started_at,
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), BotError>>>,
    reconciler_worker_handle: Option<JoinHandle<()>>,
    job_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            reconciler_worker_handle: None,
            job_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), BotError> {
        if self.app_state.is_some() {
            return Err(BotError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_job_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), BotError> {
        if self.job_worker_handle.is_some() {
            return Err(BotError::ShutdownError("job_worker_handle already set".to_string()));
        }
        self.job_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_reconciler_worker_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), BotError> {
        if self.reconciler_worker_handle.is_some() {
            return Err(BotError::ShutdownError(
                "reconciler_handle already set".to_string(),
            ));
        }
        self.reconciler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), BotError>>,
    ) -> Result<(), BotError> {
        if self.server_handle.is_some() {
            return Err(BotError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), BotError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), BotError> {
        info!("Shutting down botyard...");

        // 1. Server, so no new jobs are accepted
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| BotError::ShutdownError(e.to_string()))??;
        }

        // 2. Reconciler worker
        if let Some(handle) = self.reconciler_worker_handle.take() {
            handle.await.map_err(|e| BotError::ShutdownError(e.to_string()))?;
        }

        // 3. Job worker, which drains in-flight operations
        if let Some(handle) = self.job_worker_handle.take() {
            handle.await.map_err(|e| BotError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
