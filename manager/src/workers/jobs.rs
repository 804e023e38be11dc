//! Queue of accepted lifecycle operations
//!
//! API requests enqueue a job and return immediately. The worker runs jobs
//! concurrently; operations on the same bot still serialise on the
//! executor's per-bot lease. Completion is published on a broadcast channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::deploy::executor::{BotExecutor, OperationOutcome};
use crate::errors::BotError;
use crate::utils::generate_uuid;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle operation a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOperation {
    Build,
    Start,
    Stop,
    Restart,
    PullRebuild,
    Delete,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOperation::Build => "build",
            JobOperation::Start => "start",
            JobOperation::Stop => "stop",
            JobOperation::Restart => "restart",
            JobOperation::PullRebuild => "pull_rebuild",
            JobOperation::Delete => "delete",
        }
    }
}

/// An accepted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub bot_id: String,
    pub operation: JobOperation,
}

/// Completion notice of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: String,
    pub bot_id: String,
    pub operation: JobOperation,
    pub outcome: OperationOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Submission side of the queue
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        (Self { tx, events }, rx)
    }

    /// Enqueue an operation and return its job
    pub async fn submit(&self, bot_id: &str, operation: JobOperation) -> Result<Job, BotError> {
        let job = Job {
            id: generate_uuid(),
            bot_id: bot_id.to_string(),
            operation,
        };
        self.tx
            .send(job.clone())
            .await
            .map_err(|_| BotError::ShutdownError("job queue is closed".to_string()))?;
        debug!("Queued {} for bot {} as job {}", operation.as_str(), bot_id, job.id);
        Ok(job)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }
}

/// Run one job against the executor
pub async fn execute(executor: &BotExecutor, job: &Job) -> OperationOutcome {
    match job.operation {
        JobOperation::Build => executor.build(&job.bot_id).await,
        JobOperation::Start => executor.start(&job.bot_id).await,
        JobOperation::Stop => executor.stop(&job.bot_id).await,
        JobOperation::Restart => executor.restart(&job.bot_id).await,
        JobOperation::PullRebuild => executor.pull_rebuild(&job.bot_id).await,
        JobOperation::Delete => executor.delete_bot(&job.bot_id).await,
    }
}

/// Run the job worker until shutdown, then wait for in-flight jobs
pub async fn run(
    executor: Arc<BotExecutor>,
    mut jobs: mpsc::Receiver<Job>,
    events: broadcast::Sender<JobEvent>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Job worker starting...");
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Job worker shutting down...");
                break;
            }
            job = jobs.recv() => {
                let Some(job) = job else {
                    break;
                };
                let executor = executor.clone();
                let events = events.clone();
                in_flight.spawn(async move {
                    info!("Running {} for bot {}", job.operation.as_str(), job.bot_id);
                    let outcome = execute(&executor, &job).await;
                    if let Some(e) = &outcome.error {
                        error!("{} of bot {} failed: {}", job.operation.as_str(), job.bot_id, e);
                    }
                    // nobody listening is fine
                    let _ = events.send(JobEvent {
                        job_id: job.id,
                        bot_id: job.bot_id,
                        operation: job.operation,
                        outcome,
                        finished_at: Utc::now(),
                    });
                });
            }
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = result {
                    error!("Job task panicked: {}", e);
                }
            }
        }
    }

    jobs.close();
    if !in_flight.is_empty() {
        info!("Waiting for {} in-flight jobs...", in_flight.len());
    }
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!("Job task panicked: {}", e);
        }
    }
}
