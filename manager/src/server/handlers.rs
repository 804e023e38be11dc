//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use openapi_server::models::{
    ApiResponse, CreateBotRequest, HealthResponse, JobAccepted, JobEventResponse, LogsQuery,
    MetricsResponse, RepoStatusResponse, SourceKind, UpdateEnvRequest, VersionResponse,
    WebhookRequest,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

use crate::buildlog::BuildLogEntry;
use crate::deploy::lifecycle::{ContainerLogs, NewBot};
use crate::deploy::runtime::ContainerStats;
use crate::errors::BotError;
use crate::models::bot::{BotConfig, BotSource, BotStatus};
use crate::server::state::ServerState;
use crate::telemetry::collect_metrics;
use crate::utils::version_info;
use crate::workers::jobs::{JobEvent, JobOperation};

// ================================= ERRORS ======================================== //

/// Error response carrying the uniform failure envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl From<BotError> for ApiError {
    fn from(err: BotError) -> Self {
        let status = match &err {
            BotError::ValidationError(_) => StatusCode::BAD_REQUEST,
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::Conflict(_) => StatusCode::CONFLICT,
            BotError::ShutdownError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::failure(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

// ================================ SERVICE ======================================== //

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "botyard".to_string(),
        version: version.version,
        deployment_target: state.executor.target().as_str().to_string(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Metrics handler
pub async fn metrics_handler(State(state): State<Arc<ServerState>>) -> ApiResult<MetricsResponse> {
    let metrics = tokio::task::spawn_blocking(collect_metrics)
        .await
        .map_err(|e| BotError::Internal(e.to_string()))?;
    let bots = state.executor.list_bots().await?;
    let bots_running = bots
        .iter()
        .filter(|b| b.status == BotStatus::Running)
        .count();

    ok(MetricsResponse {
        cpu_usage: metrics.cpu_usage,
        memory_used: metrics.memory_used,
        memory_total: metrics.memory_total,
        memory_percent: metrics.memory_percent,
        disk_used: metrics.disk_used,
        disk_total: metrics.disk_total,
        disk_percent: metrics.disk_percent,
        uptime_secs: metrics.uptime_secs,
        hostname: metrics.hostname,
        bots_total: bots.len(),
        bots_running,
    })
}

// ================================== BOTS ========================================= //

fn source_from_request(request: &CreateBotRequest) -> Result<BotSource, BotError> {
    match request.source_type {
        SourceKind::Git => {
            let url = request.repo_url.clone().ok_or_else(|| {
                BotError::ValidationError("repo_url is required for git bots".to_string())
            })?;
            Ok(BotSource::Git {
                url,
                branch: request.branch.clone().unwrap_or_default(),
            })
        }
        SourceKind::Image => {
            let image_ref = request.image_ref.clone().ok_or_else(|| {
                BotError::ValidationError("image_ref is required for image bots".to_string())
            })?;
            Ok(BotSource::Image { image_ref })
        }
    }
}

/// Redacted bot without its update token
fn public_view(bot: &BotConfig) -> BotConfig {
    let mut bot = bot.redacted();
    bot.update_token = String::new();
    bot
}

pub async fn list_bots_handler(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<BotConfig>> {
    let bots = state.executor.list_bots().await?;
    ok(bots.iter().map(public_view).collect())
}

pub async fn create_bot_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateBotRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BotConfig>>), ApiError> {
    let source = source_from_request(&request)?;
    let bot = state
        .executor
        .create_bot(NewBot {
            name: request.name,
            source,
            env_vars: request.env_vars,
        })
        .await?;
    // The update token is only ever returned here
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(bot.redacted()))))
}

pub async fn get_bot_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<BotConfig> {
    ok(public_view(&state.executor.get_bot(&id).await?))
}

pub async fn update_env_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateEnvRequest>,
) -> ApiResult<BotConfig> {
    let bot = state
        .executor
        .update_env(&id, request.env_vars, request.replace)
        .await?;
    ok(public_view(&bot))
}

// =============================== OPERATIONS ====================================== //

async fn enqueue(
    state: &ServerState,
    bot_id: &str,
    operation: JobOperation,
) -> Result<(StatusCode, Json<ApiResponse<JobAccepted>>), ApiError> {
    state.executor.get_bot(bot_id).await?;
    let job = state.jobs.submit(bot_id, operation).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(JobAccepted {
            job_id: job.id,
            bot_id: job.bot_id,
            operation: operation.as_str().to_string(),
        })),
    ))
}

pub async fn delete_bot_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::Delete).await
}

pub async fn build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::Build).await
}

pub async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::Start).await
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::Stop).await
}

pub async fn restart_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::Restart).await
}

pub async fn pull_rebuild_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    enqueue(&state, &id, JobOperation::PullRebuild).await
}

/// Pull-and-rebuild triggered from outside, authenticated by the update token
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<WebhookRequest>,
) -> Result<(StatusCode, Json<ApiResponse<JobAccepted>>), ApiError> {
    if !state.executor.verify_update_token(&id, &request.token).await? {
        warn!("Rejected webhook for bot {}: bad token", id);
        return Err(ApiError::unauthorized("Invalid update token"));
    }
    info!("Webhook accepted for bot {}", id);
    enqueue(&state, &id, JobOperation::PullRebuild).await
}

// ============================== OBSERVATION ====================================== //

pub async fn container_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Vec<ContainerLogs>> {
    ok(state.executor.container_logs(&id, query.tail).await?)
}

pub async fn stats_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ContainerStats>> {
    ok(state.executor.container_stats(&id).await?)
}

pub async fn build_log_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<BuildLogEntry>> {
    state.executor.get_bot(&id).await?;
    ok(state.executor.build_log(&id))
}

pub async fn repo_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<RepoStatusResponse> {
    let status = state.executor.repo_status(&id).await?;
    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
    ok(RepoStatusResponse {
        branch: status.info.branch,
        commit: non_empty(status.info.commit),
        commit_message: non_empty(status.info.commit_message),
        commit_author: non_empty(status.info.commit_author),
        commit_date: non_empty(status.info.commit_date),
        ahead: status.drift.ahead,
        behind: status.drift.behind,
    })
}

// ================================ STREAMS ======================================== //

/// Items of a broadcast receiver until the sender goes away
fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> impl Stream<Item = T> + Send
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(item) => Some(item),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Stream subscriber lagged, {} entries skipped", skipped);
                None
            }
        }
    })
}

fn json_event<T: Serialize>(name: &'static str, data: &T) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
}

/// Replay of the current build log followed by live entries
pub async fn build_log_stream_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.executor.get_bot(&id).await?;
    let (backlog, receiver) = state.executor.logs().get(&id).snapshot_and_subscribe();

    let live = match receiver {
        Some(receiver) => broadcast_stream(receiver).boxed(),
        None => stream::empty().boxed(),
    };
    let entries = stream::iter(backlog)
        .chain(live)
        .map(|entry| json_event("log", &entry));

    Ok(Sse::new(entries).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobEventsQuery {
    #[serde(default)]
    pub bot_id: Option<String>,
}

fn job_event_response(event: JobEvent) -> JobEventResponse {
    JobEventResponse {
        job_id: event.job_id,
        bot_id: event.bot_id,
        operation: event.operation.as_str().to_string(),
        success: event.outcome.success,
        error: event.outcome.error,
        finished_at: event.finished_at,
    }
}

/// Live completion notices of queued operations
pub async fn job_events_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<JobEventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = broadcast_stream(state.jobs.subscribe())
        .filter(move |event| {
            let keep = query
                .bot_id
                .as_ref()
                .map(|bot_id| &event.bot_id == bot_id)
                .unwrap_or(true);
            futures::future::ready(keep)
        })
        .map(|event| json_event("job", &job_event_response(event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_stream_skips_lag_and_ends_on_close() {
        let (sender, receiver) = broadcast::channel(2);
        for n in 0..4 {
            sender.send(n).unwrap();
        }
        drop(sender);

        let items: Vec<i32> = broadcast_stream(receiver).collect().await;
        assert_eq!(items, vec![2, 3]);
    }
}
