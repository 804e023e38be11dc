//! Manager API models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uniform response envelope returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn empty() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }
}

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub deployment_target: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Source kind requested on bot creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    Image,
}

/// Bot creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    pub source_type: SourceKind,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Environment update request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEnvRequest {
    pub env_vars: BTreeMap<String, String>,
    /// Replace the whole map instead of merging into it
    #[serde(default)]
    pub replace: bool,
}

/// Query parameters for container logs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,
}

/// Update webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub token: String,
}

/// Returned when an operation has been queued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub bot_id: String,
    pub operation: String,
}

/// Completion notice for a queued operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventResponse {
    pub job_id: String,
    pub bot_id: String,
    pub operation: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Repository status of a git-sourced bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStatusResponse {
    pub branch: String,
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_date: Option<String>,
    pub ahead: u32,
    pub behind: u32,
}

/// Host metrics response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub cpu_usage: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f32,
    pub disk_used: u64,
    pub disk_total: u64,
    pub disk_percent: f32,
    pub uptime_secs: u64,
    pub hostname: String,
    pub bots_total: usize,
    pub bots_running: usize,
}
