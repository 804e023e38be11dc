//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::deploy::executor::BotExecutor;
use crate::workers::jobs::JobQueue;

/// Server state shared across handlers
pub struct ServerState {
    pub executor: Arc<BotExecutor>,
    pub jobs: Arc<JobQueue>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(executor: Arc<BotExecutor>, jobs: Arc<JobQueue>, started_at: DateTime<Utc>) -> Self {
        Self {
            executor,
            jobs,
            started_at,
        }
    }
}
