//! Bot registry persisted as a single JSON document

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::BotError;
use crate::filesys::file::File;
use crate::models::bot::{BotConfig, BotStatus};

type Registry = BTreeMap<String, BotConfig>;

/// Registry of bot configurations keyed by id.
///
/// Reads always reparse the file. Writes are read-modify-write cycles queued
/// behind one async mutex; tokio's mutex is FIFO, so concurrent updates apply
/// in arrival order and never overwrite each other's changes.
pub struct BotStore {
    file: File,
    write_queue: Mutex<()>,
}

impl BotStore {
    pub fn new(file: File) -> Self {
        Self {
            file,
            write_queue: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Registry, BotError> {
        self.file.read_json_or_default().await.map_err(|e| {
            BotError::StorageError(format!(
                "Failed to read registry {}: {}",
                self.file.path().display(),
                e
            ))
        })
    }

    async fn save(&self, registry: &Registry) -> Result<(), BotError> {
        self.file.write_json_atomic(registry).await
    }

    /// All bots, oldest first
    pub async fn list(&self) -> Result<Vec<BotConfig>, BotError> {
        let mut bots: Vec<BotConfig> = self.load().await?.into_values().collect();
        bots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(bots)
    }

    pub async fn get(&self, bot_id: &str) -> Result<Option<BotConfig>, BotError> {
        Ok(self.load().await?.remove(bot_id))
    }

    /// Like [`BotStore::get`] but a missing bot is an error
    pub async fn require(&self, bot_id: &str) -> Result<BotConfig, BotError> {
        self.get(bot_id)
            .await?
            .ok_or_else(|| BotError::NotFound(format!("Bot {} not found", bot_id)))
    }

    pub async fn contains(&self, bot_id: &str) -> Result<bool, BotError> {
        Ok(self.load().await?.contains_key(bot_id))
    }

    /// Add a new bot; the id must be unused
    pub async fn insert(&self, bot: BotConfig) -> Result<(), BotError> {
        let _guard = self.write_queue.lock().await;
        let mut registry = self.load().await?;
        if registry.contains_key(&bot.id) {
            return Err(BotError::Conflict(format!("Bot {} already exists", bot.id)));
        }
        debug!("Registering bot {} ({})", bot.id, bot.name);
        registry.insert(bot.id.clone(), bot);
        self.save(&registry).await
    }

    /// Apply `mutate` to the stored bot and persist the result
    pub async fn update<F>(&self, bot_id: &str, mutate: F) -> Result<BotConfig, BotError>
    where
        F: FnOnce(&mut BotConfig) + Send,
    {
        let _guard = self.write_queue.lock().await;
        let mut registry = self.load().await?;
        let bot = registry
            .get_mut(bot_id)
            .ok_or_else(|| BotError::NotFound(format!("Bot {} not found", bot_id)))?;
        mutate(bot);
        bot.updated_at = Utc::now();
        let updated = bot.clone();
        self.save(&registry).await?;
        Ok(updated)
    }

    /// Record a status transition. Entering `stopped` clears the container list.
    pub async fn update_status(
        &self,
        bot_id: &str,
        status: BotStatus,
        error: Option<String>,
    ) -> Result<BotConfig, BotError> {
        self.update(bot_id, move |bot| {
            bot.status = status;
            if status == BotStatus::Stopped {
                bot.container_ids.clear();
            }
            bot.last_error = error;
        })
        .await
    }

    /// Drop a bot from the registry
    pub async fn remove(&self, bot_id: &str) -> Result<Option<BotConfig>, BotError> {
        let _guard = self.write_queue.lock().await;
        let mut registry = self.load().await?;
        let removed = registry.remove(bot_id);
        if removed.is_some() {
            self.save(&registry).await?;
        }
        Ok(removed)
    }
}
