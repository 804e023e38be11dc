//! Per-bot named secrets

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::BotError;
use crate::filesys::file::File;
use crate::storage::layout::StorageLayout;

/// Secret storage capability, one namespace per bot
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a secret
    async fn get(&self, bot_id: &str, name: &str) -> Result<Option<SecretString>, BotError>;

    /// Write a secret, replacing any previous value
    async fn set(&self, bot_id: &str, name: &str, value: SecretString) -> Result<(), BotError>;

    /// Remove one secret
    async fn delete(&self, bot_id: &str, name: &str) -> Result<(), BotError>;

    /// Remove every secret of a bot
    async fn delete_all(&self, bot_id: &str) -> Result<(), BotError>;
}

/// Secrets kept in a 0600 JSON file inside each bot's working directory
pub struct FileCredentialStore {
    layout: StorageLayout,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            write_lock: Mutex::new(()),
        }
    }

    fn secrets_file(&self, bot_id: &str) -> File {
        self.layout.bot_dir(bot_id).file("secrets.json")
    }

    async fn read_all(&self, bot_id: &str) -> Result<BTreeMap<String, String>, BotError> {
        self.secrets_file(bot_id).read_json_or_default().await
    }

    async fn write_all(
        &self,
        bot_id: &str,
        secrets: &BTreeMap<String, String>,
    ) -> Result<(), BotError> {
        let file = self.secrets_file(bot_id);
        file.write_json_atomic(secrets).await?;
        file.set_permissions_600().await
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, bot_id: &str, name: &str) -> Result<Option<SecretString>, BotError> {
        let secrets = self.read_all(bot_id).await?;
        Ok(secrets.get(name).map(|v| SecretString::from(v.clone())))
    }

    async fn set(&self, bot_id: &str, name: &str, value: SecretString) -> Result<(), BotError> {
        let _guard = self.write_lock.lock().await;
        let mut secrets = self.read_all(bot_id).await?;
        secrets.insert(name.to_string(), value.expose_secret().to_string());
        self.write_all(bot_id, &secrets).await?;
        debug!("Stored secret {} for bot {}", name, bot_id);
        Ok(())
    }

    async fn delete(&self, bot_id: &str, name: &str) -> Result<(), BotError> {
        let _guard = self.write_lock.lock().await;
        let mut secrets = self.read_all(bot_id).await?;
        if secrets.remove(name).is_some() {
            self.write_all(bot_id, &secrets).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, bot_id: &str) -> Result<(), BotError> {
        let _guard = self.write_lock.lock().await;
        self.secrets_file(bot_id).delete().await
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: std::sync::Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, bot_id: &str, name: &str) -> Result<Option<SecretString>, BotError> {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(secrets
            .get(&(bot_id.to_string(), name.to_string()))
            .map(|v| SecretString::from(v.clone())))
    }

    async fn set(&self, bot_id: &str, name: &str, value: SecretString) -> Result<(), BotError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.insert(
            (bot_id.to_string(), name.to_string()),
            value.expose_secret().to_string(),
        );
        Ok(())
    }

    async fn delete(&self, bot_id: &str, name: &str) -> Result<(), BotError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.remove(&(bot_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_all(&self, bot_id: &str) -> Result<(), BotError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.retain(|(id, _), _| id != bot_id);
        Ok(())
    }
}

/// Mask a secret for display, keeping a short prefix and suffix of long values
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}
