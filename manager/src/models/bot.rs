//! Bot models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::credentials::mask;

/// Lifecycle status of a bot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Building,
}

impl BotStatus {
    /// Whether an operation is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BotStatus::Starting | BotStatus::Stopping | BotStatus::Building
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Stopping => "stopping",
            BotStatus::Error => "error",
            BotStatus::Building => "building",
        }
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a bot's code comes from. Exactly one of repository or image is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "lowercase")]
pub enum BotSource {
    Git { url: String, branch: String },
    Image { image_ref: String },
}

impl BotSource {
    pub fn kind(&self) -> &'static str {
        match self {
            BotSource::Git { .. } => "git",
            BotSource::Image { .. } => "image",
        }
    }
}

/// Characteristics detected from a bot's repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedSource {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub has_database: bool,
    #[serde(default)]
    pub has_dockerfile: bool,
    #[serde(default)]
    pub has_compose: bool,
}

/// Persisted configuration and state of a single bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub name: String,

    #[serde(flatten)]
    pub source: BotSource,

    #[serde(default)]
    pub status: BotStatus,

    /// Identifiers of live containers, cleared on stop
    #[serde(default)]
    pub container_ids: Vec<String>,

    /// Token presented to the update webhook, fixed at creation
    pub update_token: String,

    /// SHA-256 of the update token, fixed at creation
    pub auth_hash: String,

    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[serde(default)]
    pub detected: Option<DetectedSource>,

    /// Resolved compose project name
    #[serde(default)]
    pub app_name: Option<String>,

    /// Set after the first successful start, gates the post-install hook
    #[serde(default)]
    pub has_started: bool,

    #[serde(default)]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotConfig {
    /// Deployment identifier: the resolved app name, or the id-derived default
    pub fn app_id(&self) -> String {
        self.app_name
            .clone()
            .unwrap_or_else(|| default_app_id(&self.id))
    }

    /// Tag of the locally built image
    pub fn image_tag(&self) -> String {
        format!("bot-{}:latest", self.id)
    }

    pub fn is_git(&self) -> bool {
        matches!(self.source, BotSource::Git { .. })
    }

    /// Copy suitable for API responses: secret-looking env values are masked
    pub fn redacted(&self) -> BotConfig {
        let mut bot = self.clone();
        for (key, value) in bot.env_vars.iter_mut() {
            if looks_secret(key) {
                *value = mask(value);
            }
        }
        bot.auth_hash = String::new();
        bot
    }
}

/// App identifier used before any compose document resolved one
pub fn default_app_id(bot_id: &str) -> String {
    format!("bot-{}", bot_id)
}

fn looks_secret(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    ["TOKEN", "SECRET", "PASSWORD", "PASS", "KEY", "AUTH"]
        .iter()
        .any(|marker| key.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BotConfig {
        BotConfig {
            id: "a1b2c3d4".to_string(),
            name: "Greeter".to_string(),
            source: BotSource::Git {
                url: "https://example.com/greeter.git".to_string(),
                branch: "main".to_string(),
            },
            status: BotStatus::Stopped,
            container_ids: vec![],
            update_token: "tok".to_string(),
            auth_hash: "hash".to_string(),
            env_vars: BTreeMap::from([
                ("BOT_TOKEN".to_string(), "123456:abcdefgh".to_string()),
                ("LOCALE".to_string(), "en".to_string()),
            ]),
            detected: None,
            app_name: None,
            has_started: false,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_source_serializes_flat() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["source_type"], "git");
        assert_eq!(json["url"], "https://example.com/greeter.git");
        assert!(json.get("image_ref").is_none());

        let back: BotConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.source, sample().source);
    }

    #[test]
    fn test_app_id_defaults_to_id() {
        let mut bot = sample();
        assert_eq!(bot.app_id(), "bot-a1b2c3d4");
        bot.app_name = Some("greeter".to_string());
        assert_eq!(bot.app_id(), "greeter");
        assert_eq!(bot.image_tag(), "bot-a1b2c3d4:latest");
    }

    #[test]
    fn test_redacted_masks_secret_values() {
        let bot = sample().redacted();
        assert_ne!(bot.env_vars["BOT_TOKEN"], "123456:abcdefgh");
        assert_eq!(bot.env_vars["LOCALE"], "en");
        assert!(bot.auth_hash.is_empty());
    }
}
