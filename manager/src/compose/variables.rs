//! Substitution variables for compose documents
//!
//! Placeholders are `${NAME}` or `$NAME` (where the next character is not part
//! of an identifier). `$$` is an escaped dollar and is left for compose to
//! unescape. Placeholders without a value are left verbatim.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::compose::document::ComposeDocument;
use crate::errors::BotError;
use crate::models::bot::BotConfig;
use crate::storage::credentials::CredentialStore;
use crate::storage::settings::PlatformSettings;
use crate::utils::random_token;

/// Secret names under which identity tokens are persisted
pub const AUTH_TOKEN_SECRET: &str = "AUTH_TOKEN";
pub const API_TOKEN_SECRET: &str = "API_TOKEN";

/// Variables a document may reference that the user has to supply
pub const REQUIRED_VARIABLES: &[&str] = &["BOT_TOKEN", "DISCORD_TOKEN", "TELEGRAM_BOT_TOKEN"];

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("placeholder pattern is valid")
});

/// Per-bot tokens generated once and reused for every build
#[derive(Clone)]
pub struct IdentityTokens {
    pub auth_token: SecretString,
    pub api_token: SecretString,
}

impl std::fmt::Debug for IdentityTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityTokens").finish_non_exhaustive()
    }
}

/// Load the bot's identity tokens, generating and persisting missing ones
pub async fn ensure_identity_tokens(
    store: &dyn CredentialStore,
    bot_id: &str,
) -> Result<IdentityTokens, BotError> {
    let auth_token = ensure_secret(store, bot_id, AUTH_TOKEN_SECRET).await?;
    let api_token = ensure_secret(store, bot_id, API_TOKEN_SECRET).await?;
    Ok(IdentityTokens {
        auth_token,
        api_token,
    })
}

async fn ensure_secret(
    store: &dyn CredentialStore,
    bot_id: &str,
    name: &str,
) -> Result<SecretString, BotError> {
    if let Some(existing) = store.get(bot_id, name).await? {
        return Ok(existing);
    }
    debug!("Generating {} for bot {}", name, bot_id);
    let token = SecretString::from(random_token(32));
    store.set(bot_id, name, token.clone()).await?;
    Ok(token)
}

/// Resolved variable map of a bot.
///
/// Platform values first, then identity tokens, then the bot's own
/// environment, which wins on conflict.
pub fn build_variables(
    bot: &BotConfig,
    tokens: &IdentityTokens,
    platform: &PlatformSettings,
) -> BTreeMap<String, String> {
    let app_id = bot.app_id();
    let data_root = platform.data_root.display().to_string();

    let mut vars = BTreeMap::new();
    vars.insert("AppID".to_string(), app_id.clone());
    vars.insert("BOT_ID".to_string(), bot.id.clone());
    vars.insert("BOT_NAME".to_string(), bot.name.clone());
    vars.insert("PUID".to_string(), platform.puid.to_string());
    vars.insert("PGID".to_string(), platform.pgid.to_string());
    vars.insert("TZ".to_string(), platform.tz.clone());
    vars.insert("DOMAIN".to_string(), platform.domain.clone());
    vars.insert("SCHEME".to_string(), platform.scheme.clone());
    vars.insert("PORT".to_string(), platform.port.to_string());
    vars.insert("DATA_ROOT".to_string(), data_root.clone());
    vars.insert(
        "APP_DATA".to_string(),
        format!("{}/{}", data_root.trim_end_matches('/'), app_id),
    );
    vars.insert("NETWORK".to_string(), platform.network_name.clone());
    vars.insert(
        AUTH_TOKEN_SECRET.to_string(),
        tokens.auth_token.expose_secret().to_string(),
    );
    vars.insert(
        API_TOKEN_SECRET.to_string(),
        tokens.api_token.expose_secret().to_string(),
    );

    for (key, value) in &bot.env_vars {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

/// Replace every placeholder that has a value, in one pass
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            match caps.get(1).or_else(|| caps.get(2)) {
                Some(name) => vars
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or_else(|| whole.to_string()),
                None => whole.to_string(),
            }
        })
        .into_owned()
}

/// Substitute inside every string scalar of a parsed document.
///
/// Values are inserted as opaque strings, so a substituted value can never
/// change the document's structure.
pub fn substitute_document(document: &mut ComposeDocument, vars: &BTreeMap<String, String>) {
    substitute_mapping(document.root_mut(), vars);
}

/// String keys are substituted too, keeping their position
fn substitute_mapping(mapping: &mut Mapping, vars: &BTreeMap<String, String>) {
    let keyed = mapping
        .keys()
        .any(|key| matches!(key, Value::String(s) if s.contains('$')));
    if keyed {
        for (mut key, value) in std::mem::take(mapping) {
            substitute_value(&mut key, vars);
            mapping.insert(key, value);
        }
    }
    for value in mapping.values_mut() {
        substitute_value(value, vars);
    }
}

fn substitute_value(value: &mut Value, vars: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = substitute(s, vars);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_value(item, vars);
            }
        }
        Value::Mapping(mapping) => substitute_mapping(mapping, vars),
        Value::Tagged(tagged) => substitute_value(&mut tagged.value, vars),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Names of all placeholders in `text`, without duplicates
pub fn extract_variables(text: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Required variables referenced by `text` that the bot does not set
pub fn missing_required(text: &str, bot: &BotConfig) -> Vec<String> {
    let referenced = extract_variables(text);
    REQUIRED_VARIABLES
        .iter()
        .filter(|name| referenced.contains(**name))
        .filter(|name| {
            bot.env_vars
                .get(**name)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|name| name.to_string())
        .collect()
}

/// Fail with a validation error naming every missing required variable
pub fn validate_required(text: &str, bot: &BotConfig) -> Result<(), BotError> {
    let missing = missing_required(text, bot);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BotError::ValidationError(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        )))
    }
}
