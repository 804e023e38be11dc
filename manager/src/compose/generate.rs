//! Compose documents for bots that do not ship one

use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::compose::document::{ComposeDocument, METADATA_KEY};
use crate::compose::transform::DATA_SENTINEL;
use crate::errors::BotError;
use crate::models::bot::{BotConfig, BotSource};

/// Name of the generated application service
pub const BOT_SERVICE: &str = "bot";
/// Name of the generated database sidecar
pub const DB_SERVICE: &str = "db";

pub const DB_IMAGE: &str = "postgres:16-alpine";
pub const DB_USER: &str = "bot";
pub const DB_PASSWORD: &str = "botpass";
pub const DB_NAME: &str = "bot";
pub const DB_VOLUME: &str = "db-data";

/// Connection string the bot service receives when a sidecar is generated
pub fn database_url() -> String {
    format!(
        "postgresql://{}:{}@{}:5432/{}",
        DB_USER, DB_PASSWORD, DB_SERVICE, DB_NAME
    )
}

fn map<const N: usize>(pairs: [(&str, Value); N]) -> Mapping {
    pairs
        .into_iter()
        .map(|(k, v)| (Value::from(k), v))
        .collect()
}

fn strings(items: &[&str]) -> Value {
    Value::Sequence(items.iter().map(|s| Value::from(*s)).collect())
}

/// Synthesize a single-service document for `bot`.
///
/// Git bots build from `repo_dir`; image bots run their image. A postgres
/// sidecar is added when `with_database` is set.
pub fn generate_document(
    bot: &BotConfig,
    app_id: &str,
    repo_dir: &Path,
    with_database: bool,
) -> Result<ComposeDocument, BotError> {
    let mut service = Mapping::new();
    match &bot.source {
        BotSource::Git { .. } => {
            service.insert(
                Value::from("build"),
                Value::Mapping(map([
                    ("context", Value::from(repo_dir.display().to_string())),
                    ("dockerfile", Value::from("Dockerfile")),
                ])),
            );
            service.insert(Value::from("image"), Value::from(bot.image_tag()));
        }
        BotSource::Image { image_ref } => {
            service.insert(Value::from("image"), Value::from(image_ref.as_str()));
        }
    }
    service.insert(Value::from("restart"), Value::from("unless-stopped"));

    let mut environment: Mapping = bot
        .env_vars
        .iter()
        .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
        .collect();
    if with_database && !bot.env_vars.contains_key("DATABASE_URL") {
        environment.insert(Value::from("DATABASE_URL"), Value::from(database_url()));
    }
    service.insert(Value::from("environment"), Value::Mapping(environment));

    let data_dir = format!("{}/{}/data:/app/data", DATA_SENTINEL, app_id);
    service.insert(Value::from("volumes"), strings(&[&data_dir]));

    let mut services = Mapping::new();
    if with_database {
        service.insert(Value::from("depends_on"), strings(&[DB_SERVICE]));
        services.insert(Value::from(BOT_SERVICE), Value::Mapping(service));
        services.insert(Value::from(DB_SERVICE), Value::Mapping(database_service()));
    } else {
        services.insert(Value::from(BOT_SERVICE), Value::Mapping(service));
    }

    let mut metadata = map([
        ("main", Value::from(BOT_SERVICE)),
        ("title", Value::from(bot.name.as_str())),
    ]);
    if bot.is_git() {
        metadata.insert(Value::from("build"), Value::from(BOT_SERVICE));
    }

    let mut root = map([
        ("name", Value::from(app_id)),
        ("services", Value::Mapping(services)),
    ]);
    if with_database {
        root.insert(
            Value::from("volumes"),
            Value::Mapping(map([(DB_VOLUME, Value::Mapping(Mapping::new()))])),
        );
    }
    root.insert(Value::from(METADATA_KEY), Value::Mapping(metadata));

    ComposeDocument::from_mapping(root)
}

fn database_service() -> Mapping {
    map([
        ("image", Value::from(DB_IMAGE)),
        ("restart", Value::from("unless-stopped")),
        (
            "environment",
            Value::Mapping(map([
                ("POSTGRES_USER", Value::from(DB_USER)),
                ("POSTGRES_PASSWORD", Value::from(DB_PASSWORD)),
                ("POSTGRES_DB", Value::from(DB_NAME)),
            ])),
        ),
        (
            "volumes",
            strings(&[&format!("{}:/var/lib/postgresql/data", DB_VOLUME)]),
        ),
    ])
}
