//! Variable resolution and substitution

use std::collections::BTreeMap;

use chrono::Utc;
use secrecy::SecretString;

use botyard::compose::document::ComposeDocument;
use botyard::compose::variables::{
    build_variables, ensure_identity_tokens, missing_required, substitute_document,
    validate_required, IdentityTokens, AUTH_TOKEN_SECRET,
};
use botyard::models::bot::{BotConfig, BotSource, BotStatus};
use botyard::storage::credentials::{CredentialStore, MemoryCredentialStore};
use botyard::storage::settings::PlatformSettings;

fn bot(env: &[(&str, &str)]) -> BotConfig {
    BotConfig {
        id: "b1".to_string(),
        name: "echo".to_string(),
        source: BotSource::Image {
            image_ref: "alpine".to_string(),
        },
        status: BotStatus::Stopped,
        container_ids: Vec::new(),
        update_token: String::new(),
        auth_hash: String::new(),
        env_vars: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        detected: None,
        app_name: Some("echo".to_string()),
        has_started: false,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn tokens() -> IdentityTokens {
    IdentityTokens {
        auth_token: SecretString::from("auth-secret".to_string()),
        api_token: SecretString::from("api-secret".to_string()),
    }
}

#[test]
fn test_bot_env_wins_over_platform_values() {
    let bot = bot(&[("TZ", "Europe/Berlin"), ("BOT_TOKEN", "t")]);
    let platform = PlatformSettings::default();
    let vars = build_variables(&bot, &tokens(), &platform);

    assert_eq!(vars["TZ"], "Europe/Berlin");
    assert_eq!(vars["AppID"], "echo");
    assert_eq!(vars["BOT_TOKEN"], "t");
    assert_eq!(vars[AUTH_TOKEN_SECRET], "auth-secret");
    assert_eq!(vars["PUID"], platform.puid.to_string());
}

#[test]
fn test_missing_required_only_counts_referenced_names() {
    let text = "services:\n  bot:\n    environment:\n      T: ${DISCORD_TOKEN}\n";
    assert_eq!(missing_required(text, &bot(&[])), vec!["DISCORD_TOKEN"]);
    assert!(missing_required(text, &bot(&[("DISCORD_TOKEN", "x")])).is_empty());

    // Blank values do not count as set
    let err = validate_required(text, &bot(&[("DISCORD_TOKEN", "  ")])).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("DISCORD_TOKEN"));
}

#[test]
fn test_substituted_values_keep_document_structure() {
    let text = r#"
services:
  bot:
    image: alpine
    command: ["run", "$MODE"]
    environment:
      A: ${A}
      B: ${B}
      C: ${C}
      D: ${D}
      E: ${E}
"#;
    let mut vars = BTreeMap::new();
    vars.insert("MODE".to_string(), "fast".to_string());
    vars.insert("A".to_string(), "x: y".to_string());
    vars.insert("B".to_string(), "value # not a comment".to_string());
    vars.insert("C".to_string(), String::new());
    vars.insert("D".to_string(), "true".to_string());
    vars.insert("E".to_string(), "123".to_string());

    let mut doc = ComposeDocument::parse(text).unwrap();
    substitute_document(&mut doc, &vars);

    // Reparse the emitted YAML: every value comes back as the same string
    let reparsed = ComposeDocument::parse(&doc.to_yaml().unwrap()).unwrap();
    let spec = reparsed.service_spec("bot").unwrap();
    let env: BTreeMap<_, _> = spec.environment.pairs().into_iter().collect();
    for (key, expected) in [
        ("A", "x: y"),
        ("B", "value # not a comment"),
        ("C", ""),
        ("D", "true"),
        ("E", "123"),
    ] {
        assert_eq!(env[key].as_deref(), Some(expected), "{}", key);
    }
    assert_eq!(spec.command.unwrap().argv(), vec!["run", "fast"]);
}

#[test]
fn test_substitution_is_idempotent() {
    let text = r#"
name: ${AppID}
services:
  bot:
    image: alpine
    environment:
      TOKEN: ${BOT_TOKEN}
      LEFT: ${NOT_DEFINED}
    volumes:
      - /DATA/AppData/$AppID/data:/data
"#;
    let vars = build_variables(&bot(&[("BOT_TOKEN", "abc")]), &tokens(), &PlatformSettings::default());

    let mut once = ComposeDocument::parse(text).unwrap();
    substitute_document(&mut once, &vars);
    let mut twice = once.clone();
    substitute_document(&mut twice, &vars);

    assert_eq!(once, twice);
    assert_eq!(once.project_name().as_deref(), Some("echo"));
}

#[test]
fn test_mapping_keys_are_substituted_in_place() {
    let text = r#"
services:
  bot:
    image: alpine
    environment:
      FIRST: "1"
      ${PREFIX}_MODE: fast
      LAST: "3"
"#;
    let vars = BTreeMap::from([("PREFIX".to_string(), "ECHO".to_string())]);
    let mut doc = ComposeDocument::parse(text).unwrap();
    substitute_document(&mut doc, &vars);

    let spec = doc.service_spec("bot").unwrap();
    let keys: Vec<String> = spec.environment.pairs().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["FIRST", "ECHO_MODE", "LAST"]);
}

#[tokio::test]
async fn test_identity_tokens_are_stable() {
    let store = MemoryCredentialStore::new();
    let first = ensure_identity_tokens(store.as_ref(), "b1").await.unwrap();
    let second = ensure_identity_tokens(store.as_ref(), "b1").await.unwrap();

    use secrecy::ExposeSecret;
    assert_eq!(
        first.auth_token.expose_secret(),
        second.auth_token.expose_secret()
    );
    assert_ne!(
        first.auth_token.expose_secret(),
        first.api_token.expose_secret()
    );
    assert!(store.get("b1", AUTH_TOKEN_SECRET).await.unwrap().is_some());
}
