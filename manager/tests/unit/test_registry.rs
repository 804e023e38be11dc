//! Bot registry persistence

use std::sync::Arc;

use chrono::Utc;

use botyard::errors::BotError;
use botyard::filesys::file::File;
use botyard::models::bot::{BotConfig, BotSource, BotStatus};
use botyard::storage::bots::BotStore;

fn bot(id: &str) -> BotConfig {
    BotConfig {
        id: id.to_string(),
        name: format!("bot {}", id),
        source: BotSource::Git {
            url: "https://example.com/bot.git".to_string(),
            branch: "main".to_string(),
        },
        status: BotStatus::Stopped,
        container_ids: Vec::new(),
        update_token: "token".to_string(),
        auth_hash: "hash".to_string(),
        env_vars: Default::default(),
        detected: None,
        app_name: None,
        has_started: false,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_insert_get_remove() {
    let tmp = tempfile::tempdir().unwrap();
    let store = BotStore::new(File::new(tmp.path().join("bots.json")));

    assert!(store.list().await.unwrap().is_empty());
    store.insert(bot("a")).await.unwrap();
    assert!(matches!(
        store.insert(bot("a")).await,
        Err(BotError::Conflict(_))
    ));

    // A second store over the same file sees the same registry
    let reopened = BotStore::new(File::new(tmp.path().join("bots.json")));
    assert_eq!(reopened.require("a").await.unwrap().name, "bot a");

    assert!(store.remove("a").await.unwrap().is_some());
    assert!(store.remove("a").await.unwrap().is_none());
    assert!(matches!(
        store.require("a").await,
        Err(BotError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stopped_status_clears_containers() {
    let tmp = tempfile::tempdir().unwrap();
    let store = BotStore::new(File::new(tmp.path().join("bots.json")));
    store.insert(bot("a")).await.unwrap();

    store
        .update("a", |b| {
            b.status = BotStatus::Running;
            b.container_ids = vec!["c1".to_string()];
        })
        .await
        .unwrap();

    let updated = store
        .update_status("a", BotStatus::Stopped, None)
        .await
        .unwrap();
    assert!(updated.container_ids.is_empty());

    let failed = store
        .update_status("a", BotStatus::Error, Some("boom".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_concurrent_updates_are_not_lost() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(BotStore::new(File::new(tmp.path().join("bots.json"))));
    store.insert(bot("a")).await.unwrap();
    store.insert(bot("b")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let id = if i % 2 == 0 { "a" } else { "b" };
        tasks.push(tokio::spawn(async move {
            store
                .update(id, move |b| {
                    b.env_vars.insert(format!("K{}", i), i.to_string());
                })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(store.require("a").await.unwrap().env_vars.len(), 10);
    assert_eq!(store.require("b").await.unwrap().env_vars.len(), 10);
}

#[tokio::test]
async fn test_unknown_bot_update_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let store = BotStore::new(File::new(tmp.path().join("bots.json")));
    let err = store.update("missing", |_| {}).await.unwrap_err();
    assert!(matches!(err, BotError::NotFound(_)));
}
