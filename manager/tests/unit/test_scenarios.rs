//! End-to-end lifecycle scenarios against the in-memory runtime

use std::collections::BTreeMap;

use botyard::buildlog::Severity;
use botyard::compose::document::ComposeDocument;
use botyard::compose::transform::LABEL_BOT_ID;
use botyard::deploy::lifecycle::NewBot;
use botyard::models::bot::{BotSource, BotStatus};
use botyard::platform::DeploymentTarget;
use botyard::storage::layout::COMPOSE_FILE_NAME;

use crate::fakes::{harness, FakeRepo};

const USER_COMPOSE: &str = r#"
name: Echo Bot
services:
  bot:
    build: .
    environment:
      TOKEN: ${BOT_TOKEN}
      GREETING: "hello: world"
      LEFT: ${NOT_DEFINED}
    volumes:
      - /DATA/AppData/$AppID/data:/app/data
    ports:
      - "8080:80/tcp"
x-casaos:
  main: bot
  build: bot
"#;

fn git_bot(env: &[(&str, &str)]) -> NewBot {
    NewBot {
        name: "echo".to_string(),
        source: BotSource::Git {
            url: "https://example.com/echo.git".to_string(),
            branch: String::new(),
        },
        env_vars: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn repo_with_compose() -> FakeRepo {
    FakeRepo::with_files(&[
        ("compose.yaml", USER_COMPOSE),
        ("Dockerfile", "FROM alpine\n"),
    ])
}

#[tokio::test]
async fn test_missing_required_variable_fails_build() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h.executor.create_bot(git_bot(&[])).await.unwrap();

    let outcome = h.executor.build(&bot.id).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("BOT_TOKEN"));

    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.status, BotStatus::Error);
    assert!(stored.last_error.unwrap().contains("BOT_TOKEN"));

    let log = h.executor.build_log(&bot.id);
    assert_eq!(log.last().unwrap().severity, Severity::Error);
    assert!(h.runtime.builds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_git_bot_build_start_stop_standalone() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "abc:def #1")]))
        .await
        .unwrap();

    let outcome = h.executor.build(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.status, BotStatus::Stopped);
    assert_eq!(stored.app_name.as_deref(), Some("echo-bot"));

    // The written document is the transformed one
    let text = h.layout.compose_file(&bot.id).read_string().await.unwrap();
    let doc = ComposeDocument::parse(&text).unwrap();
    let service = doc.service_spec("bot").unwrap();
    let env: BTreeMap<_, _> = service.environment.pairs().into_iter().collect();
    assert_eq!(env["TOKEN"].as_deref(), Some("abc:def #1"));
    assert_eq!(env["GREETING"].as_deref(), Some("hello: world"));
    assert_eq!(env["LEFT"].as_deref(), Some("${NOT_DEFINED}"));
    assert_eq!(env["PUID"].as_deref(), Some("1000"));

    let data_root = h.platform.data_root.display().to_string();
    assert_eq!(
        service.volumes[0].source(),
        Some(format!("{}/echo-bot/data", data_root).as_str())
    );
    assert!(service.ports.is_empty());
    assert_eq!(service.expose, vec!["80".to_string()]);
    assert!(service.networks.contains(&h.platform.network_name));
    assert_eq!(service.image.as_deref(), Some(bot.image_tag().as_str()));
    assert!(service
        .labels
        .contains(&(LABEL_BOT_ID.to_string(), bot.id.clone())));

    let builds = h.runtime.builds.lock().unwrap().clone();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].tag, bot.image_tag());
    assert_eq!(builds[0].context, h.layout.repo_dir(&bot.id).path().to_path_buf());

    // Start deploys the planned containers
    let outcome = h.executor.start(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.status, BotStatus::Running);
    assert_eq!(stored.container_ids.len(), 1);
    assert!(stored.has_started);
    assert_eq!(h.runtime.container_names(), vec!["echo-bot-bot-1".to_string()]);

    // Starting twice is rejected without touching the bot
    let outcome = h.executor.start(&bot.id).await;
    assert!(!outcome.success);
    assert_eq!(
        h.executor.get_bot(&bot.id).await.unwrap().status,
        BotStatus::Running
    );

    let outcome = h.executor.stop(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.status, BotStatus::Stopped);
    assert!(stored.container_ids.is_empty());
    assert!(h.runtime.container_names().is_empty());
}

#[tokio::test]
async fn test_image_bot_self_heals_and_registers_on_casaos() {
    let h = harness(DeploymentTarget::Casaos, FakeRepo::default()).await;
    let bot = h
        .executor
        .create_bot(NewBot {
            name: "relay".to_string(),
            source: BotSource::Image {
                image_ref: "ghcr.io/acme/relay:1.2".to_string(),
            },
            env_vars: BTreeMap::new(),
        })
        .await
        .unwrap();

    // No build ran yet: start builds first
    let outcome = h.executor.start(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.status, BotStatus::Running);
    let app_id = stored.app_id();
    assert_eq!(app_id, format!("bot-{}", bot.id));

    let published = h.platform.metadata_root.join(&app_id).join(COMPOSE_FILE_NAME);
    assert!(published.is_file());
    assert!(h.platform.data_root.join(&app_id).join("data").is_dir());
    assert_eq!(h.runtime.compose_ups.lock().unwrap().len(), 1);
    assert!(h.runtime.builds.lock().unwrap().is_empty());

    // Delete removes the platform registration too
    let outcome = h.executor.delete_bot(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert!(!published.exists());
    assert!(h.runtime.container_names().is_empty());
}

#[tokio::test]
async fn test_delete_continues_past_failed_container_removal() {
    let h = harness(
        DeploymentTarget::Standalone,
        FakeRepo::with_files(&[("package.json", r#"{"dependencies": {"pg": "8"}}"#)]),
    )
    .await;
    let bot = h.executor.create_bot(git_bot(&[])).await.unwrap();

    // Generated document with a database sidecar: two containers
    let outcome = h.executor.start(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.container_ids.len(), 2);
    assert!(h.layout.repo_dir(&bot.id).path().join("Dockerfile").is_file());

    let first = stored.container_ids[0].clone();
    h.runtime.failing_removals.lock().unwrap().insert(first.clone());

    let outcome = h.executor.delete_bot(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let attempts = h.runtime.removal_attempts.lock().unwrap().clone();
    for id in &stored.container_ids {
        assert!(attempts.contains(id), "no removal attempted for {}", id);
    }
    assert!(!h.layout.bot_dir(&bot.id).exists().await);
    assert!(h.executor.store().get(&bot.id).await.unwrap().is_none());
    assert!(!h.runtime.images.lock().unwrap().contains(&bot.image_tag()));
}

#[tokio::test]
async fn test_concurrent_starts_are_serialised() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "t")]))
        .await
        .unwrap();

    let (a, b) = tokio::join!(h.executor.start(&bot.id), h.executor.start(&bot.id));
    assert_eq!(
        [a.success, b.success].iter().filter(|s| **s).count(),
        1,
        "exactly one start should win: {:?} {:?}",
        a,
        b
    );
    assert_eq!(h.runtime.container_names().len(), 1);
    assert_eq!(
        h.executor.get_bot(&bot.id).await.unwrap().status,
        BotStatus::Running
    );
}

#[tokio::test]
async fn test_pull_rebuild_restores_running_state() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "t")]))
        .await
        .unwrap();
    assert!(h.executor.start(&bot.id).await.success);

    let outcome = h.executor.pull_rebuild(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    assert_eq!(h.repo.pulls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let builds = h.runtime.builds.lock().unwrap().clone();
    assert_eq!(builds.len(), 2);
    assert!(builds[1].no_cache);
    assert_eq!(
        h.executor.get_bot(&bot.id).await.unwrap().status,
        BotStatus::Running
    );
    assert_eq!(h.runtime.container_names().len(), 1);
}

#[tokio::test]
async fn test_reconcile_settles_interrupted_and_exited_bots() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let running = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "t")]))
        .await
        .unwrap();
    assert!(h.executor.start(&running.id).await.success);
    let container = h.executor.get_bot(&running.id).await.unwrap().container_ids[0].clone();
    h.runtime.set_state(&container, "exited");

    let interrupted = h.executor.create_bot(git_bot(&[])).await.unwrap();
    h.executor
        .store()
        .update_status(&interrupted.id, BotStatus::Building, None)
        .await
        .unwrap();

    let report = h.executor.reconcile().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.updated, 2);

    let running = h.executor.get_bot(&running.id).await.unwrap();
    assert_eq!(running.status, BotStatus::Error);
    assert!(running.container_ids.is_empty());

    let interrupted = h.executor.get_bot(&interrupted.id).await.unwrap();
    assert_eq!(interrupted.status, BotStatus::Error);
    assert!(interrupted.last_error.unwrap().contains("building"));
}

#[tokio::test]
async fn test_webhook_token_and_repo_status() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "t")]))
        .await
        .unwrap();

    assert!(h
        .executor
        .verify_update_token(&bot.id, &bot.update_token)
        .await
        .unwrap());
    assert!(!h.executor.verify_update_token(&bot.id, "nope").await.unwrap());

    // Not cloned yet
    assert!(h.executor.repo_status(&bot.id).await.is_err());
    assert!(h.executor.build(&bot.id).await.success);
    let status = h.executor.repo_status(&bot.id).await.unwrap();
    assert_eq!(status.info.branch, "main");
    assert_eq!(status.drift.behind, 2);
}

#[tokio::test]
async fn test_generated_document_for_repository_without_compose() {
    let h = harness(
        DeploymentTarget::Standalone,
        FakeRepo::with_files(&[("requirements.txt", "discord.py\n"), ("main.py", "print(1)\n")]),
    )
    .await;
    let bot = h.executor.create_bot(git_bot(&[])).await.unwrap();

    let outcome = h.executor.build(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    assert_eq!(stored.detected.as_ref().unwrap().language.as_deref(), Some("python"));

    let text = h.layout.compose_file(&bot.id).read_string().await.unwrap();
    let doc = ComposeDocument::parse(&text).unwrap();
    assert_eq!(doc.service_names(), vec!["bot".to_string()]);

    let service = doc.service_spec("bot").unwrap();
    assert_eq!(service.restart.as_deref(), Some("unless-stopped"));
    assert_eq!(
        service.build.unwrap().context,
        h.layout.repo_dir(&bot.id).path().display().to_string()
    );
    assert_eq!(service.volumes.len(), 1);
    assert_eq!(service.volumes[0].target(), "/app/data");
    assert_eq!(
        service.volumes[0].source(),
        Some(
            h.platform
                .data_root
                .join(stored.app_id())
                .join("data")
                .display()
                .to_string()
                .as_str()
        )
    );
    assert!(h.layout.repo_dir(&bot.id).path().join("Dockerfile").is_file());
}

#[tokio::test]
async fn test_build_target_named_in_metadata_is_built_locally() {
    let compose = r#"
services:
  worker:
    image: foo/bar:latest
  cache:
    image: redis:7
x-casaos:
  main: worker
  build: worker
"#;
    let h = harness(
        DeploymentTarget::Standalone,
        FakeRepo::with_files(&[("docker-compose.yml", compose), ("Dockerfile", "FROM alpine\n")]),
    )
    .await;
    let bot = h.executor.create_bot(git_bot(&[])).await.unwrap();

    let outcome = h.executor.build(&bot.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let text = h.layout.compose_file(&bot.id).read_string().await.unwrap();
    let doc = ComposeDocument::parse(&text).unwrap();
    let worker = doc.service_spec("worker").unwrap();
    assert_eq!(worker.image.as_deref(), Some(bot.image_tag().as_str()));
    assert_eq!(
        worker.build.unwrap().context,
        h.layout.repo_dir(&bot.id).path().display().to_string()
    );

    // Other services keep pulling their declared image
    let cache = doc.service_spec("cache").unwrap();
    assert_eq!(cache.image.as_deref(), Some("redis:7"));
    assert!(cache.build.is_none());

    let builds = h.runtime.builds.lock().unwrap().clone();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].tag, bot.image_tag());
}

#[tokio::test]
async fn test_bots_sharing_a_compose_name_get_distinct_app_ids() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let first = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "a")]))
        .await
        .unwrap();
    let second = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "b")]))
        .await
        .unwrap();

    assert!(h.executor.start(&first.id).await.success);
    assert!(h.executor.start(&second.id).await.success);

    let first_app = h.executor.get_bot(&first.id).await.unwrap().app_id();
    let second_app = h.executor.get_bot(&second.id).await.unwrap().app_id();
    assert_eq!(first_app, "echo-bot");
    assert_eq!(second_app, format!("echo-bot-{}", second.id));

    // Rebuilding keeps the id already claimed
    assert!(h.executor.stop(&first.id).await.success);
    assert!(h.executor.build(&first.id).await.success);
    assert_eq!(
        h.executor.get_bot(&first.id).await.unwrap().app_id(),
        "echo-bot"
    );
    assert!(h.executor.start(&first.id).await.success);
    assert_eq!(h.runtime.container_names().len(), 2);

    let outcome = h.executor.delete_bot(&first.id).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let survivor = h.executor.get_bot(&second.id).await.unwrap();
    assert_eq!(survivor.status, BotStatus::Running);
    assert_eq!(
        h.runtime.container_names(),
        vec![format!("echo-bot-{}-bot-1", second.id)]
    );
    let containers = h.executor.discover_containers(&survivor).await.unwrap();
    assert_eq!(containers.len(), 1);

    // The suffixed id sticks even once the plain one is free
    assert!(h.executor.stop(&second.id).await.success);
    assert!(h.executor.build(&second.id).await.success);
    assert_eq!(
        h.executor.get_bot(&second.id).await.unwrap().app_id(),
        second_app
    );
}

#[tokio::test]
async fn test_delete_leaves_containers_with_a_longer_app_prefix() {
    let h = harness(DeploymentTarget::Casaos, repo_with_compose()).await;
    let bot = h
        .executor
        .create_bot(git_bot(&[("BOT_TOKEN", "t")]))
        .await
        .unwrap();
    assert!(h.executor.start(&bot.id).await.success);

    // Same name prefix, different compose project
    h.runtime.insert(
        "echo-bot-dev-bot-1",
        "someone/else",
        &[(
            "com.docker.compose.project".to_string(),
            "echo-bot-dev".to_string(),
        )],
        "running",
    );

    let stored = h.executor.get_bot(&bot.id).await.unwrap();
    let owned = h.executor.discover_containers(&stored).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].name, "echo-bot-bot-1");

    assert!(h.executor.delete_bot(&bot.id).await.success);
    assert_eq!(
        h.runtime.container_names(),
        vec!["echo-bot-dev-bot-1".to_string()]
    );
}

#[tokio::test]
async fn test_second_build_starts_a_fresh_log() {
    let h = harness(DeploymentTarget::Standalone, repo_with_compose()).await;
    let bot = h.executor.create_bot(git_bot(&[])).await.unwrap();

    assert!(!h.executor.build(&bot.id).await.success);
    let first = h.executor.build_log(&bot.id);
    assert!(first.iter().any(|e| e.message.contains("BOT_TOKEN")));

    let vars = BTreeMap::from([("BOT_TOKEN".to_string(), "t".to_string())]);
    h.executor.update_env(&bot.id, vars, false).await.unwrap();
    assert!(h.executor.build(&bot.id).await.success);

    let second = h.executor.build_log(&bot.id);
    assert!(!second.is_empty());
    assert!(second.iter().all(|e| e.severity != Severity::Error));
    assert!(!second.iter().any(|e| e.message.contains("BOT_TOKEN")));
}
