//! Compose document transform pipeline

use std::path::PathBuf;

use botyard::compose::document::ComposeDocument;
use botyard::compose::transform::{
    apply_all, ports_to_expose, rewrite_host_paths, TransformContext, DATA_SENTINEL, LABEL_BOT_ID,
    LABEL_MANAGED_BY,
};

const DOCUMENT: &str = r#"
name: relay
services:
  web:
    build:
      context: ./web
    ports:
      - "8080:80"
      - target: 443
        published: 8443
      - "9000"
    volumes:
      - /DATA/AppData/relay/config:/config:ro
      - type: bind
        source: /DATA/AppData/relay/cache
        target: /cache
      - /srv/other:/other
      - cache:/var/cache
    labels:
      botyard.managed-by: someone-else
  worker:
    image: redis:7
    environment:
      - PUID=33
volumes:
  cache: {}
x-casaos:
  main: web
  build: web
  icon: https://example.com/icon.png
"#;

fn ctx() -> TransformContext {
    TransformContext {
        app_id: "relay".to_string(),
        bot_id: "b1".to_string(),
        bot_name: "Relay".to_string(),
        puid: 1000,
        pgid: 1000,
        data_root: PathBuf::from("/srv/bots"),
        network_name: "botyard".to_string(),
        repo_dir: Some(PathBuf::from("/var/lib/botyard/bots/b1/repo")),
        image_tag: "bot-b1:latest".to_string(),
    }
}

#[test]
fn test_apply_all_transforms_document() {
    let mut doc = ComposeDocument::parse(DOCUMENT).unwrap();
    let report = apply_all(&mut doc, &ctx()).unwrap();
    assert_eq!(report.main_service.as_deref(), Some("web"));
    assert_eq!(report.build_target.as_deref(), Some("web"));
    assert_eq!(report.rewritten_paths, 2);

    let web = doc.service_spec("web").unwrap();
    assert!(web.ports.is_empty());
    assert_eq!(web.expose, vec!["80", "443", "9000"]);
    assert_eq!(web.volumes[0].source(), Some("/srv/bots/relay/config"));
    assert!(web.volumes[0].read_only());
    assert_eq!(web.volumes[1].source(), Some("/srv/bots/relay/cache"));
    assert_eq!(web.volumes[2].source(), Some("/srv/other"));
    assert_eq!(web.volumes[3].named_volume(), Some("cache"));
    assert_eq!(web.networks, vec!["default", "botyard"]);
    assert_eq!(web.hostname.as_deref(), Some("relay"));
    assert_eq!(web.image.as_deref(), Some("bot-b1:latest"));
    assert_eq!(
        web.build.unwrap().context,
        "/var/lib/botyard/bots/b1/repo/web"
    );

    // Existing labels are kept, missing ones added, icon always set
    let labels = &web.labels;
    assert!(labels.contains(&(LABEL_MANAGED_BY.to_string(), "someone-else".to_string())));
    assert!(labels.contains(&(LABEL_BOT_ID.to_string(), "b1".to_string())));
    assert!(labels.contains(&("icon".to_string(), "https://example.com/icon.png".to_string())));

    // Only the main service joins the platform network
    let worker = doc.service_spec("worker").unwrap();
    assert!(worker.networks.is_empty());
    let env = worker.environment.pairs();
    assert!(env.contains(&("PUID".to_string(), Some("33".to_string()))));
    assert!(env.contains(&("PGID".to_string(), Some("1000".to_string()))));
    assert!(worker.labels.contains(&(LABEL_BOT_ID.to_string(), "b1".to_string())));
}

#[test]
fn test_apply_all_is_idempotent() {
    let mut doc = ComposeDocument::parse(DOCUMENT).unwrap();
    apply_all(&mut doc, &ctx()).unwrap();
    let once = doc.to_yaml().unwrap();

    let report = apply_all(&mut doc, &ctx()).unwrap();
    assert_eq!(report.rewritten_paths, 0);
    assert_eq!(doc.to_yaml().unwrap(), once);

    // Also stable across a serialise/parse cycle
    let mut reparsed = ComposeDocument::parse(&once).unwrap();
    apply_all(&mut reparsed, &ctx()).unwrap();
    assert_eq!(reparsed.to_yaml().unwrap(), once);
}

#[test]
fn test_host_paths_only_rebased_under_sentinel() {
    let text = r#"
services:
  app:
    image: a
    volumes:
      - /DATA/AppData:/all
      - /DATA/AppDataOther/x:/x
      - ./relative:/r
"#;
    let mut doc = ComposeDocument::parse(text).unwrap();
    let changed = rewrite_host_paths(&mut doc, DATA_SENTINEL, &PathBuf::from("/srv/bots/"));
    assert_eq!(changed, 1);

    let app = doc.service_spec("app").unwrap();
    let sources: Vec<_> = app.volumes.iter().map(|v| v.source()).collect();
    assert_eq!(
        sources,
        vec![Some("/srv/bots"), Some("/DATA/AppDataOther/x"), Some("./relative")]
    );
}

#[test]
fn test_local_build_without_repository_is_rejected() {
    let mut doc = ComposeDocument::parse(DOCUMENT).unwrap();
    let mut ctx = ctx();
    ctx.repo_dir = None;
    assert!(apply_all(&mut doc, &ctx).unwrap_err().is_validation());
}

#[test]
fn test_ports_sharing_a_container_port_collapse() {
    let mut doc = ComposeDocument::parse(
        "services:\n  app:\n    image: a\n    ports: [\"8080:80\", \"8081:80\", \"443\"]\n",
    )
    .unwrap();
    ports_to_expose(&mut doc).unwrap();

    let app = doc.service_spec("app").unwrap();
    assert!(app.ports.is_empty());
    assert_eq!(app.expose, vec!["80".to_string(), "443".to_string()]);
}
