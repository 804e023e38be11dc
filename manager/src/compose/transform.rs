//! Structural transforms applied to every bot's compose document
//!
//! Each operation mutates the parsed tree in place and is idempotent: running
//! it a second time leaves the document unchanged.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::compose::document::ComposeDocument;
use crate::compose::schema::{scalar_to_string, BuildSpec, PortEntry};
use crate::errors::BotError;

/// Host prefix that documents use for app data, rebased onto the data root
pub const DATA_SENTINEL: &str = "/DATA/AppData";

/// Label keys every managed container carries
pub const LABEL_MANAGED_BY: &str = "botyard.managed-by";
pub const LABEL_BOT_ID: &str = "botyard.bot-id";
pub const LABEL_BOT_NAME: &str = "botyard.bot-name";
pub const MANAGED_BY_VALUE: &str = "botyard";

/// Inputs of the transform pipeline
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub app_id: String,
    pub bot_id: String,
    pub bot_name: String,
    pub puid: u32,
    pub pgid: u32,
    pub data_root: PathBuf,
    pub network_name: String,
    /// Checkout used as build context for the build target
    pub repo_dir: Option<PathBuf>,
    pub image_tag: String,
}

/// What the pipeline decided while transforming
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub main_service: Option<String>,
    pub build_target: Option<String>,
    pub rewritten_paths: usize,
}

/// Run every transform in order
pub fn apply_all(
    document: &mut ComposeDocument,
    ctx: &TransformContext,
) -> Result<TransformReport, BotError> {
    let rewritten_paths = rewrite_host_paths(document, DATA_SENTINEL, &ctx.data_root);
    inject_network(document, &ctx.network_name);
    inject_identity_env(document, ctx.puid, ctx.pgid);
    ports_to_expose(document)?;
    set_hostname_and_icon(document, &ctx.app_id);
    inject_labels(
        document,
        &[
            (LABEL_MANAGED_BY, MANAGED_BY_VALUE),
            (LABEL_BOT_ID, &ctx.bot_id),
            (LABEL_BOT_NAME, &ctx.bot_name),
        ],
    );

    let build_target = build_target(document)?;
    if let Some(target) = &build_target {
        let repo_dir = ctx.repo_dir.as_deref().ok_or_else(|| {
            BotError::ValidationError(format!(
                "Service '{}' is marked for a local build but the bot has no repository",
                target
            ))
        })?;
        substitute_build_target(document, target, repo_dir, &ctx.image_tag)?;
    }

    Ok(TransformReport {
        main_service: document.main_service(),
        build_target,
        rewritten_paths,
    })
}

/// Compose project name: the document's own `name` when usable, else
/// `default`. A name still holding a placeholder is not usable. The chosen
/// name is written back to the document.
pub fn resolve_app_id(document: &mut ComposeDocument, default: &str) -> String {
    let app_id = document
        .project_name()
        .filter(|name| !name.contains('$'))
        .map(|name| sanitize_project_name(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| default.to_string());
    document.set_project_name(&app_id);
    app_id
}

/// Lowercase and restrict to letters, digits and `-`. Underscores are
/// replaced too, since `<app>_` prefixes the app's volumes and networks.
pub fn sanitize_project_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Rebase `source` from `sentinel` onto `data_root` if it lies under the sentinel
pub fn rebase_host_path(source: &str, sentinel: &str, data_root: &str) -> Option<String> {
    let data_root = data_root.trim_end_matches('/');
    if source == data_root || source.starts_with(&format!("{}/", data_root)) {
        return None;
    }
    if source == sentinel {
        return Some(data_root.to_string());
    }
    source
        .strip_prefix(sentinel)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| format!("{}{}", data_root, rest))
}

/// Rewrite sentinel-prefixed volume sources to the data root.
///
/// Returns the number of entries changed.
pub fn rewrite_host_paths(document: &mut ComposeDocument, sentinel: &str, data_root: &Path) -> usize {
    let data_root = data_root.display().to_string();
    let mut changed = 0;

    for service in document.services_mut() {
        let Some(Value::Sequence(volumes)) = service.get_mut("volumes") else {
            continue;
        };
        for entry in volumes.iter_mut() {
            match entry {
                Value::String(spec) => {
                    let rewritten = spec.split_once(':').and_then(|(source, rest)| {
                        rebase_host_path(source, sentinel, &data_root)
                            .map(|rebased| format!("{}:{}", rebased, rest))
                    });
                    if let Some(rewritten) = rewritten {
                        *spec = rewritten;
                        changed += 1;
                    }
                }
                Value::Mapping(long) => {
                    let Some(Value::String(source)) = long.get_mut("source") else {
                        continue;
                    };
                    if let Some(rebased) = rebase_host_path(source, sentinel, &data_root) {
                        *source = rebased;
                        changed += 1;
                    }
                }
                _ => {}
            }
        }
    }

    if changed > 0 {
        debug!("Rebased {} volume sources onto {}", changed, data_root);
    }
    changed
}

/// Join the main service to the external platform network.
///
/// Returns false when the main service uses a non-bridge network mode.
pub fn inject_network(document: &mut ComposeDocument, network: &str) -> bool {
    let Some(main) = document.main_service() else {
        return false;
    };
    let Some(service) = document.service_mut(&main) else {
        return false;
    };

    if let Some(mode) = service.get("network_mode").and_then(scalar_to_string) {
        if mode != "bridge" {
            debug!("Service {} uses network_mode {}, not joining {}", main, mode, network);
            return false;
        }
        // compose rejects network_mode together with networks
        service.shift_remove("network_mode");
    }

    match service.get_mut("networks") {
        Some(Value::Sequence(networks)) => {
            if !networks.iter().any(|n| n.as_str() == Some(network)) {
                networks.push(Value::from(network));
            }
        }
        Some(Value::Mapping(networks)) => {
            if !networks.contains_key(network) {
                networks.insert(Value::from(network), Value::Null);
            }
        }
        _ => {
            service.insert(
                Value::from("networks"),
                Value::Sequence(vec![Value::from("default"), Value::from(network)]),
            );
        }
    }

    let top_level = document.top_level_mut("networks");
    if !top_level.contains_key(network) {
        let mut definition = Mapping::new();
        definition.insert(Value::from("external"), Value::Bool(true));
        top_level.insert(Value::from(network), Value::Mapping(definition));
    }
    true
}

/// Give every service PUID/PGID unless it already sets them
pub fn inject_identity_env(document: &mut ComposeDocument, puid: u32, pgid: u32) {
    let ids = [("PUID", puid.to_string()), ("PGID", pgid.to_string())];

    for service in document.services_mut() {
        let environment = service
            .entry(Value::from("environment"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if environment.is_null() {
            *environment = Value::Mapping(Mapping::new());
        }

        match environment {
            Value::Sequence(items) => {
                for (key, value) in &ids {
                    let present = items.iter().any(|item| {
                        item.as_str()
                            .map(|s| s.split('=').next().unwrap_or(s))
                            .map(|k| k.eq_ignore_ascii_case(key))
                            .unwrap_or(false)
                    });
                    if !present {
                        items.push(Value::from(format!("{}={}", key, value)));
                    }
                }
            }
            Value::Mapping(map) => {
                for (key, value) in &ids {
                    let present = map.keys().any(|k| {
                        k.as_str()
                            .map(|k| k.eq_ignore_ascii_case(key))
                            .unwrap_or(false)
                    });
                    if !present {
                        map.insert(Value::from(*key), Value::from(value.clone()));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Replace `ports` with a deduplicated `expose` list of container ports
pub fn ports_to_expose(document: &mut ComposeDocument) -> Result<(), BotError> {
    for service in document.services_mut() {
        let Some(ports) = service.shift_remove("ports") else {
            continue;
        };

        let mut expose: Vec<String> = match service.get("expose") {
            Some(Value::Sequence(existing)) => existing.iter().filter_map(scalar_to_string).collect(),
            _ => Vec::new(),
        };

        let entries = match ports {
            Value::Sequence(entries) => entries,
            Value::Null => Vec::new(),
            _ => {
                return Err(BotError::ComposeError(
                    "ports must be a list".to_string(),
                ))
            }
        };
        for entry in &entries {
            let port = PortEntry::parse("ports", entry)?.container_port();
            expose.push(port);
        }

        let mut seen = std::collections::HashSet::new();
        expose.retain(|port| seen.insert(port.clone()));

        if !expose.is_empty() {
            service.insert(
                Value::from("expose"),
                Value::Sequence(expose.into_iter().map(Value::from).collect()),
            );
        }
    }
    Ok(())
}

/// Main service hostname becomes the app id; the metadata icon becomes a label
pub fn set_hostname_and_icon(document: &mut ComposeDocument, app_id: &str) {
    let Some(main) = document.main_service() else {
        return;
    };
    let icon = document.metadata_str("icon");
    let Some(service) = document.service_mut(&main) else {
        return;
    };

    service.insert(Value::from("hostname"), Value::from(app_id));
    if let Some(icon) = icon {
        set_label(service, "icon", &icon, true);
    }
}

/// Add the given labels to every service that does not carry them yet
pub fn inject_labels(document: &mut ComposeDocument, labels: &[(&str, &str)]) {
    for service in document.services_mut() {
        for (key, value) in labels {
            set_label(service, key, value, false);
        }
    }
}

fn set_label(service: &mut Mapping, key: &str, value: &str, overwrite: bool) {
    let labels = service
        .entry(Value::from("labels"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if labels.is_null() {
        *labels = Value::Mapping(Mapping::new());
    }

    match labels {
        Value::Mapping(map) => {
            if overwrite || !map.contains_key(key) {
                map.insert(Value::from(key), Value::from(value));
            }
        }
        Value::Sequence(items) => {
            let prefix = format!("{}=", key);
            let position = items.iter().position(|item| {
                item.as_str()
                    .map(|s| s == key || s.starts_with(&prefix))
                    .unwrap_or(false)
            });
            match position {
                Some(index) if overwrite => items[index] = Value::from(format!("{}{}", prefix, value)),
                Some(_) => {}
                None => items.push(Value::from(format!("{}{}", prefix, value))),
            }
        }
        _ => {}
    }
}

/// Service the metadata marks for a local build, if any
pub fn build_target(document: &ComposeDocument) -> Result<Option<String>, BotError> {
    match document.metadata_str("build") {
        None => Ok(None),
        Some(name) if name.trim().is_empty() => Ok(None),
        Some(name) if document.has_service(&name) => Ok(Some(name)),
        Some(name) => Err(BotError::ValidationError(format!(
            "Build target '{}' is not a service of the document",
            name
        ))),
    }
}

/// Point the build target at the checkout and tag the result with `image_tag`
pub fn substitute_build_target(
    document: &mut ComposeDocument,
    service_name: &str,
    repo_dir: &Path,
    image_tag: &str,
) -> Result<(), BotError> {
    let service = document.service_mut(service_name).ok_or_else(|| {
        BotError::ComposeError(format!("unknown service '{}'", service_name))
    })?;

    let existing = match service.get("build") {
        Some(value) => Some(BuildSpec::parse(service_name, value)?),
        None => None,
    };
    let context = match existing.as_ref().map(|b| b.context.as_str()) {
        Some(context) => rebase_build_context(repo_dir, context),
        None => repo_dir.to_path_buf(),
    };
    let dockerfile = existing
        .and_then(|b| b.dockerfile)
        .unwrap_or_else(|| "Dockerfile".to_string());

    let context = Value::from(context.display().to_string());
    match service.get_mut("build") {
        Some(Value::Mapping(build)) => {
            build.insert(Value::from("context"), context);
            build.insert(Value::from("dockerfile"), Value::from(dockerfile));
        }
        _ => {
            let mut build = Mapping::new();
            build.insert(Value::from("context"), context);
            build.insert(Value::from("dockerfile"), Value::from(dockerfile));
            service.insert(Value::from("build"), Value::Mapping(build));
        }
    }
    service.insert(Value::from("image"), Value::from(image_tag));
    Ok(())
}

/// Resolve a build context relative to the checkout
fn rebase_build_context(repo_dir: &Path, context: &str) -> PathBuf {
    let context = context.trim();
    let path = Path::new(context);
    if path.is_absolute() && path.starts_with(repo_dir) {
        return path.to_path_buf();
    }
    let relative = context.trim_start_matches("./").trim_start_matches('/');
    if relative.is_empty() || relative == "." {
        repo_dir.to_path_buf()
    } else {
        repo_dir.join(relative)
    }
}
