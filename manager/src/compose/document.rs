//! Compose document model

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::compose::schema::{scalar_to_string, ServiceSpec};
use crate::errors::BotError;

/// Platform metadata extension key
pub const METADATA_KEY: &str = "x-casaos";

/// Compose file names looked up in a repository, in order of preference
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// First compose file present in `dir`, if any
pub async fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    for name in DEFAULT_COMPOSE_FILES {
        let candidate = dir.join(name);
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    None
}

/// A parsed compose document.
///
/// Held as an ordered YAML tree so keys the manager does not interpret are
/// carried through untouched. Construction validates every service against
/// [`ServiceSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDocument {
    root: Mapping,
}

impl ComposeDocument {
    /// Parse and validate a single YAML document
    pub fn parse(text: &str) -> Result<Self, BotError> {
        let mut documents = serde_yaml::Deserializer::from_str(text);
        let first = documents
            .next()
            .ok_or_else(|| BotError::ComposeError("document is empty".to_string()))?;
        let mut value = Value::deserialize(first)?;
        if documents.next().is_some() {
            return Err(BotError::ComposeError(
                "multi-document YAML is not supported".to_string(),
            ));
        }
        // `<<: *anchor` keys
        value.apply_merge()?;
        match value {
            Value::Mapping(root) => Self::from_mapping(root),
            Value::Null => Err(BotError::ComposeError("document is empty".to_string())),
            _ => Err(BotError::ComposeError(
                "top level of a compose document must be a mapping".to_string(),
            )),
        }
    }

    /// Wrap an already-built tree, validating it
    pub fn from_mapping(root: Mapping) -> Result<Self, BotError> {
        let document = Self { root };
        document.validate()?;
        Ok(document)
    }

    pub fn to_yaml(&self) -> Result<String, BotError> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Mapping {
        &mut self.root
    }

    /// Check services and cross references
    pub fn validate(&self) -> Result<(), BotError> {
        let services = match self.root.get("services") {
            Some(Value::Mapping(services)) if !services.is_empty() => services,
            Some(Value::Mapping(_)) | None | Some(Value::Null) => {
                return Err(BotError::ComposeError(
                    "document declares no services".to_string(),
                ))
            }
            Some(_) => {
                return Err(BotError::ComposeError(
                    "'services' must be a mapping".to_string(),
                ))
            }
        };

        let declared_volumes: HashSet<String> = match self.root.get("volumes") {
            Some(Value::Mapping(volumes)) => volumes.keys().filter_map(scalar_to_string).collect(),
            Some(Value::Null) | None => HashSet::new(),
            Some(_) => {
                return Err(BotError::ComposeError(
                    "'volumes' must be a mapping".to_string(),
                ))
            }
        };

        let names = self.service_names();
        for (key, value) in services {
            let name = scalar_to_string(key).ok_or_else(|| {
                BotError::ComposeError("service names must be strings".to_string())
            })?;
            let service = value.as_mapping().ok_or_else(|| {
                BotError::ComposeError(format!("service '{}' must be a mapping", name))
            })?;
            let spec = ServiceSpec::parse(&name, service)?;

            for dependency in &spec.depends_on {
                if !names.contains(dependency) {
                    return Err(BotError::ComposeError(format!(
                        "service '{}' depends on unknown service '{}'",
                        name, dependency
                    )));
                }
            }
            for volume in &spec.volumes {
                if let Some(named) = volume.named_volume() {
                    if !declared_volumes.contains(named) {
                        return Err(BotError::ComposeError(format!(
                            "service '{}' uses undeclared volume '{}'",
                            name, named
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Service names in document order
    pub fn service_names(&self) -> Vec<String> {
        self.services()
            .map(|services| services.keys().filter_map(scalar_to_string).collect())
            .unwrap_or_default()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.service(name).is_some()
    }

    fn services(&self) -> Option<&Mapping> {
        self.root.get("services").and_then(Value::as_mapping)
    }

    pub fn service(&self, name: &str) -> Option<&Mapping> {
        self.services()?.get(name).and_then(Value::as_mapping)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Mapping> {
        self.root
            .get_mut("services")
            .and_then(Value::as_mapping_mut)?
            .get_mut(name)
            .and_then(Value::as_mapping_mut)
    }

    /// Every service mapping, mutably, in document order
    pub fn services_mut(&mut self) -> impl Iterator<Item = &mut Mapping> + '_ {
        self.root
            .get_mut("services")
            .and_then(Value::as_mapping_mut)
            .into_iter()
            .flat_map(|services| services.values_mut())
            .filter_map(Value::as_mapping_mut)
    }

    /// Typed view of one service
    pub fn service_spec(&self, name: &str) -> Result<ServiceSpec, BotError> {
        let service = self
            .service(name)
            .ok_or_else(|| BotError::ComposeError(format!("unknown service '{}'", name)))?;
        ServiceSpec::parse(name, service)
    }

    /// Typed views of all services in document order
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, BotError> {
        self.service_names()
            .iter()
            .map(|name| self.service_spec(name))
            .collect()
    }

    /// Top-level `name:`
    pub fn project_name(&self) -> Option<String> {
        self.root.get("name").and_then(scalar_to_string)
    }

    pub fn set_project_name(&mut self, name: &str) {
        self.root.insert(Value::from("name"), Value::from(name));
    }

    /// Platform metadata block
    pub fn metadata(&self) -> Option<&Mapping> {
        self.root.get(METADATA_KEY).and_then(Value::as_mapping)
    }

    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata()?.get(key).and_then(scalar_to_string)
    }

    /// Metadata block, created when absent
    pub fn metadata_mut(&mut self) -> &mut Mapping {
        top_level_mapping(&mut self.root, METADATA_KEY)
    }

    /// Top-level mapping under `key` (e.g. `networks`), created when absent
    pub fn top_level_mut(&mut self, key: &str) -> &mut Mapping {
        top_level_mapping(&mut self.root, key)
    }

    /// Service the metadata names as main, else the first declared
    pub fn main_service(&self) -> Option<String> {
        self.metadata_str("main")
            .filter(|name| self.has_service(name))
            .or_else(|| self.service_names().into_iter().next())
    }
}

fn top_level_mapping<'a>(root: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let slot = root
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !slot.is_mapping() {
        *slot = Value::Mapping(Mapping::new());
    }
    match slot {
        Value::Mapping(mapping) => mapping,
        _ => unreachable!("slot was just replaced with a mapping"),
    }
}
