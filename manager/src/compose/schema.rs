//! Typed views over compose service entries
//!
//! The document itself stays a generic YAML tree so unknown keys survive a
//! round trip. These types classify the polymorphic entries (short vs long
//! syntax, list vs mapping forms) and reject shapes compose would reject.

use serde_yaml::{Mapping, Value};

use crate::errors::BotError;

fn invalid(service: &str, msg: impl std::fmt::Display) -> BotError {
    BotError::ComposeError(format!("service '{}': {}", service, msg))
}

/// Render a YAML scalar as compose would read it as a string
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A `volumes:` entry of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEntry {
    /// `source:target[:mode]` or a bare anonymous `target`
    Short {
        source: Option<String>,
        target: String,
        mode: Option<String>,
    },
    /// `{type, source, target, read_only}`
    Long {
        kind: Option<String>,
        source: Option<String>,
        target: String,
        read_only: bool,
    },
}

impl VolumeEntry {
    pub fn parse(service: &str, value: &Value) -> Result<Self, BotError> {
        match value {
            Value::String(s) => Ok(parse_short_volume(s)),
            Value::Mapping(m) => {
                let target = m
                    .get("target")
                    .and_then(scalar_to_string)
                    .ok_or_else(|| invalid(service, "long volume syntax requires 'target'"))?;
                Ok(VolumeEntry::Long {
                    kind: m.get("type").and_then(scalar_to_string),
                    source: m.get("source").and_then(scalar_to_string),
                    target,
                    read_only: m.get("read_only").and_then(Value::as_bool).unwrap_or(false),
                })
            }
            other => Err(invalid(service, format!("unsupported volume entry {:?}", other))),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            VolumeEntry::Short { source, .. } | VolumeEntry::Long { source, .. } => {
                source.as_deref()
            }
        }
    }

    pub fn target(&self) -> &str {
        match self {
            VolumeEntry::Short { target, .. } | VolumeEntry::Long { target, .. } => target,
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            VolumeEntry::Short { mode, .. } => mode
                .as_deref()
                .map(|m| m.split(',').any(|flag| flag == "ro"))
                .unwrap_or(false),
            VolumeEntry::Long { read_only, .. } => *read_only,
        }
    }

    /// Host path mounts, as opposed to named or anonymous volumes
    pub fn is_bind(&self) -> bool {
        match self {
            VolumeEntry::Long {
                kind: Some(kind), ..
            } => kind == "bind",
            _ => self.source().map(is_host_path).unwrap_or(false),
        }
    }

    /// Name of the referenced named volume, if any
    pub fn named_volume(&self) -> Option<&str> {
        match self {
            VolumeEntry::Long {
                kind: Some(kind), ..
            } if kind != "volume" => None,
            _ => self.source().filter(|s| !is_host_path(s)),
        }
    }
}

fn parse_short_volume(spec: &str) -> VolumeEntry {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    match parts.as_slice() {
        [target] => VolumeEntry::Short {
            source: None,
            target: target.to_string(),
            mode: None,
        },
        [source, target] => VolumeEntry::Short {
            source: Some(source.to_string()),
            target: target.to_string(),
            mode: None,
        },
        [source, target, mode] => VolumeEntry::Short {
            source: Some(source.to_string()),
            target: target.to_string(),
            mode: Some(mode.to_string()),
        },
        _ => unreachable!("splitn yields between one and three parts"),
    }
}

/// Whether a volume source names a host path rather than a named volume
pub fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// A `ports:` entry of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEntry {
    /// `"[ip:][host:]container[/proto]"`
    Short(String),
    /// Bare number
    Number(u64),
    /// `{target, published, protocol, ...}`
    Long {
        target: String,
        published: Option<String>,
        protocol: Option<String>,
    },
}

impl PortEntry {
    pub fn parse(service: &str, value: &Value) -> Result<Self, BotError> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(PortEntry::Short(s.trim().to_string())),
            Value::Number(n) => n
                .as_u64()
                .map(PortEntry::Number)
                .ok_or_else(|| invalid(service, format!("invalid port {}", n))),
            Value::Mapping(m) => {
                let target = m
                    .get("target")
                    .and_then(scalar_to_string)
                    .ok_or_else(|| invalid(service, "long port syntax requires 'target'"))?;
                Ok(PortEntry::Long {
                    target,
                    published: m.get("published").and_then(scalar_to_string),
                    protocol: m.get("protocol").and_then(scalar_to_string),
                })
            }
            other => Err(invalid(service, format!("unsupported port entry {:?}", other))),
        }
    }

    /// Container-side port (or range), without host binding or protocol
    pub fn container_port(&self) -> String {
        match self {
            PortEntry::Short(spec) => {
                let without_proto = spec.split('/').next().unwrap_or(spec);
                without_proto
                    .rsplit(':')
                    .next()
                    .unwrap_or(without_proto)
                    .to_string()
            }
            PortEntry::Number(n) => n.to_string(),
            PortEntry::Long { target, .. } => target.clone(),
        }
    }
}

/// A service's `environment:` in either accepted form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentSpec {
    /// `- KEY=VALUE` (or bare `- KEY`, passed through from the host)
    List(Vec<String>),
    /// `KEY: VALUE`
    Map(Vec<(String, Option<String>)>),
}

impl EnvironmentSpec {
    pub fn parse(service: &str, value: &Value) -> Result<Self, BotError> {
        match value {
            Value::Null => Ok(EnvironmentSpec::Map(Vec::new())),
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item)
                        .ok_or_else(|| invalid(service, "environment list entries must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(EnvironmentSpec::List),
            Value::Mapping(map) => map
                .iter()
                .map(|(k, v)| {
                    let key = scalar_to_string(k)
                        .ok_or_else(|| invalid(service, "environment keys must be strings"))?;
                    let value = match v {
                        Value::Null => None,
                        other => Some(scalar_to_string(other).ok_or_else(|| {
                            invalid(service, format!("environment value of {} must be a scalar", key))
                        })?),
                    };
                    Ok((key, value))
                })
                .collect::<Result<Vec<_>, BotError>>()
                .map(EnvironmentSpec::Map),
            _ => Err(invalid(service, "environment must be a list or a mapping")),
        }
    }

    /// Key/value pairs; bare list keys yield `None`
    pub fn pairs(&self) -> Vec<(String, Option<String>)> {
        match self {
            EnvironmentSpec::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
            EnvironmentSpec::Map(pairs) => pairs.clone(),
        }
    }

    /// Case-insensitive key lookup
    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs().iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }
}

/// Names from a field that is either a list of names or a mapping keyed by name
fn names_of(service: &str, field: &str, value: &Value) -> Result<Vec<String>, BotError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                scalar_to_string(item)
                    .ok_or_else(|| invalid(service, format!("{} entries must be strings", field)))
            })
            .collect(),
        Value::Mapping(map) => map
            .keys()
            .map(|k| {
                scalar_to_string(k)
                    .ok_or_else(|| invalid(service, format!("{} keys must be strings", field)))
            })
            .collect(),
        _ => Err(invalid(service, format!("{} must be a list or a mapping", field))),
    }
}

/// Label pairs from either the list (`k=v`) or mapping form
fn labels_of(service: &str, value: &Value) -> Result<Vec<(String, String)>, BotError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                let item = scalar_to_string(item)
                    .ok_or_else(|| invalid(service, "label entries must be strings"))?;
                Ok(match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item, String::new()),
                })
            })
            .collect(),
        Value::Mapping(map) => map
            .iter()
            .map(|(k, v)| {
                let key = scalar_to_string(k)
                    .ok_or_else(|| invalid(service, "label keys must be strings"))?;
                Ok((key, scalar_to_string(v).unwrap_or_default()))
            })
            .collect(),
        _ => Err(invalid(service, "labels must be a list or a mapping")),
    }
}

/// `build:` as either a context string or a mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: Option<String>,
}

impl BuildSpec {
    pub fn parse(service: &str, value: &Value) -> Result<Self, BotError> {
        match value {
            Value::String(context) => Ok(BuildSpec {
                context: context.clone(),
                dockerfile: None,
            }),
            Value::Mapping(m) => Ok(BuildSpec {
                context: m
                    .get("context")
                    .and_then(scalar_to_string)
                    .unwrap_or_else(|| ".".to_string()),
                dockerfile: m.get("dockerfile").and_then(scalar_to_string),
            }),
            _ => Err(invalid(service, "build must be a string or a mapping")),
        }
    }
}

/// `command:` / `entrypoint:` as a shell string or an exec list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    fn parse(service: &str, field: &str, value: &Value) -> Result<Option<Self>, BotError> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(CommandSpec::Shell(s.clone()))),
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item)
                        .ok_or_else(|| invalid(service, format!("{} entries must be scalars", field)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|args| Some(CommandSpec::Exec(args))),
            _ => Err(invalid(service, format!("{} must be a string or a list", field))),
        }
    }

    /// Argument vector; shell strings are split on whitespace
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandSpec::Exec(args) => args.clone(),
        }
    }
}

/// Validated view of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub container_name: Option<String>,
    pub hostname: Option<String>,
    pub restart: Option<String>,
    pub environment: EnvironmentSpec,
    pub volumes: Vec<VolumeEntry>,
    pub ports: Vec<PortEntry>,
    pub expose: Vec<String>,
    pub networks: Vec<String>,
    pub network_mode: Option<String>,
    pub labels: Vec<(String, String)>,
    pub depends_on: Vec<String>,
    pub command: Option<CommandSpec>,
    pub entrypoint: Option<CommandSpec>,
}

impl ServiceSpec {
    pub fn parse(name: &str, service: &Mapping) -> Result<Self, BotError> {
        let field = |key: &str| service.get(key).unwrap_or(&Value::Null);
        let string_field = |key: &str| service.get(key).and_then(scalar_to_string);

        let build = match service.get("build") {
            Some(value) => Some(BuildSpec::parse(name, value)?),
            None => None,
        };
        let image = string_field("image");
        if image.is_none() && build.is_none() {
            return Err(invalid(name, "needs either 'image' or 'build'"));
        }

        let volumes = match field("volumes") {
            Value::Null => Vec::new(),
            Value::Sequence(items) => items
                .iter()
                .map(|v| VolumeEntry::parse(name, v))
                .collect::<Result<_, _>>()?,
            _ => return Err(invalid(name, "volumes must be a list")),
        };

        let ports = match field("ports") {
            Value::Null => Vec::new(),
            Value::Sequence(items) => items
                .iter()
                .map(|v| PortEntry::parse(name, v))
                .collect::<Result<_, _>>()?,
            _ => return Err(invalid(name, "ports must be a list")),
        };

        let expose = match field("expose") {
            Value::Null => Vec::new(),
            Value::Sequence(items) => items
                .iter()
                .map(|v| {
                    scalar_to_string(v).ok_or_else(|| invalid(name, "expose entries must be scalars"))
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(invalid(name, "expose must be a list")),
        };

        Ok(ServiceSpec {
            name: name.to_string(),
            image,
            build,
            container_name: string_field("container_name"),
            hostname: string_field("hostname"),
            restart: string_field("restart"),
            environment: EnvironmentSpec::parse(name, field("environment"))?,
            volumes,
            ports,
            expose,
            networks: names_of(name, "networks", field("networks"))?,
            network_mode: string_field("network_mode"),
            labels: labels_of(name, field("labels"))?,
            depends_on: names_of(name, "depends_on", field("depends_on"))?,
            command: CommandSpec::parse(name, "command", field("command"))?,
            entrypoint: CommandSpec::parse(name, "entrypoint", field("entrypoint"))?,
        })
    }
}
