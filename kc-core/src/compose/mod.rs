mod decode;
mod duration;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

pub use self::duration::parse_compose_duration;
use self::decode::*;
use crate::errors::*;
use crate::names::escape_name;

pub const HEALTHCHECK_COMMAND_NONE: &str = "NONE";
pub const HEALTHCHECK_COMMAND_CMD: &str = "CMD";
pub const HEALTHCHECK_COMMAND_SHELL: &str = "CMD-SHELL";

pub const HEALTHCHECK_DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTHCHECK_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTHCHECK_DEFAULT_RETRIES: u64 = 3;

const MAX_EXTENDS_DEPTH: usize = 64;

err_impl! {ConfigurationError,
    #[error("depends_on list cannot contain duplicate values: {0}")]
    DuplicateDependency(String),

    #[error("depends_on map contains an entry with an invalid condition: {0}")]
    InvalidCondition(String),

    #[error("healthcheck test has an unknown command sentinel: {0}")]
    InvalidHealthcheckTest(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("service has an invalid restart policy: {0:?}")]
    InvalidRestartPolicy(String),

    #[error("invalid volume: {0:?}")]
    InvalidVolume(String),

    #[error("volume mode must be one of \"ro\" and \"rw\": {0:?}")]
    InvalidVolumeMode(String),

    #[error("depends_on references undefined service: {0}")]
    UnknownDependency(String),

    #[error("extends references undefined service: {0}")]
    UnknownExtends(String),

    #[error("extends chain contains a cycle involving service: {0}")]
    ExtendsCycle(String),
}

// The healthiness a dependant requires of its dependency before it may start.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ServiceHealthiness {
    Started,
    Healthy,
    CompletedSuccessfully,
}

// An environment value as decoded from YAML.  Numbers become i64 when they
// are whole and within the range an f64 can represent exactly enough to
// round-trip, f64 otherwise.
#[derive(Clone, Debug, PartialEq)]
pub enum EnvironmentValue {
    Int64(i64),
    Float(f64),
    String(String),
}

impl EnvironmentValue {
    pub fn stringified(&self) -> String {
        match self {
            EnvironmentValue::Int64(i) => i.to_string(),
            EnvironmentValue::Float(f) => f.to_string(),
            EnvironmentValue::String(s) => s.clone(),
        }
    }
}

// One service environment entry; a `None` value means the entry inherits
// whatever the process environment holds at translation time.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: Option<EnvironmentValue>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Port {
    pub port: i32,
    pub protocol: String,
}

// A short-syntax volume.  `host_path` is None for anonymous and named
// volumes; only entries with a host path turn into bind mounts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathMapping {
    pub host_path: Option<String>,
    pub container_path: String,
    pub mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Healthcheck {
    pub is_shell: bool,
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Build {
    pub context: String,
    pub dockerfile: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Service {
    pub name: String,
    pub name_escaped: String,
    pub image: Option<String>,
    pub build: Option<Build>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: Vec<EnvVar>,
    pub depends_on: BTreeMap<String, ServiceHealthiness>,
    pub healthcheck: Option<Healthcheck>,

    // True when the compose file explicitly disabled probing; the image's
    // inherited HEALTHCHECK must not be consulted in that case.
    pub healthcheck_disabled: bool,
    pub ports: Vec<Port>,
    pub restart: Option<RestartPolicy>,
    pub user: Option<String>,
    pub volumes: Vec<PathMapping>,
    pub working_dir: Option<String>,
}

impl Service {
    pub fn bind_mounts(&self) -> Vec<&PathMapping> {
        self.volumes.iter().filter(|v| v.host_path.is_some()).collect()
    }
}

#[derive(Clone, Debug)]
pub struct PushImages {
    pub docker_registry: String,
}

// A fully decoded and normalised compose project.
#[derive(Debug, Default)]
pub struct ComposeFile {
    services: Vec<Service>,
    index: BTreeMap<String, usize>,
    pub push_images: Option<PushImages>,
    pub volume_init_base_image: Option<String>,
}

impl ComposeFile {
    pub fn load(path: &Path) -> anyhow::Result<ComposeFile> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read compose file {}", path.display()))?;
        ComposeFile::from_raw(serde_yaml::from_str(&text)?, path.parent())
    }

    pub fn parse(text: &str) -> anyhow::Result<ComposeFile> {
        ComposeFile::from_raw(serde_yaml::from_str(text)?, None)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.index.get(name).map(|i| &self.services[*i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    fn from_raw(raw: RawComposeFile, base_dir: Option<&Path>) -> anyhow::Result<ComposeFile> {
        let mut services = vec![];
        let mut index = BTreeMap::new();
        for name in raw.services.keys() {
            let resolved = resolve_extends(&raw.services, name, base_dir, 0)?;
            index.insert(name.clone(), services.len());
            services.push(normalize_service(name, &resolved)?);
        }

        for service in &services {
            for dependency in service.depends_on.keys() {
                if !index.contains_key(dependency) {
                    bail!(ConfigurationError::unknown_dependency(dependency));
                }
            }
        }

        let ext = raw.x_kube_compose.unwrap_or_default();
        Ok(ComposeFile {
            services,
            index,
            push_images: ext.push_images.map(|p| PushImages { docker_registry: p.docker_registry }),
            volume_init_base_image: ext.volume_init_base_image,
        })
    }
}

// Resolves an extends chain down to a single RawService.  The child keeps
// everything it sets itself; depends_on is never inherited and environment
// entries merge parent-first so the child can override by name.
fn resolve_extends(
    services: &BTreeMap<String, RawService>,
    name: &str,
    base_dir: Option<&Path>,
    depth: usize,
) -> anyhow::Result<RawService> {
    if depth > MAX_EXTENDS_DEPTH {
        bail!(ConfigurationError::extends_cycle(name));
    }
    let raw = services.get(name).ok_or_else(|| ConfigurationError::unknown_extends(name))?;
    let Some(extends) = &raw.extends else {
        return Ok(raw.clone());
    };

    let parent = match extends {
        RawExtends::Service(parent_name) | RawExtends::Full { file: None, service: parent_name } => {
            resolve_extends(services, parent_name, base_dir, depth + 1)?
        },
        RawExtends::Full { file: Some(file), service: parent_name } => {
            let path = base_dir.map_or_else(|| Path::new(file).to_path_buf(), |d| d.join(file));
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read extends file {}", path.display()))?;
            let parent_raw: RawComposeFile = serde_yaml::from_str(&text)?;
            resolve_extends(&parent_raw.services, parent_name, path.parent(), depth + 1)?
        },
    };

    let mut merged = raw.clone();
    merged.image = merged.image.or(parent.image);
    merged.build = merged.build.or(parent.build);
    merged.command = merged.command.or(parent.command);
    merged.entrypoint = merged.entrypoint.or(parent.entrypoint);
    merged.healthcheck = merged.healthcheck.or(parent.healthcheck);
    merged.ports = merged.ports.or(parent.ports);
    merged.restart = merged.restart.or(parent.restart);
    merged.user = merged.user.or(parent.user);
    merged.volumes = merged.volumes.or(parent.volumes);
    merged.working_dir = merged.working_dir.or(parent.working_dir);
    merged.environment = match (parent.environment, merged.environment) {
        (Some(mut base), Some(child)) => {
            base.0.retain(|(name, _)| !child.0.iter().any(|(n, _)| n == name));
            base.0.extend(child.0);
            Some(base)
        },
        (base, child) => child.or(base),
    };
    Ok(merged)
}

fn normalize_service(name: &str, raw: &RawService) -> anyhow::Result<Service> {
    let (healthcheck, healthcheck_disabled) = match &raw.healthcheck {
        Some(hc) => normalize_healthcheck(hc)?,
        None => (None, false),
    };

    let mut ports = vec![];
    for port in raw.ports.iter().flatten() {
        ports.push(parse_port(port)?);
    }

    let mut volumes = vec![];
    for volume in raw.volumes.iter().flatten() {
        volumes.push(parse_path_mapping(volume)?);
    }

    Ok(Service {
        name: name.into(),
        name_escaped: escape_name(name),
        image: raw.image.clone(),
        build: raw.build.as_ref().map(|b| match b {
            RawBuild::Context(context) => Build { context: context.clone(), dockerfile: None },
            RawBuild::Full { context, dockerfile } => {
                Build { context: context.clone(), dockerfile: dockerfile.clone() }
            },
        }),
        command: raw.command.as_ref().map(normalize_string_or_list),
        entrypoint: raw.entrypoint.as_ref().map(normalize_string_or_list),
        environment: normalize_environment(raw.environment.as_ref()),
        depends_on: normalize_depends_on(raw.depends_on.as_ref())?,
        healthcheck,
        healthcheck_disabled,
        ports,
        restart: parse_restart_policy(raw.restart.as_deref())?,
        user: raw.user.clone(),
        volumes,
        working_dir: raw.working_dir.clone(),
    })
}

// A bare string command runs under a shell, exactly like docker would run it.
fn normalize_string_or_list(value: &StringOrList) -> Vec<String> {
    match value {
        StringOrList::List(list) => list.clone(),
        StringOrList::String(s) => vec!["/bin/sh".into(), "-c".into(), s.clone()],
    }
}

fn normalize_environment(raw: Option<&RawEnvironment>) -> Vec<EnvVar> {
    let Some(raw) = raw else {
        return vec![];
    };
    raw.0
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.as_ref().map(environment_value),
        })
        .collect()
}

// The int64-or-float64 rule for numeric environment values: a whole number
// within ±9.223372036854775e18 decodes as i64, everything else stays f64.
fn environment_value(scalar: &RawEnvScalar) -> EnvironmentValue {
    match scalar {
        RawEnvScalar::String(s) => EnvironmentValue::String(s.clone()),
        RawEnvScalar::Number(f) => {
            if (-9.223372036854775e18..=9.223372036854775e18).contains(f) && f.floor() == *f {
                EnvironmentValue::Int64(*f as i64)
            } else {
                EnvironmentValue::Float(*f)
            }
        },
    }
}

fn normalize_depends_on(
    raw: Option<&RawDependsOn>,
) -> anyhow::Result<BTreeMap<String, ServiceHealthiness>> {
    let mut depends_on = BTreeMap::new();
    match raw {
        None => {},
        Some(RawDependsOn::List(names)) => {
            for name in names {
                if depends_on.insert(name.clone(), ServiceHealthiness::Started).is_some() {
                    bail!(ConfigurationError::duplicate_dependency(name));
                }
            }
        },
        Some(RawDependsOn::Map(entries)) => {
            for (name, entry) in entries {
                let healthiness = match entry.condition.as_str() {
                    "service_started" => ServiceHealthiness::Started,
                    "service_healthy" => ServiceHealthiness::Healthy,
                    "service_completed_successfully" => ServiceHealthiness::CompletedSuccessfully,
                    other => bail!(ConfigurationError::invalid_condition(other)),
                };
                depends_on.insert(name.clone(), healthiness);
            }
        },
    }
    Ok(depends_on)
}

fn normalize_healthcheck(raw: &RawHealthcheck) -> anyhow::Result<(Option<Healthcheck>, bool)> {
    if raw.disable == Some(true) {
        return Ok((None, true));
    }
    let (is_shell, test) = match &raw.test {
        None => return Ok((None, false)),
        Some(RawHealthcheckTest::Shell(command)) => (true, vec![command.clone()]),
        Some(RawHealthcheckTest::Command(tokens)) => {
            let Some(sentinel) = tokens.first() else {
                return Ok((None, false));
            };
            match sentinel.as_str() {
                HEALTHCHECK_COMMAND_NONE => return Ok((None, true)),
                HEALTHCHECK_COMMAND_CMD => (false, tokens[1..].to_vec()),
                HEALTHCHECK_COMMAND_SHELL => (true, tokens[1..].to_vec()),
                other => bail!(ConfigurationError::invalid_healthcheck_test(other)),
            }
        },
    };
    if test.is_empty() {
        return Ok((None, false));
    }

    Ok((
        Some(Healthcheck {
            is_shell,
            test,
            interval: parse_optional_duration(raw.interval.as_deref(), HEALTHCHECK_DEFAULT_INTERVAL)?,
            timeout: parse_optional_duration(raw.timeout.as_deref(), HEALTHCHECK_DEFAULT_TIMEOUT)?,
            retries: raw.retries.unwrap_or(HEALTHCHECK_DEFAULT_RETRIES),
        }),
        false,
    ))
}

fn parse_optional_duration(value: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    value.map_or(Ok(default), parse_compose_duration)
}

fn parse_restart_policy(value: Option<&str>) -> anyhow::Result<Option<RestartPolicy>> {
    match value {
        None => Ok(None),
        Some("no") => Ok(Some(RestartPolicy::No)),
        Some("always") => Ok(Some(RestartPolicy::Always)),
        Some("on-failure") => Ok(Some(RestartPolicy::OnFailure)),
        Some(other) => bail!(ConfigurationError::invalid_restart_policy(other)),
    }
}

fn parse_port(raw: &RawPort) -> anyhow::Result<Port> {
    let value = match raw {
        RawPort::Int(port) => {
            let port = i32::try_from(*port)
                .ok()
                .filter(|p| (1..=65535).contains(p))
                .ok_or_else(|| ConfigurationError::invalid_port(&port.to_string()))?;
            return Ok(Port { port, protocol: "tcp".into() });
        },
        RawPort::String(s) => s,
    };

    let (address, protocol) = match value.split_once('/') {
        Some((address, protocol)) => (address, protocol),
        None => (value.as_str(), "tcp"),
    };
    if protocol != "tcp" && protocol != "udp" {
        bail!(ConfigurationError::invalid_port(value));
    }

    // With the short "[host:]container" syntax the container port comes last.
    let container = address.rsplit(':').next().unwrap_or(address);
    let port = container.parse::<i32>().map_err(|_| ConfigurationError::invalid_port(value))?;
    if !(1..=65535).contains(&port) {
        bail!(ConfigurationError::invalid_port(value));
    }
    Ok(Port { port, protocol: protocol.into() })
}

fn parse_path_mapping(value: &str) -> anyhow::Result<PathMapping> {
    let parts: Vec<&str> = value.split(':').collect();
    let (host, container_path, mode) = match parts.as_slice() {
        [container] => (None, *container, None),
        [host, container] => (Some(*host), *container, None),
        [host, container, mode] => (Some(*host), *container, Some(*mode)),
        _ => bail!(ConfigurationError::invalid_volume(value)),
    };
    if container_path.is_empty() {
        bail!(ConfigurationError::invalid_volume(value));
    }
    if let Some(mode) = mode {
        if mode != "ro" && mode != "rw" {
            bail!(ConfigurationError::invalid_volume_mode(mode));
        }
    }

    // A first segment that does not look like a path is a named volume, which
    // has no host content to materialise.
    let host_path = host.filter(|h| is_host_path(h)).map(String::from);
    Ok(PathMapping { host_path, container_path: container_path.into(), mode: mode.map(String::from) })
}

fn is_host_path(value: &str) -> bool {
    value.starts_with('/') || value.starts_with("./") || value.starts_with("../") || value.starts_with("~/")
}
