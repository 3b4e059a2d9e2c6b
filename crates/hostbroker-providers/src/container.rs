//! Containers as hosts, through the docker or podman CLI
//!
//! `container_host` starts a long-lived container and hands it out as a host.
//! Containers that publish port 22 are reached over SSH on the engine host;
//! everything else gets a `ContainerSession`. `container_app` runs a one-shot
//! container and returns its output.

use std::sync::Arc;

use async_trait::async_trait;
use hostbroker_core::{
    ActionRequest, BrokerError, Host, HostContext, Provider, ProviderDescriptor, ProviderSettings,
    Validator, ValueKind,
};
use hostbroker_exec::{ContainerRuntime, ContainerSessionFactory, Session};
use hostbroker_inventory::InventoryEntry;
use hostbroker_inventory::entry::ARGS;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cli::{command_line, local_runner, run, run_checked};
use crate::requester;

/// Registered provider name
pub const NAME: &str = "Container";

const DEFAULT_RESULTS_LIMIT: usize = 20;
const ORIGIN_LABEL: &str = "broker.origin";

/// Registry entry for Container
#[must_use]
pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor::new(NAME, |settings| {
        Ok(Arc::new(Container::new(&settings)?) as Arc<dyn Provider>)
    })
    .with_validators(vec![
        Validator::default_value("runtime", "podman"),
        Validator::default_value("host", "localhost"),
        Validator::default_value("host_username", "root"),
        Validator::default_value("host_port", 22u64),
        Validator::is_type("host_port", ValueKind::Integer),
        Validator::default_value("auto_map_ports", true),
        Validator::is_type("auto_map_ports", ValueKind::Bool),
        Validator::default_value("results_limit", DEFAULT_RESULTS_LIMIT as u64),
        Validator::is_type("provider_labels", ValueKind::Table),
    ])
    .with_checkout("container_host", "run_container")
    .with_execute("container_app", "execute")
    .with_help_option("container_hosts")
    .with_help_option("container_host")
    .with_help_option("container_apps")
}

/// Translate a `ports` argument into `-p` values
///
/// Accepts `22`, `22:1337`, `22/tcp`, `22/tcp:1337`, separated by whitespace
/// or commas. The container port comes first, the host port second.
#[must_use]
pub fn port_mapping(ports: &str) -> Vec<String> {
    ports
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .map(|mapping| {
            let (container, host) = match mapping.split_once(':') {
                Some((container, host)) => (container, Some(host)),
                None => (mapping, None),
            };
            let (port, protocol) = container.split_once('/').unwrap_or((container, "tcp"));
            match host {
                Some(host) => format!("{host}:{port}/{protocol}"),
                None => format!("{port}/{protocol}"),
            }
        })
        .collect()
}

/// `KEY=VALUE` pairs from a table or a comma separated string
fn environment(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Object(vars)) => vars
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect(),
        Some(Value::String(vars)) => vars
            .split(',')
            .map(str::trim)
            .filter(|v| v.contains('='))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Host port published for container port 22
fn ssh_port(ports: &Value) -> Option<u16> {
    ports.as_object()?.iter().find_map(|(key, bindings)| {
        if key != "22" && !key.starts_with("22/") {
            return None;
        }
        let binding = bindings.as_array()?.first()?;
        match binding.get("HostPort")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            _ => None,
        }
    })
}

/// `{"80": "8080"}` from an inspect port map, skipping unpublished ports
fn exposed_ports(ports: &Value) -> Map<String, Value> {
    ports
        .as_object()
        .into_iter()
        .flatten()
        .filter_map(|(key, bindings)| {
            let host_port = bindings.as_array()?.first()?.get("HostPort")?.clone();
            let port = key.split('/').next().unwrap_or(key);
            Some((port.to_string(), host_port))
        })
        .collect()
}

/// Curated view of `inspect` output
#[derive(Debug, Clone, PartialEq)]
struct ContainerInfo {
    id: String,
    name: String,
    hostname: Option<String>,
    image: Option<String>,
    status: Option<String>,
    origin: Option<String>,
    ports: Value,
}

impl ContainerInfo {
    fn from_inspect(raw: &Value) -> Option<Self> {
        let raw = match raw {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let text = |pointer: &str| raw.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            id: text("/Id")?,
            name: text("/Name")?.trim_start_matches('/').to_string(),
            hostname: text("/Config/Hostname"),
            image: text("/Config/Image").or_else(|| text("/ImageName")),
            status: text("/State/Status"),
            origin: raw
                .pointer("/Config/Labels")
                .and_then(|labels| labels.get(ORIGIN_LABEL))
                .and_then(Value::as_str)
                .map(str::to_string),
            ports: raw
                .pointer("/NetworkSettings/Ports")
                .cloned()
                .unwrap_or(Value::Null),
        })
    }

    fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "hostname": self.hostname,
            "image": self.image,
            "status": self.status,
            "ports": self.ports,
        })
    }

    fn to_inventory(&self) -> InventoryEntry {
        let mut args = Map::new();
        if let Some(image) = &self.image {
            args.insert("container_host".into(), json!(image));
        }
        if let Some(origin) = &self.origin {
            args.insert("_broker_origin".into(), json!(origin));
        }
        let mut map = Map::new();
        map.insert(ARGS.into(), Value::Object(args));
        map.insert("name".into(), json!(self.name));
        map.insert("hostname".into(), json!(self.hostname));
        map.insert("image".into(), json!(self.image));
        map.insert("status".into(), json!(self.status));
        map.insert("ports".into(), self.ports.clone());
        InventoryEntry::from(map)
    }
}

/// Container provider instance
#[derive(Debug)]
pub struct Container {
    instance: Option<String>,
    runtime: ContainerRuntime,
    engine_host: String,
    remote: Option<String>,
    network: Option<String>,
    auto_map_ports: bool,
    name_prefix: String,
    results_limit: usize,
    labels: Map<String, Value>,
    runner: Arc<dyn Session>,
}

impl Container {
    /// Build from validated settings
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` for an unknown runtime
    pub fn new(settings: &ProviderSettings) -> Result<Self, BrokerError> {
        let runtime: ContainerRuntime = settings
            .get_str("runtime")
            .unwrap_or("podman")
            .parse()
            .map_err(|e| BrokerError::Configuration(format!("{NAME}: {e}")))?;
        let engine_host = settings.get_str("host").unwrap_or("localhost").to_string();
        let username = settings.get_str("host_username").unwrap_or("root");
        let port = settings.get_u64("host_port").unwrap_or(22);

        let remote = (engine_host != "localhost").then(|| match runtime {
            ContainerRuntime::Podman => {
                format!("ssh://{username}@{engine_host}:{port}/run/podman/podman.sock")
            }
            ContainerRuntime::Docker => format!("ssh://{username}@{engine_host}"),
        });

        Ok(Self {
            instance: settings.instance().map(str::to_string),
            runtime,
            engine_host,
            remote,
            network: settings.get_str("network").map(str::to_string),
            auto_map_ports: settings.get_bool("auto_map_ports").unwrap_or(true),
            name_prefix: settings
                .get_str("name_prefix")
                .map(str::to_string)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "broker".to_string()),
            results_limit: settings
                .get_u64("results_limit")
                .map_or(DEFAULT_RESULTS_LIMIT, |n| n as usize),
            labels: settings
                .get("provider_labels")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            runner: local_runner(),
        })
    }

    /// Run the container CLI through another session
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn Session>) -> Self {
        self.runner = runner;
        self
    }

    fn line<S: AsRef<str>>(&self, args: &[S]) -> Result<String, BrokerError> {
        let prefix = self.runtime.command_prefix(self.remote.as_deref())?;
        command_line(&prefix, args)
    }

    async fn cli<S: AsRef<str>>(&self, args: &[S]) -> Result<String, BrokerError> {
        let line = self.line(args)?;
        run_checked(self.runner.as_ref(), NAME, &line).await
    }

    fn generate_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.name_prefix, &suffix[..8])
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BrokerError> {
        let present = run(
            self.runner.as_ref(),
            NAME,
            &self.line(&["image", "inspect", image])?,
        )
        .await?;
        if present.success() {
            return Ok(());
        }
        info!(image, "pulling image");
        self.cli(&["pull", image]).await.map(|_| ()).map_err(|e| {
            BrokerError::provider(NAME, format!("Unable to find image: {image}\n{e}"))
        })
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInfo, BrokerError> {
        let raw = self.cli(&["inspect", container]).await?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::provider(NAME, format!("unreadable inspect output: {e}")))?;
        ContainerInfo::from_inspect(&value)
            .ok_or_else(|| BrokerError::provider(NAME, format!("no such container: {container}")))
    }

    fn container_name(&self, request: &ActionRequest) -> String {
        request
            .get_str("name")
            .filter(|n| !n.is_empty())
            .map_or_else(|| self.generate_name(), str::to_string)
    }

    /// Start a container from a broker-compatible image
    #[instrument(skip(self, request), fields(image = ?request.payload))]
    async fn run_container(&self, request: &ActionRequest) -> Result<Value, BrokerError> {
        let image = request
            .payload_str()
            .ok_or_else(|| BrokerError::User("container_host must be an image name".into()))?;
        self.ensure_image(image).await?;
        let name = self.container_name(request);

        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), name.clone()];
        if let Some(network) = request.get_str("network").or(self.network.as_deref()) {
            args.extend(["--network".into(), network.to_string()]);
        }
        let auto_map = request
            .get("auto_map_ports")
            .and_then(Value::as_bool)
            .unwrap_or(self.auto_map_ports);
        if auto_map {
            args.push("--publish-all".into());
        }
        if let Some(ports) = request.get_str("ports") {
            for mapping in port_mapping(ports) {
                args.extend(["-p".into(), mapping]);
            }
        }

        let origin = requester();
        let mut envars = environment(request.get("environment"));
        envars.push(format!("BROKER_ORIGIN={origin}"));
        for var in envars {
            args.extend(["-e".into(), var]);
        }

        let mut labels = self.labels.clone();
        if let Some(extra) = request.get("provider_labels").and_then(Value::as_object) {
            labels.extend(extra.clone());
        }
        for (key, value) in &labels {
            let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            args.extend(["--label".into(), format!("broker.{key}={value}")]);
        }
        args.extend(["--label".into(), format!("{ORIGIN_LABEL}={origin}")]);
        args.push(image.to_string());

        let id = self.cli(&args).await?;
        debug!(id = id.trim(), "container started");
        let info = self.inspect(&name).await?;
        info!(container = %info.name, "container running");
        Ok(info.to_value())
    }

    /// Run a one-shot container and return its output
    #[instrument(skip(self, request), fields(image = ?request.payload))]
    async fn execute(&self, request: &ActionRequest) -> Result<Value, BrokerError> {
        let image = request
            .payload_str()
            .ok_or_else(|| BrokerError::User("container_app must be an image name".into()))?;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            self.container_name(request),
        ];
        for var in environment(request.get("environment")) {
            args.extend(["-e".into(), var]);
        }
        args.push(image.to_string());
        if let Some(command) = request.get_str("command") {
            let words = shlex::split(command).ok_or_else(|| {
                BrokerError::User(format!("cannot split command: {command}"))
            })?;
            args.extend(words);
        }
        Ok(Value::String(self.cli(&args).await?))
    }

    fn session_factory(&self, container: &str) -> Arc<ContainerSessionFactory> {
        Arc::new(ContainerSessionFactory::new(
            self.runtime,
            self.remote.clone(),
            container,
        ))
    }

    async fn image_list(&self, compatible_only: bool, limit: usize) -> Result<Vec<String>, BrokerError> {
        let mut args = vec!["images"];
        if compatible_only {
            args.extend(["--filter", "label=broker_compatible"]);
        }
        args.extend(["--format", "{{.Repository}}:{{.Tag}}"]);
        let raw = self.cli(&args).await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("<none>"))
            .take(limit)
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Provider for Container {
    fn name(&self) -> &'static str {
        NAME
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError> {
        match method {
            "run_container" => self.run_container(request).await,
            "execute" => self.execute(request).await,
            other => Err(BrokerError::not_implemented(NAME, other)),
        }
    }

    async fn construct_host(
        &self,
        params: Option<Value>,
        ctx: HostContext,
    ) -> Result<Host, BrokerError> {
        let Some(params) = params else {
            let host = ctx.reconstruct();
            let has_ssh = host
                .extra("exposed_ports")
                .and_then(|p| p.get("22"))
                .is_some();
            return Ok(match host.name().map(str::to_string) {
                Some(name) if !has_ssh => host.with_session_factory(self.session_factory(&name)),
                _ => host,
            });
        };

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::provider(NAME, "container has no name"))?;
        let ports = params.get("ports").cloned().unwrap_or(Value::Null);

        let mut builder = match ssh_port(&ports) {
            Some(port) => ctx
                .host_builder(self.engine_host.clone())
                .with_port(port),
            None => {
                let hostname = params
                    .get("hostname")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BrokerError::provider(NAME, format!("Could not determine hostname of {name}"))
                    })?;
                ctx.host_builder(hostname)
                    .with_session_factory(self.session_factory(name))
            }
        };
        builder = builder.with_name(name);
        if let Some(id) = params.get("id").filter(|v| !v.is_null()) {
            builder = builder.with_extra("container_id", id.clone());
        }
        let exposed = exposed_ports(&ports);
        if !exposed.is_empty() {
            builder = builder.with_extra("exposed_ports", Value::Object(exposed));
        }
        Ok(builder.build())
    }

    #[instrument(skip(self, host), fields(host = %host))]
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        let name = host
            .name()
            .ok_or_else(|| BrokerError::provider(NAME, format!("{host} has no container name")))?;
        self.cli(&["rm", "-f", "-v", name]).await?;
        Ok(json!({ "removed": name }))
    }

    async fn extend(&self, host: &Host, _args: &Map<String, Value>) -> Result<Value, BrokerError> {
        info!(host = %host, "containers do not expire");
        Ok(Value::Null)
    }

    #[instrument(skip(self))]
    async fn get_inventory(&self, filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        let prefix = filter.unwrap_or(&self.name_prefix);
        let names = self.cli(&["ps", "-a", "--format", "{{.Names}}"]).await?;
        let mut entries = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| n.starts_with(prefix)) {
            match self.inspect(name).await {
                Ok(info) => entries.push(info.to_inventory()),
                Err(e) => warn!(container = name, error = %e, "skipping container"),
            }
        }
        Ok(entries)
    }

    async fn nick_help(&self, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        let limit = args
            .get("results_limit")
            .and_then(Value::as_u64)
            .map_or(self.results_limit, |n| n as usize);

        if let Some(image) = args.get("container_host").and_then(Value::as_str) {
            let raw = self.cli(&["image", "inspect", image]).await?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| BrokerError::provider(NAME, format!("unreadable image info: {e}")))?;
            let image_info = value.get(0).unwrap_or(&value);
            let mut config = image_info
                .get("Config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            config.remove("Env");
            return Ok(json!({
                "id": image_info.get("Id"),
                "tags": image_info.get("RepoTags"),
                "size": image_info.get("Size"),
                "config": config,
            }));
        }
        if args.contains_key("container_hosts") {
            return Ok(json!({ "container_hosts": self.image_list(true, limit).await? }));
        }
        if args.contains_key("container_apps") {
            return Ok(json!({ "container_apps": self.image_list(false, limit).await? }));
        }
        Err(BrokerError::User(
            "Container help accepts --container-hosts, --container-host <image> or --container-apps"
                .into(),
        ))
    }
}
