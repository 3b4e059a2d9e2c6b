//! Foreman host manager
//!
//! Hosts are created from a hostgroup, polled until their build finishes, and
//! deleted on release. Organization and location ids are looked up once per
//! provider instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostbroker_core::timeout::non_zero;
use hostbroker_core::{
    ActionRequest, BrokerError, Host, HostContext, Provider, ProviderDescriptor, ProviderSettings,
    Validator, ValueKind,
};
use hostbroker_exec::CommandResult;
use hostbroker_inventory::InventoryEntry;
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::http::{Auth, ClientError, RestClient};
use crate::poll::{PollOptions, poll_until};

/// Registered provider name
pub const NAME: &str = "Foreman";

const SCRIPT_TEMPLATE: &str = "Run Command - Script Default";

/// Registry entry for Foreman
#[must_use]
pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor::new(NAME, |settings| {
        Ok(Arc::new(Foreman::new(&settings)?) as Arc<dyn Provider>)
    })
    .with_validators(vec![
        Validator::required("organization"),
        Validator::required("location"),
        Validator::required("foreman_username"),
        Validator::required("foreman_password"),
        Validator::required("foreman_url"),
        Validator::default_value("verify", false),
        Validator::is_type("verify", ValueKind::Bool),
        Validator::default_value("name_prefix", "broker"),
        Validator::default_value("poll_interval", "1s"),
        Validator::is_type("poll_interval", ValueKind::Duration),
        Validator::default_value("build_timeout", "2h"),
        Validator::is_type("build_timeout", ValueKind::Duration),
    ])
    .with_checkout("hostgroup", "create_host")
    .with_help_option("hostgroups")
    .with_help_option("hostgroup")
}

/// Turn an error document into a broker error
///
/// Foreman reports failures in the body under `error` or `errors`.
fn interpret(body: Value) -> Result<Value, BrokerError> {
    if let Some(error) = body.get("error") {
        let message = error.get("message").and_then(Value::as_str);
        if let Some(message) = message
            && message.contains("Unable to authenticate user")
        {
            return Err(BrokerError::Authentication {
                provider: NAME.to_string(),
                message: message.to_string(),
            });
        }
        let full = error
            .get("full_messages")
            .and_then(Value::as_array)
            .map(|m| join_strings(m))
            .or_else(|| message.map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        return Err(BrokerError::provider(NAME, full));
    }
    if let Some(errors) = body.get("errors") {
        let message = errors
            .get("base")
            .and_then(Value::as_array)
            .map(|m| join_strings(m))
            .unwrap_or_else(|| errors.to_string());
        return Err(BrokerError::provider(NAME, message));
    }
    Ok(body)
}

fn join_strings(values: &[Value]) -> String {
    values
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

fn foreman_error(err: ClientError) -> BrokerError {
    if let ClientError::Api { message, .. } = &err
        && let Ok(body) = serde_json::from_str::<Value>(message)
        && let Err(e) = interpret(body)
    {
        return e;
    }
    err.into_broker(NAME)
}

/// Split job output into a command result
///
/// The last line is a `debug` entry when the command failed, in which case the
/// line before it carries the exit status. Otherwise the last line is the
/// status line of a successful run.
#[must_use]
pub fn parse_job_output(lines: &[Value]) -> CommandResult {
    let text = |items: &[Value]| {
        items
            .iter()
            .filter_map(|i| i.get("output").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let failed = lines
        .last()
        .and_then(|l| l.get("output_type"))
        .and_then(Value::as_str)
        == Some("debug");

    if failed && lines.len() >= 2 {
        let status = lines[lines.len() - 2]
            .get("output")
            .and_then(Value::as_str)
            .and_then(|s| s.rsplit(": ").next())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1);
        CommandResult {
            status,
            stdout: text(&lines[..lines.len() - 2]),
            ..CommandResult::default()
        }
    } else {
        CommandResult {
            status: 0,
            stdout: text(&lines[..lines.len().saturating_sub(1)]),
            ..CommandResult::default()
        }
    }
}

/// Foreman provider instance
#[derive(Debug)]
pub struct Foreman {
    instance: Option<String>,
    client: RestClient,
    organization: String,
    location: String,
    prefix: String,
    poll_interval: Duration,
    build_timeout: Option<Duration>,
    scope: OnceCell<(u64, u64)>,
}

impl Foreman {
    /// Build from validated settings
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the URL is invalid
    pub fn new(settings: &ProviderSettings) -> Result<Self, BrokerError> {
        let auth = Auth::Basic {
            username: settings.require_str("foreman_username")?.to_string(),
            password: settings.require_str("foreman_password")?.to_string(),
        };
        let client = RestClient::new(
            settings.require_str("foreman_url")?,
            auth,
            settings.get_bool("verify").unwrap_or(false),
        )
        .map_err(|e| BrokerError::Configuration(format!("{NAME}: {e}")))?;

        Ok(Self {
            instance: settings.instance().map(str::to_string),
            client,
            organization: settings.require_str("organization")?.to_string(),
            location: settings.require_str("location")?.to_string(),
            prefix: settings.get_str("name_prefix").unwrap_or("broker").to_string(),
            poll_interval: settings
                .get_duration("poll_interval")?
                .unwrap_or(Duration::from_secs(1)),
            build_timeout: settings.get_duration("build_timeout")?.and_then(non_zero),
            scope: OnceCell::new(),
        })
    }

    async fn get(&self, path: &str) -> Result<Value, BrokerError> {
        let body: Value = self.client.get(path).await.map_err(foreman_error)?;
        interpret(body)
    }

    async fn get_query(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, BrokerError> {
        let body: Value = self
            .client
            .get_query(path, query)
            .await
            .map_err(foreman_error)?;
        interpret(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, BrokerError> {
        let body: Value = self.client.post(path, body).await.map_err(foreman_error)?;
        interpret(body)
    }

    /// Id of the resource whose title or name is `name`
    #[instrument(skip(self))]
    pub async fn obtain_id(&self, resource_type: &str, name: &str) -> Result<u64, BrokerError> {
        let response = self
            .get_query(&format!("/api/{resource_type}"), &[("per_page", "200")])
            .await?;
        response
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|r| {
                r.get("title").and_then(Value::as_str) == Some(name)
                    || r.get("name").and_then(Value::as_str) == Some(name)
            })
            .and_then(|r| r.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                BrokerError::provider(NAME, format!("Could not find {name} in {resource_type}"))
            })
    }

    /// Organization and location ids
    async fn scope(&self) -> Result<(u64, u64), BrokerError> {
        self.scope
            .get_or_try_init(|| async {
                let organization = self.obtain_id("organizations", &self.organization).await?;
                let location = self.obtain_id("locations", &self.location).await?;
                Ok::<_, BrokerError>((organization, location))
            })
            .await
            .copied()
    }

    fn generate_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.prefix, &suffix[..8])
    }

    async fn image_uuid(&self, compute_resource: u64, image: &str) -> Result<String, BrokerError> {
        let search = format!("name={image}");
        let response = self
            .get_query(
                &format!("/api/compute_resources/{compute_resource}/images"),
                &[("search", search.as_str())],
            )
            .await?;
        response
            .pointer("/results/0/uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrokerError::provider(NAME, format!("Could not find {image} in VM images")))
    }

    /// Create a host from a hostgroup and wait for its build
    #[instrument(skip(self, request), fields(hostgroup = ?request.payload))]
    async fn create_host(&self, request: &ActionRequest) -> Result<Value, BrokerError> {
        let hostgroup = request
            .payload_str()
            .ok_or_else(|| BrokerError::User("hostgroup must be a name".into()))?;
        let (organization_id, location_id) = self.scope().await?;

        let mut host: Map<String, Value> = request
            .args
            .iter()
            .filter(|(k, v)| {
                k.as_str() != request.action
                    && !k.starts_with('_')
                    && !k.eq_ignore_ascii_case(NAME)
                    && !v.is_null()
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if host.get("name").and_then(Value::as_str).is_none_or(str::is_empty) {
            host.insert("name".into(), Value::String(self.generate_name()));
        }
        debug!(name = ?host.get("name"), hostgroup, "creating host");

        host.insert(
            "hostgroup_id".into(),
            json!(self.obtain_id("hostgroups", hostgroup).await?),
        );
        host.insert("build".into(), json!(true));
        host.insert("organization_id".into(), json!(organization_id));
        host.insert("location_id".into(), json!(location_id));
        let mut compute_attributes = json!({"start": "1"});

        let image = host.remove("image");
        let compute_resource = host.remove("computeresource");
        if let (Some(Value::String(image)), Some(Value::String(compute_resource))) =
            (image, compute_resource)
        {
            let resource_id = self.obtain_id("compute_resources", &compute_resource).await?;
            compute_attributes["image_id"] = json!(self.image_uuid(resource_id, &image).await?);
            host.insert("compute_resource_id".into(), json!(resource_id));
            host.insert("provision_method".into(), json!("image"));
            debug!(resource_id, image, "image based deployment");
        }
        host.insert("compute_attributes".into(), compute_attributes);

        let created = self
            .post(
                "/api/hosts",
                &json!({
                    "organization_id": organization_id,
                    "location_id": location_id,
                    "host": host,
                }),
            )
            .await?;
        let name = created
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::provider(NAME, "host creation returned no name"))?
            .to_string();
        info!(host = %name, "host created, waiting for build");

        self.wait_for_build(&name, &request.cancel).await?;

        let mut inputs = Map::new();
        inputs.insert("command".into(), Value::String(format!("hostname {name}")));
        let result = self
            .run_job(&name, SCRIPT_TEMPLATE, inputs, &request.cancel)
            .await?;
        if !result.success() {
            return Err(BrokerError::provider(
                NAME,
                format!("setting hostname on {name} failed: {}", result.stdout),
            ));
        }
        Ok(created)
    }

    async fn wait_for_build(&self, name: &str, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let path = format!("/api/hosts/{name}");
        let options = PollOptions::every(self.poll_interval).with_deadline(self.build_timeout);
        poll_until(NAME, &format!("build of {name}"), options, cancel, || async {
            let status = self.get(&path).await?;
            let building = status.get("build_status").and_then(Value::as_i64) != Some(0);
            Ok((!building).then_some(()))
        })
        .await
    }

    /// Run a remote execution job against one host
    ///
    /// # Errors
    /// Returns `BrokerError::Provider` if the job cannot be launched or read
    #[instrument(skip(self, inputs, cancel))]
    pub async fn run_job(
        &self,
        hostname: &str,
        template: &str,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, BrokerError> {
        let (organization_id, location_id) = self.scope().await?;
        let template_id = self.obtain_id("job_templates", template).await?;
        let invocation = self
            .post(
                "/api/job_invocations",
                &json!({
                    "organization_id": organization_id,
                    "location_id": location_id,
                    "job_invocation": {
                        "job_template_id": template_id,
                        "targeting_type": "static_query",
                        "inputs": inputs,
                        "search_query": format!("name={hostname}"),
                    },
                }),
            )
            .await?;
        let job_id = invocation
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| BrokerError::provider(NAME, "job invocation returned no id"))?;

        let path = format!("/api/job_invocations/{job_id}");
        poll_until(
            NAME,
            &format!("job invocation {job_id}"),
            PollOptions::every(self.poll_interval),
            cancel,
            || async {
                let job = self.get(&path).await?;
                let running = job.get("status_label").and_then(Value::as_str) == Some("running");
                Ok((!running).then_some(()))
            },
        )
        .await?;

        let outputs = self.get(&format!("{path}/outputs")).await?;
        let lines = outputs
            .pointer("/outputs/0/output")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(parse_job_output(&lines))
    }

    fn compile_host_info(host: &Value) -> InventoryEntry {
        let certname = host.get("certname").cloned().unwrap_or(Value::Null);
        let mut map = Map::new();
        map.insert("name".into(), certname.clone());
        map.insert("hostname".into(), certname);
        map.insert(
            "hostgroup".into(),
            host.get("hostgroup_title").cloned().unwrap_or(Value::Null),
        );
        map.insert("ip".into(), host.get("ip").cloned().unwrap_or(Value::Null));
        InventoryEntry::from(map)
    }
}

#[async_trait]
impl Provider for Foreman {
    fn name(&self) -> &'static str {
        NAME
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError> {
        match method {
            "create_host" => self.create_host(request).await,
            other => Err(BrokerError::not_implemented(NAME, other)),
        }
    }

    async fn construct_host(
        &self,
        params: Option<Value>,
        ctx: HostContext,
    ) -> Result<Host, BrokerError> {
        let Some(params) = params else {
            return Ok(ctx.reconstruct());
        };
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::provider(NAME, "created host has no name"))?;
        let mut builder = ctx.host_builder(name).with_name(name);
        for (key, field) in [("ip", "ip"), ("hostgroup", "hostgroup_title"), ("id", "id")] {
            if let Some(value) = params.get(field).filter(|v| !v.is_null()) {
                builder = builder.with_extra(key, value.clone());
            }
        }
        Ok(builder.build())
    }

    #[instrument(skip(self, host), fields(host = %host))]
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        let (organization_id, location_id) = self.scope().await?;
        let body = json!({
            "organization_id": organization_id,
            "location_id": location_id,
        });
        let response = self
            .client
            .delete(&format!("/api/hosts/{}", host.identifier()), &body)
            .await
            .map_err(foreman_error)?;
        interpret(response)
    }

    async fn extend(&self, host: &Host, _args: &Map<String, Value>) -> Result<Value, BrokerError> {
        info!(host = %host, "Foreman hosts do not expire");
        Ok(Value::Null)
    }

    #[instrument(skip(self))]
    async fn get_inventory(&self, filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        let prefix = filter.unwrap_or(&self.prefix);
        let response = self.get_query("/api/hosts", &[("search", prefix)]).await?;
        Ok(response
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(Self::compile_host_info)
            .collect())
    }

    async fn nick_help(&self, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        if let Some(name) = args.get("hostgroup").and_then(Value::as_str) {
            let id = self.obtain_id("hostgroups", name).await?;
            let data = self.get(&format!("/api/hostgroups/{id}")).await?;
            let mut properties = Map::new();
            for (label, field) in [
                ("description", "description"),
                ("operating_system", "operatingsystem_name"),
                ("domain", "domain_name"),
                ("subnet", "subnet_name"),
                ("subnet6", "subnet6_name"),
            ] {
                if let Some(value) = data.get(field).filter(|v| !v.is_null()) {
                    properties.insert(label.into(), value.clone());
                }
            }
            return Ok(json!({ "hostgroup": name, "properties": properties }));
        }
        if args.contains_key("hostgroups") {
            let response = self.get("/api/hostgroups").await?;
            let titles: Vec<Value> = response
                .get("results")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|h| h.get("title").cloned())
                .collect();
            return Ok(json!({ "hostgroups": titles }));
        }
        Err(BrokerError::User(
            "Foreman help accepts --hostgroups or --hostgroup <name>".into(),
        ))
    }
}
