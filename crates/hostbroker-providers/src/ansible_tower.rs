//! AnsibleTower / AAP workflow engine
//!
//! Workflows and job templates are launched by name with the request
//! arguments as extra vars, then polled until they reach a terminal status.
//! A checkout workflow leaves `_broker_facts` and `_broker_args` in its job
//! artifacts; those describe the new host. Release and extend run the
//! configured workflows against the host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use hostbroker_core::timeout::non_zero;
use hostbroker_core::{
    ActionRequest, BrokerError, Host, HostContext, Provider, ProviderDescriptor, ProviderSettings,
    Validator, ValueKind,
};
use hostbroker_inventory::entry::ARGS;
use hostbroker_inventory::{InventoryEntry, merge_maps};
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::http::{Auth, ClientError, RestClient};
use crate::poll::{PollOptions, poll_until};
use crate::requester;

/// Registered provider name
pub const NAME: &str = "AnsibleTower";

const LEGACY_ROOT: &str = "/api/v2/";
const CONTROLLER_ROOT: &str = "/api/controller/v2/";
const PAGE_SIZE: &str = "200";
const DEFAULT_RESULTS_LIMIT: usize = 20;

/// Registry entry for AnsibleTower
#[must_use]
pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor::new(NAME, |settings| {
        Ok(Arc::new(AnsibleTower::new(&settings)?) as Arc<dyn Provider>)
    })
    .with_validators(vec![
        Validator::required("base_url"),
        Validator::any_of(vec![
            Validator::all_of(vec![
                Validator::required("username"),
                Validator::required("password"),
            ]),
            Validator::required("token"),
        ]),
        Validator::default_value("release_workflow", "remove-vm"),
        Validator::default_value("extend_workflow", "extend-vm"),
        Validator::default_value("new_expire_time", "+172800"),
        Validator::default_value("workflow_timeout", 3600u64),
        Validator::is_type("workflow_timeout", ValueKind::Duration),
        Validator::default_value("results_limit", DEFAULT_RESULTS_LIMIT as u64),
        Validator::is_type("results_limit", ValueKind::Integer),
        Validator::default_value("error_scope", "last"),
        Validator::default_value("poll_interval", "10s"),
        Validator::is_type("poll_interval", ValueKind::Duration),
        Validator::default_value("verify", true),
        Validator::is_type("provider_labels", ValueKind::Table),
    ])
    .with_checkout("workflow", "execute")
    .with_execute("job_template", "execute")
    .with_help_option("workflows")
    .with_help_option("workflow")
    .with_help_option("job_templates")
    .with_help_option("job_template")
    .with_help_option("inventories")
    .with_help_option("inventory")
    .with_help_option("templates")
}

// ============================================================================
// Helpers
// ============================================================================

/// What is being launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Workflow,
    JobTemplate,
}

impl Subject {
    fn templates(self) -> &'static str {
        match self {
            Subject::Workflow => "workflow_job_templates",
            Subject::JobTemplate => "job_templates",
        }
    }

    fn jobs(self) -> &'static str {
        match self {
            Subject::Workflow => "workflow_jobs",
            Subject::JobTemplate => "jobs",
        }
    }

    fn ui_segment(self) -> &'static str {
        match self {
            Subject::Workflow => "workflow",
            Subject::JobTemplate => "playbook",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Subject::Workflow => "Workflow",
            Subject::JobTemplate => "Job template",
        }
    }
}

/// How artifacts of child jobs are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Only the last child job counts
    Last,
    /// Every child job's artifacts, later ones winning
    Merge,
}

impl Strategy {
    fn from_value(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("merge") => Strategy::Merge,
            _ => Strategy::Last,
        }
    }
}

/// `Some(true)` for AAP 2.5 and later, `None` when unparseable
fn is_controller_version(version: &str) -> Option<bool> {
    let mut parts = version.trim().split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor) >= (2, 5))
}

/// Extra vars of a template: JSON, or `key: value` lines
fn parse_extra_vars(raw: Option<&Value>) -> Map<String, Value> {
    let raw = match raw {
        Some(Value::Object(map)) => return map.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => return Map::new(),
    };
    if let Ok(Value::Object(map)) = serde_json::from_str(raw) {
        return map;
    }
    warn!("template uses non-json extra_vars, parsing as key: value lines");
    raw.lines()
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.trim().to_string(), Value::String(v.trim().to_string())))
        .collect()
}

/// Hostname, name and host type from `_broker_facts`
fn fields_from_facts(facts: &Map<String, Value>) -> (Option<String>, Option<String>, String) {
    let scalar = |value: &Value| match value {
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        other => other.as_str().map(str::to_string),
    };
    let mut hostname = None;
    let mut name = None;
    let mut host_type = "host".to_string();
    for (key, value) in facts {
        if key.ends_with("fqdn") && hostname.is_none() {
            hostname = scalar(value);
        }
        if (key == "name" || key == "vm_provisioned") && name.is_none() {
            name = scalar(value);
        }
        if key.ends_with("host_type")
            && let Some(t) = value.as_str()
        {
            host_type = t.to_string();
        }
    }
    (hostname, name, host_type)
}

fn non_empty(map: Option<&Value>) -> Map<String, Value> {
    map.and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter(|(_, v)| match v {
                    Value::Null => false,
                    Value::String(s) => !s.is_empty(),
                    Value::Array(a) => !a.is_empty(),
                    Value::Object(o) => !o.is_empty(),
                    _ => true,
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn results(value: &Value) -> Vec<Value> {
    value
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn is_transient(err: &ClientError) -> bool {
    match err {
        ClientError::Http(_) => true,
        ClientError::Api { status, .. } => *status == 403 || *status >= 500,
        _ => false,
    }
}

// ============================================================================
// Provider
// ============================================================================

/// AnsibleTower provider instance
#[derive(Debug)]
pub struct AnsibleTower {
    instance: Option<String>,
    client: RestClient,
    username: Option<String>,
    default_inventory: Option<Value>,
    release_workflow: String,
    extend_workflow: String,
    new_expire_time: String,
    workflow_timeout: Option<Duration>,
    poll_interval: Duration,
    results_limit: usize,
    report_all_errors: bool,
    aap_version: Option<String>,
    labels: Map<String, Value>,
    api_root: OnceCell<String>,
    me: OnceCell<String>,
}

impl AnsibleTower {
    /// Build from validated settings
    ///
    /// A token is preferred over username and password.
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the base URL is invalid
    pub fn new(settings: &ProviderSettings) -> Result<Self, BrokerError> {
        let username = settings.get_str("username").map(str::to_string);
        let auth = match (settings.get_str("token"), &username, settings.get_str("password")) {
            (Some(token), _, _) => Auth::Bearer(token.to_string()),
            (None, Some(user), Some(password)) => {
                warn!("using password authentication; a token is recommended");
                Auth::Basic {
                    username: user.clone(),
                    password: password.to_string(),
                }
            }
            _ => {
                return Err(BrokerError::Configuration(format!(
                    "{NAME}: either token or username and password are required"
                )));
            }
        };
        let client = RestClient::new(
            settings.require_str("base_url")?,
            auth,
            settings.get_bool("verify").unwrap_or(true),
        )
        .map_err(|e| BrokerError::Configuration(format!("{NAME}: {e}")))?;

        let text = |key: &str, default: &str| settings.get_str(key).unwrap_or(default).to_string();
        Ok(Self {
            instance: settings.instance().map(str::to_string),
            client,
            username,
            default_inventory: settings.get("inventory").cloned(),
            release_workflow: text("release_workflow", "remove-vm"),
            extend_workflow: text("extend_workflow", "extend-vm"),
            new_expire_time: text("new_expire_time", "+172800"),
            workflow_timeout: settings.get_duration("workflow_timeout")?.and_then(non_zero),
            poll_interval: settings
                .get_duration("poll_interval")?
                .unwrap_or(Duration::from_secs(10)),
            results_limit: settings
                .get_u64("results_limit")
                .map_or(DEFAULT_RESULTS_LIMIT, |n| n as usize),
            report_all_errors: settings.get_str("error_scope") != Some("last"),
            aap_version: settings
                .get_str("aap_version")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            labels: settings
                .get("provider_labels")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            api_root: OnceCell::new(),
            me: OnceCell::new(),
        })
    }

    /// API root, detecting AAP 2.5+ when the version is not configured
    async fn root(&self) -> Result<&str, BrokerError> {
        self.api_root
            .get_or_try_init(|| async {
                if let Some(controller) = self.aap_version.as_deref().and_then(is_controller_version)
                {
                    return Ok(if controller { CONTROLLER_ROOT } else { LEGACY_ROOT }.to_string());
                }
                match self.client.get::<Value>(&format!("{LEGACY_ROOT}ping/")).await {
                    Ok(_) => Ok(LEGACY_ROOT.to_string()),
                    Err(ClientError::Api { status: 404, .. }) => {
                        debug!("legacy API missing, using the controller API");
                        Ok(CONTROLLER_ROOT.to_string())
                    }
                    Err(e) => Err(e.into_broker(NAME)),
                }
            })
            .await
            .map(String::as_str)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, BrokerError> {
        let root = self.root().await?;
        self.client
            .get_query(&format!("{root}{path}"), query)
            .await
            .map_err(|e| e.into_broker(NAME))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, BrokerError> {
        let root = self.root().await?;
        self.client
            .post(&format!("{root}{path}"), body)
            .await
            .map_err(|e| e.into_broker(NAME))
    }

    /// Name of the authenticated user
    async fn username(&self) -> Result<&str, BrokerError> {
        if let Some(user) = &self.username {
            return Ok(user);
        }
        self.me
            .get_or_try_init(|| async {
                let me = self.get("me/", &[]).await?;
                me.pointer("/results/0/username")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| BrokerError::provider(NAME, "cannot determine current user"))
            })
            .await
            .map(String::as_str)
    }

    async fn find_template(&self, subject: Subject, name: &str) -> Result<Value, BrokerError> {
        let found = self.get(&format!("{}/", subject.templates()), &[("name", name)]).await?;
        results(&found).pop().ok_or_else(|| {
            BrokerError::User(format!("{} not found by name: {name}", subject.label()))
        })
    }

    /// Inventory id for a name or id
    async fn inventory_id(&self, inventory: &Value) -> Result<u64, BrokerError> {
        if let Some(id) = inventory.as_u64() {
            return Ok(id);
        }
        let Some(name) = inventory.as_str() else {
            return Err(BrokerError::provider(
                NAME,
                format!("Ambiguous AnsibleTower inventory {inventory}"),
            ));
        };
        if let Ok(id) = name.parse() {
            return Ok(id);
        }

        let found = results(&self.get("inventories/", &[("search", name)]).await?);
        let exact: Vec<&Value> = found
            .iter()
            .filter(|inv| inv.get("name").and_then(Value::as_str) == Some(name))
            .collect();
        let pick = match (found.len(), exact.as_slice()) {
            (1, _) => found.first(),
            (_, [one]) => Some(*one),
            (0, _) => {
                return Err(BrokerError::provider(
                    NAME,
                    format!("Unknown AnsibleTower inventory {name}"),
                ));
            }
            _ => {
                return Err(BrokerError::provider(
                    NAME,
                    format!("Ambiguous AnsibleTower inventory name {name}"),
                ));
            }
        };
        pick.and_then(|inv| inv.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| BrokerError::provider(NAME, format!("inventory {name} has no id")))
    }

    async fn inventory_name(&self, id: u64) -> Result<String, BrokerError> {
        let inventory = self.get(&format!("inventories/{id}/"), &[]).await?;
        inventory
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BrokerError::provider(NAME, format!("Unknown AnsibleTower inventory by id {id}"))
            })
    }

    /// Label ids, creating missing labels under `organization`
    async fn resolve_labels(
        &self,
        labels: &Map<String, Value>,
        organization: Option<u64>,
    ) -> Result<Vec<u64>, BrokerError> {
        let root = self.root().await?;
        let mut ids = Vec::with_capacity(labels.len());
        for (key, value) in labels {
            let name = match value {
                Value::Null => key.clone(),
                Value::String(s) if s.is_empty() => key.clone(),
                Value::String(s) => format!("{key}={s}"),
                other => format!("{key}={other}"),
            };
            let created: Result<Value, ClientError> = self
                .client
                .post(
                    &format!("{root}labels/"),
                    &json!({"name": name, "organization": organization}),
                )
                .await;
            let id = match created {
                Ok(label) => label.get("id").and_then(Value::as_u64),
                Err(ClientError::Api { status: 400, .. }) => {
                    debug!(label = %name, "label already exists");
                    results(&self.get("labels/", &[("name", &name)]).await?)
                        .first()
                        .and_then(|l| l.get("id"))
                        .and_then(Value::as_u64)
                }
                Err(e) => return Err(e.into_broker(NAME)),
            };
            match id {
                Some(id) => ids.push(id),
                None => warn!(label = %name, "label not found after creation"),
            }
        }
        Ok(ids)
    }

    fn extra_vars(&self, request: &ActionRequest, subject: Subject) -> Map<String, Value> {
        let mut extra: Map<String, Value> = request
            .args
            .iter()
            .filter(|(k, v)| !v.is_null() && k.as_str() != "inventory" && !k.eq_ignore_ascii_case(NAME))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if subject == Subject::Workflow {
            extra.insert("_broker_origin".into(), Value::String(requester()));
            if let Ok(url) = std::env::var("JENKINS_URL") {
                extra.insert("_jenkins_url".into(), Value::String(url));
            }
        }
        extra
    }

    /// Launch a template and wait for the job to finish successfully
    #[instrument(skip(self, request, subject), fields(subject = subject.label()))]
    async fn launch(
        &self,
        subject: Subject,
        name: &str,
        request: &ActionRequest,
    ) -> Result<Value, BrokerError> {
        let template = self.find_template(subject, name).await?;
        let template_id = template
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| BrokerError::provider(NAME, format!("{name} has no id")))?;
        let mut payload = Map::new();

        let inventory = request
            .get("inventory")
            .or_else(|| request.get("tower_inventory"))
            .or(self.default_inventory.as_ref());
        if let Some(inventory) = inventory {
            let id = self.inventory_id(inventory).await?;
            info!(inventory = %inventory, "using tower inventory");
            payload.insert("inventory".into(), json!(id));
        } else {
            let default = template.get("inventory").and_then(Value::as_u64).ok_or_else(|| {
                BrokerError::User(format!(
                    "The {name} has no default inventory set, please specify one."
                ))
            })?;
            self.inventory_name(default).await.map_err(|_| {
                BrokerError::User(format!(
                    "You don't have access to this {name}'s default inventory, please specify one."
                ))
            })?;
            info!("no inventory specified, the template default applies");
        }

        let mut extra = self.extra_vars(request, subject);
        let mut labels = self.labels.clone();
        if let Some(requested) = request.get("provider_labels").and_then(Value::as_object) {
            labels.extend(requested.clone());
        }
        if !labels.is_empty() {
            let organization = template
                .pointer("/summary_fields/organization/id")
                .and_then(Value::as_u64);
            payload.insert(
                "labels".into(),
                json!(self.resolve_labels(&labels, organization).await?),
            );
            extra.insert("provider_labels".into(), Value::Object(labels));
        }

        let template_vars = parse_extra_vars(template.get("extra_vars"));
        let broker_extra: Map<String, Value> = extra
            .iter()
            .filter(|(k, _)| !template_vars.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        extra.insert("_broker_extra_vars".into(), Value::Object(broker_extra));
        payload.insert(
            "extra_vars".into(),
            Value::String(Value::Object(extra).to_string()),
        );

        let launched = self
            .post(
                &format!("{}/{template_id}/launch/", subject.templates()),
                &Value::Object(payload),
            )
            .await?;
        let job_id = launched
            .get(match subject {
                Subject::Workflow => "workflow_job",
                Subject::JobTemplate => "job",
            })
            .or_else(|| launched.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| BrokerError::provider(NAME, "launch returned no job id"))?;

        let ui_prefix = if self.root().await? == CONTROLLER_ROOT { "execution" } else { "#" };
        let ui_url = self
            .client
            .url(&format!("/{ui_prefix}/jobs/{}/{job_id}/output", subject.ui_segment()))
            .map(|u| u.to_string())
            .unwrap_or_default();
        info!(job_id, ui_url = %ui_url, "waiting for job");

        let job = self.wait_for_job(subject, job_id, &request.cancel).await?;
        let status = job.get("status").and_then(Value::as_str).unwrap_or("unknown");
        if status != "successful" {
            let reasons = self.failure_messages(&job).await?;
            let message = json!({
                format!("{} Status", subject.label()): status,
                "Reason(s)": reasons,
                "URL": ui_url,
            });
            return Err(BrokerError::provider(
                NAME,
                serde_json::to_string_pretty(&message).unwrap_or_else(|_| message.to_string()),
            ));
        }
        Ok(job)
    }

    async fn wait_for_job(
        &self,
        subject: Subject,
        job_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Value, BrokerError> {
        let root = self.root().await?;
        let path = format!("{root}{}/{job_id}/", subject.jobs());
        let options = PollOptions::every(self.poll_interval).with_deadline(self.workflow_timeout);
        poll_until(NAME, &format!("job {job_id}"), options, cancel, || async {
            match self.client.get::<Value>(&path).await {
                Ok(job) => {
                    let finished = job.get("finished").is_some_and(|f| !f.is_null())
                        || matches!(
                            job.get("status").and_then(Value::as_str),
                            Some("successful" | "failed" | "error" | "canceled")
                        );
                    Ok(finished.then_some(job))
                }
                Err(e) if is_transient(&e) => {
                    warn!(job_id, error = %e, "error while waiting for job, retrying");
                    Ok(None)
                }
                Err(e) => Err(e.into_broker(NAME)),
            }
        })
        .await
    }

    /// Workflow nodes that ran a job, sorted by job id
    async fn child_jobs(&self, workflow_id: u64) -> Result<Vec<Value>, BrokerError> {
        let nodes = self
            .get(
                &format!("workflow_jobs/{workflow_id}/workflow_nodes/"),
                &[("page_size", PAGE_SIZE)],
            )
            .await?;
        let mut children: Vec<Value> = results(&nodes)
            .into_iter()
            .filter_map(|node| node.pointer("/summary_fields/job").cloned())
            .filter(|job| job.get("id").and_then(Value::as_u64).is_some())
            .collect();
        children.sort_by_key(|job| job.get("id").and_then(Value::as_u64).unwrap_or_default());
        Ok(children)
    }

    async fn fetch_job(&self, summary: &Value) -> Result<Value, BrokerError> {
        let id = summary.get("id").and_then(Value::as_u64).unwrap_or_default();
        let path = match summary.get("type").and_then(Value::as_str) {
            Some("workflow_job") => "workflow_jobs",
            _ => "jobs",
        };
        self.get(&format!("{path}/{id}/"), &[]).await
    }

    /// Artifacts of a job and, for workflows, of its child jobs
    fn merge_artifacts<'a>(
        &'a self,
        job: Value,
        strategy: Strategy,
        artifacts: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Map<String, Value>, BrokerError>> {
        async move {
            let mut artifacts = artifacts;
            if let Some(own) = job.get("artifacts").and_then(Value::as_object)
                && !own.is_empty()
            {
                debug!(job = ?job.get("id"), "found artifacts");
                artifacts = match strategy {
                    Strategy::Merge => merge_maps(&artifacts, own),
                    Strategy::Last => own.clone(),
                };
            }

            if job.get("type").and_then(Value::as_str) == Some("workflow_job") {
                let id = job.get("id").and_then(Value::as_u64).unwrap_or_default();
                let mut children = self.child_jobs(id).await?;
                if strategy == Strategy::Last {
                    children = children.split_off(children.len().saturating_sub(1));
                }
                for summary in children {
                    match self.fetch_job(&summary).await {
                        Ok(child) => artifacts = self.merge_artifacts(child, strategy, artifacts).await?,
                        Err(e) => warn!(child = ?summary.get("id"), error = %e, "cannot read child job"),
                    }
                }
            }
            Ok(artifacts)
        }
        .boxed()
    }

    /// Why a job failed, from failed child jobs and their events
    async fn failure_messages(&self, job: &Value) -> Result<Value, BrokerError> {
        let candidates = if job.get("type").and_then(Value::as_str) == Some("workflow_job") {
            let id = job.get("id").and_then(Value::as_u64).unwrap_or_default();
            let mut failed: Vec<Value> = self
                .child_jobs(id)
                .await?
                .into_iter()
                .filter(|child| child.get("failed").and_then(Value::as_bool) == Some(true))
                .collect();
            failed.reverse();
            let mut jobs = Vec::with_capacity(failed.len());
            for summary in &failed {
                jobs.push(self.fetch_job(summary).await?);
            }
            jobs
        } else {
            vec![job.clone()]
        };

        let mut messages = Vec::new();
        for child in candidates {
            let name = child.get("name").cloned().unwrap_or(Value::Null);
            if child.get("status").and_then(Value::as_str) == Some("error") {
                let reason = child
                    .get("result_traceback")
                    .filter(|t| t.as_str().is_some_and(|s| !s.is_empty()))
                    .or_else(|| child.get("job_explanation"))
                    .cloned()
                    .unwrap_or(Value::Null);
                messages.push(json!({"job": name, "reason": reason}));
                continue;
            }
            let id = child.get("id").and_then(Value::as_u64).unwrap_or_default();
            let events = self
                .get(
                    &format!("jobs/{id}/job_events/"),
                    &[("failed", "true"), ("page_size", PAGE_SIZE)],
                )
                .await?;
            for event in results(&events) {
                if let Some(msg) = event.pointer("/event_data/res/msg").filter(|m| !m.is_null()) {
                    messages.push(json!({
                        "job": name,
                        "task": event.pointer("/event_data/play"),
                        "reason": msg,
                    }));
                }
            }
        }

        Ok(match messages.len() {
            0 => json!({
                "reason": format!(
                    "Unable to determine failure cause for {} at {}",
                    job.get("name").and_then(Value::as_str).unwrap_or("job"),
                    job.get("url").and_then(Value::as_str).unwrap_or("")
                )
            }),
            _ if self.report_all_errors => Value::Array(messages),
            _ => messages.swap_remove(0),
        })
    }

    /// Launch `workflow` with `args` as a fresh request
    async fn run_workflow(
        &self,
        workflow: &str,
        mut args: Map<String, Value>,
    ) -> Result<Value, BrokerError> {
        args.insert("workflow".into(), Value::String(workflow.to_string()));
        let request = ActionRequest::new("workflow", args);
        let job = self.launch(Subject::Workflow, workflow, &request).await?;
        Ok(json!({
            "id": job.get("id"),
            "name": job.get("name"),
            "status": job.get("status"),
        }))
    }

    async fn compile_host_info(&self, host: &Value) -> Result<InventoryEntry, BrokerError> {
        let id = host.get("id").and_then(Value::as_u64).unwrap_or_default();
        let facts = match self.get(&format!("hosts/{id}/ansible_facts/"), &[]).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(host = ?host.get("name"), error = %e, "unable to get facts");
                Value::Object(Map::new())
            }
        };
        let variables = match host.get("variables") {
            Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        let hostname = variables
            .get("fqdn")
            .or_else(|| facts.get("ansible_fqdn"))
            .or_else(|| variables.pointer("/openstack/metadata/fqdn"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut info = non_empty(facts.get("_broker_facts"));
        info.insert("name".into(), host.get("name").cloned().unwrap_or(Value::Null));
        info.insert("type".into(), host.get("type").cloned().unwrap_or(Value::Null));
        info.insert("hostname".into(), hostname);
        info.insert(
            "ip".into(),
            variables.get("ansible_host").cloned().unwrap_or(Value::Null),
        );
        if let Some(inventory) = host.get("inventory").and_then(Value::as_u64) {
            info.insert("tower_inventory".into(), json!(inventory));
        }
        info.insert(
            ARGS.into(),
            Value::Object(non_empty(facts.get("_broker_args"))),
        );

        let mut extra = Map::new();
        extra.insert("os_distribution".into(), facts.get("ansible_distribution").cloned().unwrap_or_default());
        extra.insert(
            "os_distribution_version".into(),
            facts.get("ansible_distribution_version").cloned().unwrap_or_default(),
        );
        if let Some(nics) = facts.get("ansible_interfaces").filter(|n| n.as_array().is_some_and(|a| !a.is_empty())) {
            extra.insert("reported_devices".into(), json!({"nics": nics}));
        }
        info.extend(non_empty(Some(&Value::Object(extra))));
        Ok(InventoryEntry::from(info))
    }

    async fn template_help(&self, subject: Subject, name: &str) -> Result<Value, BrokerError> {
        let Some(template) = results(
            &self
                .get(&format!("{}/", subject.templates()), &[("name", name)])
                .await?,
        )
        .pop() else {
            return Err(BrokerError::User(format!("{} {name} not found", subject.label())));
        };
        let inventory = match template.get("inventory").and_then(Value::as_u64) {
            Some(id) => Some(self.inventory_name(id).await?),
            None => None,
        };
        Ok(json!({
            "description": template.get("description"),
            "extra_vars": parse_extra_vars(template.get("extra_vars")),
            "tower_inventory": inventory,
        }))
    }

    async fn template_names(&self, subject: Subject, limit: usize) -> Result<Vec<Value>, BrokerError> {
        let found = self
            .get(&format!("{}/", subject.templates()), &[("page_size", "1000")])
            .await?;
        Ok(results(&found)
            .into_iter()
            .filter(|t| {
                t.pointer("/summary_fields/user_capabilities/start")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .filter_map(|t| t.get("name").cloned())
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl Provider for AnsibleTower {
    fn name(&self) -> &'static str {
        NAME
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError> {
        if method != "execute" {
            return Err(BrokerError::not_implemented(NAME, method));
        }
        let (subject, name) = if let Some(name) = request.get_str("workflow") {
            (Subject::Workflow, name)
        } else if let Some(name) = request.get_str("job_template") {
            (Subject::JobTemplate, name)
        } else {
            return Err(BrokerError::User("No workflow or job template specified".into()));
        };

        let job = self.launch(subject, name, request).await?;
        match request.get("artifacts") {
            Some(strategy) => Ok(Value::Object(
                self.merge_artifacts(job, Strategy::from_value(Some(strategy)), Map::new())
                    .await?,
            )),
            None => Ok(job),
        }
    }

    async fn construct_host(
        &self,
        params: Option<Value>,
        ctx: HostContext,
    ) -> Result<Host, BrokerError> {
        let Some(job) = params else {
            return Ok(ctx.reconstruct());
        };
        let artifacts = if job.get("_broker_facts").is_some() {
            job.as_object().cloned().unwrap_or_default()
        } else {
            let strategy = Strategy::from_value(ctx.args.get("strategy"));
            self.merge_artifacts(job.clone(), strategy, Map::new()).await?
        };

        let facts = non_empty(artifacts.get("_broker_facts"));
        if facts.is_empty() {
            return Err(BrokerError::provider(
                NAME,
                format!("Host facts not found in artifacts for job {}", job.get("id").unwrap_or(&Value::Null)),
            ));
        }
        let (hostname, name, host_type) = fields_from_facts(&facts);
        let hostname = hostname.ok_or_else(|| {
            BrokerError::provider(NAME, format!("No hostname found in job artifacts: {facts:?}"))
        })?;
        debug!(hostname, ?name, host_type, "constructing host");

        let broker_args = non_empty(artifacts.get("_broker_args"));
        let args = if broker_args.is_empty() {
            ctx.args.clone()
        } else {
            broker_args
        };
        let mut extras = facts;
        extras.retain(|k, _| !k.ends_with("fqdn") && k != "name");

        let mut builder = ctx
            .host_builder(hostname)
            .with_args(args)
            .with_type(host_type)
            .with_extras(extras);
        if let Some(name) = name {
            builder = builder.with_name(name);
        }
        Ok(builder.build())
    }

    #[instrument(skip(self, host), fields(host = %host))]
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        let mut args = host.args().clone();
        args.remove("workflow");
        args.remove("artifacts");
        if let Some(inventory) = args.remove("tower_inventory").filter(|v| !v.is_null()) {
            args.insert("inventory".into(), json!(self.inventory_id(&inventory).await?));
        }
        let source_vm = args
            .remove("source_vm")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| host.name().unwrap_or(host.identifier()).to_string());
        args.insert("source_vm".into(), Value::String(source_vm));
        self.run_workflow(&self.release_workflow, args).await
    }

    #[instrument(skip(self, host, args), fields(host = %host))]
    async fn extend(&self, host: &Host, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        let mut request = Map::new();
        request.insert(
            "target_vm".into(),
            json!(host.name().unwrap_or(host.identifier())),
        );
        request.insert(
            "new_expire_time".into(),
            args.get("new_expire_time")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(self.new_expire_time.clone())),
        );
        if let Some(labels) = args.get("provider_labels").filter(|v| v.is_object()) {
            request.insert("provider_labels".into(), labels.clone());
        }
        if let Some(inventory) = host.args().get("tower_inventory").filter(|v| !v.is_null()) {
            request.insert("inventory".into(), inventory.clone());
        }
        self.run_workflow(&self.extend_workflow, request).await
    }

    #[instrument(skip(self))]
    async fn get_inventory(&self, filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        let user = match filter {
            Some(user) => user.to_string(),
            None => self.username().await?.to_string(),
        };
        let inventories = self.get("inventories/", &[("page_size", PAGE_SIZE)]).await?;
        let mut entries = Vec::new();
        for inventory in results(&inventories) {
            let name = inventory.get("name").and_then(Value::as_str).unwrap_or_default();
            if user != "@ll" && !name.contains(user.as_str()) {
                continue;
            }
            let id = inventory.get("id").and_then(Value::as_u64).unwrap_or_default();
            let hosts = self
                .get(&format!("inventories/{id}/hosts/"), &[("page_size", PAGE_SIZE)])
                .await?;
            for host in results(&hosts) {
                entries.push(self.compile_host_info(&host).await?);
            }
        }
        info!(count = entries.len(), user = %user, "compiled host information");
        Ok(entries)
    }

    async fn nick_help(&self, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        let limit = args
            .get("results_limit")
            .and_then(Value::as_u64)
            .map_or(self.results_limit, |n| n as usize);
        let named = |key: &str| args.get(key).and_then(Value::as_str);

        if let Some(name) = named("workflow") {
            return self.template_help(Subject::Workflow, name).await;
        }
        if args.contains_key("workflows") {
            return Ok(json!({"workflows": self.template_names(Subject::Workflow, limit).await?}));
        }
        if let Some(name) = named("job_template") {
            return self.template_help(Subject::JobTemplate, name).await;
        }
        if args.contains_key("job_templates") {
            return Ok(json!({
                "job_templates": self.template_names(Subject::JobTemplate, limit).await?
            }));
        }
        if let Some(name) = named("inventory") {
            let Some(inventory) =
                results(&self.get("inventories/", &[("name", name), ("kind", "")]).await?).pop()
            else {
                return Err(BrokerError::User(format!("Inventory {name} not found")));
            };
            return Ok(json!({
                "Name": inventory.get("name"),
                "ID": inventory.get("id"),
                "Description": inventory.get("description"),
            }));
        }
        if args.contains_key("inventories") {
            let found = self
                .get("inventories/", &[("kind", ""), ("page_size", "1000")])
                .await?;
            let names: Vec<Value> = results(&found)
                .into_iter()
                .filter_map(|i| i.get("name").cloned())
                .take(limit)
                .collect();
            return Ok(json!({ "inventories": names }));
        }
        if args.contains_key("templates") {
            let request = ActionRequest::new(
                "workflow",
                json!({"workflow": "list-templates"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            );
            let job = self.launch(Subject::Workflow, "list-templates", &request).await?;
            let artifacts = self.merge_artifacts(job, Strategy::Last, Map::new()).await?;
            let mut templates: Vec<String> = artifacts
                .get("data_out")
                .and_then(|d| d.get("list_templates"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
            templates.sort_unstable_by(|a, b| b.cmp(a));
            templates.dedup();
            templates.truncate(limit);
            return Ok(json!({ "templates": templates }));
        }
        Err(BrokerError::User(
            "AnsibleTower help accepts --workflows, --workflow, --job-templates, --job-template, \
             --inventories, --inventory or --templates"
                .into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_version() {
        assert_eq!(is_controller_version("2.5"), Some(true));
        assert_eq!(is_controller_version("2.4"), Some(false));
        assert_eq!(is_controller_version("3"), Some(true));
        assert_eq!(is_controller_version("next"), None);
    }

    #[test]
    fn test_parse_extra_vars() {
        let vars = parse_extra_vars(Some(&json!(r#"{"rhel_version": "9.4", "count": 1}"#)));
        assert_eq!(vars["rhel_version"], json!("9.4"));

        let vars = parse_extra_vars(Some(&json!("rhel_version: 9.4\nflavor: large")));
        assert_eq!(vars["flavor"], json!("large"));

        assert!(parse_extra_vars(Some(&json!(""))).is_empty());
        assert!(parse_extra_vars(None).is_empty());
    }

    #[test]
    fn test_fields_from_facts() {
        let facts = json!({
            "os_distribution": "RedHat",
            "fqdn": ["vm1.example.com", "alias.example.com"],
            "vm_provisioned": "vm1",
            "rhel_host_type": "satellite"
        });
        let (hostname, name, host_type) = fields_from_facts(facts.as_object().unwrap());
        assert_eq!(hostname.as_deref(), Some("vm1.example.com"));
        assert_eq!(name.as_deref(), Some("vm1"));
        assert_eq!(host_type, "satellite");
    }

    #[test]
    fn test_non_empty() {
        let map = non_empty(Some(&json!({"a": "", "b": null, "c": 0, "d": [], "e": "x"})));
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("c"));
        assert!(map.contains_key("e"));
    }
}
