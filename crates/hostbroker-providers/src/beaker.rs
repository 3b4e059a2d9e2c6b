//! Beaker lab scheduler, driven through the `bkr` CLI
//!
//! Checkout submits (or clones) a reservation job and polls its results XML
//! until a recipe passes. The host is released by cancelling the job.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use hostbroker_core::timeout::non_zero;
use hostbroker_core::{
    ActionRequest, BrokerError, Host, HostContext, Provider, ProviderDescriptor, ProviderSettings,
    Validator, ValueKind,
};
use hostbroker_exec::Session;
use hostbroker_inventory::InventoryEntry;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cli::{command_line, local_runner, run, run_checked};
use crate::poll::{PollOptions, poll_until};

/// Registered provider name
pub const NAME: &str = "Beaker";

const EXTEND_SCRIPT: &str = "/usr/bin/extendtesttime.sh";
const DEFAULT_EXTEND_HOURS: u64 = 99;
const DEFAULT_RESULTS_LIMIT: usize = 20;

/// Registry entry for Beaker
#[must_use]
pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor::new(NAME, |settings| {
        Ok(Arc::new(Beaker::new(&settings)?) as Arc<dyn Provider>)
    })
    .with_validators(vec![
        Validator::required("hub_url"),
        Validator::default_value("max_job_wait", "24h"),
        Validator::is_type("max_job_wait", ValueKind::Duration),
        Validator::default_value("poll_interval", "60s"),
        Validator::is_type("poll_interval", ValueKind::Duration),
        Validator::default_value("auth", "krbv"),
        Validator::default_value("results_limit", DEFAULT_RESULTS_LIMIT as u64),
        Validator::is_type("results_limit", ValueKind::Integer),
    ])
    .with_checkout("job_xml", "submit_job")
    .with_checkout("job_id", "submit_job")
    .with_help_option("jobs")
    .with_help_option("job")
}

// ============================================================================
// Results XML
// ============================================================================

static TAG_ATTRS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_][\w.-]*)="([^"]*)""#).expect("valid regex"));
static JOB_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<job\b([^>]*)>").expect("valid regex"));
static RECIPE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<recipe\b([^>]*)>").expect("valid regex"));
static WHITEBOARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<whiteboard>(.*?)</whiteboard>").expect("valid regex"));
static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"J:\d+").expect("valid regex"));

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn attribute(tag_body: &str, name: &str) -> Option<String> {
    TAG_ATTRS
        .captures_iter(tag_body)
        .find(|c| &c[1] == name)
        .map(|c| unescape(&c[2]))
}

/// Interesting parts of a `job-results` document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Job id, `J:` prefixed
    pub job_id: Option<String>,
    /// Job status attribute
    pub status: Option<String>,
    /// Whiteboard text
    pub whiteboard: Option<String>,
    /// System the first recipe runs on
    pub hostname: Option<String>,
    /// Distro of the first recipe
    pub distro: Option<String>,
}

impl JobSummary {
    /// Extract a summary from results XML
    #[must_use]
    pub fn parse(xml: &str) -> Self {
        let job = JOB_TAG.captures(xml).map(|c| c[1].to_string());
        let recipe = RECIPE_TAG.captures(xml).map(|c| c[1].to_string());
        Self {
            job_id: job
                .as_deref()
                .and_then(|j| attribute(j, "id"))
                .map(|id| normalize_job_id(&id)),
            status: job.as_deref().and_then(|j| attribute(j, "status")),
            whiteboard: WHITEBOARD
                .captures(xml)
                .map(|c| unescape(c[1].trim())),
            hostname: recipe.as_deref().and_then(|r| attribute(r, "system")),
            distro: recipe.as_deref().and_then(|r| attribute(r, "distro")),
        }
    }

    fn into_value(self) -> Value {
        let mut map = Map::new();
        for (key, value) in [
            ("job_id", self.job_id),
            ("whiteboard", self.whiteboard),
            ("hostname", self.hostname),
            ("distro", self.distro),
        ] {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value));
            }
        }
        Value::Object(map)
    }
}

/// Where a job stands according to its results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still waiting for a recipe to pass
    Running,
    /// A recipe passed; the system is ours
    Passed(JobSummary),
    /// Something failed or the scheduler raised
    Failed,
    /// The job finished with a warning
    Warned(JobSummary),
}

impl JobState {
    /// Classify results XML
    ///
    /// Any passing element means the reservation is in place, even while the
    /// job as a whole keeps running.
    #[must_use]
    pub fn from_results(xml: &str) -> Self {
        if xml.contains(r#"result="Pass""#) {
            JobState::Passed(JobSummary::parse(xml))
        } else if xml.contains(r#"result="Fail""#) || xml.contains("Exception: ") {
            JobState::Failed
        } else if xml.contains(r#"result="Warn""#) {
            JobState::Warned(JobSummary::parse(xml))
        } else {
            JobState::Running
        }
    }
}

/// `123`, `J:123` and `j:123` all become `J:123`
#[must_use]
pub fn normalize_job_id(job: &str) -> String {
    let job = job.trim();
    let bare = job
        .strip_prefix("J:")
        .or_else(|| job.strip_prefix("j:"))
        .unwrap_or(job);
    format!("J:{bare}")
}

// ============================================================================
// Provider
// ============================================================================

/// Beaker provider instance
pub struct Beaker {
    instance: Option<String>,
    hub_url: String,
    credentials: Option<(String, String)>,
    max_job_wait: Duration,
    poll_interval: Duration,
    results_limit: usize,
    runner: Arc<dyn Session>,
}

impl fmt::Debug for Beaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beaker")
            .field("instance", &self.instance)
            .field("hub_url", &self.hub_url)
            .field("username", &self.credentials.as_ref().map(|(u, _)| u))
            .field("max_job_wait", &self.max_job_wait)
            .finish_non_exhaustive()
    }
}

impl Beaker {
    /// Build from validated settings, running `bkr` locally
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if basic auth is selected without
    /// credentials
    pub fn new(settings: &ProviderSettings) -> Result<Self, BrokerError> {
        let credentials = if settings.get_str("auth") == Some("basic") {
            Some((
                settings.require_str("username")?.to_string(),
                settings.require_str("password")?.to_string(),
            ))
        } else {
            None
        };

        Ok(Self {
            instance: settings.instance().map(str::to_string),
            hub_url: settings.require_str("hub_url")?.to_string(),
            credentials,
            max_job_wait: settings
                .get_duration("max_job_wait")?
                .unwrap_or(Duration::from_secs(86_400)),
            poll_interval: settings
                .get_duration("poll_interval")?
                .unwrap_or(Duration::from_secs(60)),
            results_limit: settings
                .get_u64("results_limit")
                .map_or(DEFAULT_RESULTS_LIMIT, |n| n as usize),
            runner: local_runner(),
        })
    }

    /// Run `bkr` through another session
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn Session>) -> Self {
        self.runner = runner;
        self
    }

    fn bkr_line(&self, command: &str, args: &[&str]) -> Result<String, BrokerError> {
        let hub = format!("--hub={}", self.hub_url);
        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 5);
        argv.push(command.to_string());
        argv.extend(args.iter().map(|a| (*a).to_string()));
        argv.push("--insecure".to_string());
        argv.push(hub);
        if let Some((username, password)) = &self.credentials {
            argv.push(format!("--username={username}"));
            argv.push(format!("--password={password}"));
        }
        command_line("bkr", &argv)
    }

    async fn bkr(&self, command: &str, args: &[&str]) -> Result<String, BrokerError> {
        debug!(command, ?args, "running bkr");
        let line = self.bkr_line(command, args)?;
        run_checked(self.runner.as_ref(), NAME, &line).await
    }

    async fn job_results(&self, job_id: &str) -> Result<String, BrokerError> {
        self.bkr(
            "job-results",
            &[job_id, "--format=beaker-results-xml", "--prettyxml"],
        )
        .await
    }

    async fn check_job(&self, job_id: &str) -> Result<Option<Value>, BrokerError> {
        let xml = self.job_results(job_id).await?;
        match JobState::from_results(&xml) {
            JobState::Running => Ok(None),
            JobState::Passed(summary) => Ok(Some(summary.into_value())),
            JobState::Failed => Err(BrokerError::provider(
                NAME,
                format!("Job {job_id} failed:\n{}", xml.trim()),
            )),
            JobState::Warned(summary) => Err(BrokerError::provider(
                NAME,
                format!(
                    "Job {job_id} resulted in a warning. Status: {}",
                    summary.status.as_deref().unwrap_or("unknown")
                ),
            )),
        }
    }

    /// Submit or clone a job, then wait for its reservation
    #[instrument(skip(self, request), fields(action = %request.action))]
    async fn submit_job(&self, request: &ActionRequest) -> Result<Value, BrokerError> {
        let output = match request.action.as_str() {
            "job_xml" => {
                let path = request
                    .payload_str()
                    .ok_or_else(|| BrokerError::User("job_xml must be a file path".into()))?;
                if !std::path::Path::new(path).is_file() {
                    return Err(BrokerError::User(format!("job XML not found: {path}")));
                }
                self.bkr("job-submit", &[path]).await?
            }
            _ => {
                let job = match &request.payload {
                    Value::String(s) => normalize_job_id(s),
                    Value::Number(n) => normalize_job_id(&n.to_string()),
                    other => {
                        return Err(BrokerError::User(format!("invalid Beaker job id: {other}")));
                    }
                };
                self.bkr("job-clone", &[job.as_str()]).await?
            }
        };

        let job_id = SUBMITTED
            .find(&output)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                BrokerError::provider(NAME, format!("no job id in bkr output: {}", output.trim()))
            })?;
        info!(job_id = %job_id, "submitted job");

        let deadline = request
            .timeout("max_wait")?
            .or_else(|| non_zero(self.max_job_wait));
        let options = PollOptions::every(self.poll_interval).with_deadline(deadline);
        let result = poll_until(NAME, &format!("Job {job_id}"), options, &request.cancel, || {
            self.check_job(&job_id)
        })
        .await?;
        debug!(?result, "job completed");
        Ok(result)
    }

    /// Curated `system-details` for one system
    async fn system_details(&self, system: &str) -> Result<Map<String, Value>, BrokerError> {
        let raw = self.bkr("system-details", &[system, "--format=json"]).await?;
        let details: Value = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::provider(NAME, format!("unreadable system details: {e}")))?;
        Ok(curate_system(&details))
    }

    /// Job holding the current reservation on `hostname`
    async fn job_for_system(&self, hostname: &str) -> Result<Option<String>, BrokerError> {
        let raw = self.bkr("job-list", &["--mine"]).await?;
        let jobs: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        for job in jobs {
            let xml = self.job_results(&job).await?;
            if JobSummary::parse(&xml).hostname.as_deref() == Some(hostname) {
                return Ok(Some(normalize_job_id(&job)));
            }
        }
        Ok(None)
    }

    async fn job_for_host(&self, host: &Host) -> Result<String, BrokerError> {
        if let Some(job) = host.extra("job_id").and_then(Value::as_str) {
            return Ok(normalize_job_id(job));
        }
        let hostname = host.hostname().unwrap_or_default();
        self.job_for_system(hostname)
            .await?
            .ok_or_else(|| BrokerError::provider(NAME, format!("no job found for {hostname}")))
    }
}

fn person(value: &Value) -> Option<String> {
    let name = value.get("display_name")?.as_str()?;
    let email = value.get("email_address").and_then(Value::as_str).unwrap_or("");
    Some(format!("{name} <{email}>"))
}

/// Reduce `system-details` JSON to inventory fields
fn curate_system(details: &Value) -> Map<String, Value> {
    let mut curated = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value.filter(|v| !v.is_null()) {
            curated.insert(key.to_string(), value);
        }
    };
    put("hostname", details.get("fqdn").cloned());
    put("mac_address", details.get("mac_address").cloned());
    put("owner", details.get("owner").and_then(person).map(Value::String));
    put("id", details.get("id").cloned());
    if let Some(reservation) = details.get("current_reservation").filter(|r| !r.is_null()) {
        put("reservation_id", reservation.get("recipe_id").cloned());
        put("reserved_on", reservation.get("start_time").cloned());
        put("expires_on", reservation.get("finish_time").cloned());
        put(
            "reserved_for",
            reservation.get("user").and_then(person).map(Value::String),
        );
    }
    curated
}

#[async_trait]
impl Provider for Beaker {
    fn name(&self) -> &'static str {
        NAME
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError> {
        match method {
            "submit_job" => self.submit_job(request).await,
            other => Err(BrokerError::not_implemented(NAME, other)),
        }
    }

    async fn construct_host(
        &self,
        params: Option<Value>,
        ctx: HostContext,
    ) -> Result<Host, BrokerError> {
        let Some(Value::Object(mut data)) = params else {
            return Ok(ctx.reconstruct());
        };
        let hostname = data
            .remove("hostname")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| BrokerError::provider(NAME, "job passed without a system"))?;

        match self.system_details(&hostname).await {
            Ok(details) => {
                for (key, value) in details {
                    if key != "hostname" {
                        data.entry(key).or_insert(value);
                    }
                }
            }
            Err(e) => warn!(host = %hostname, error = %e, "could not read system details"),
        }
        Ok(ctx.host_builder(hostname).with_extras(data).build())
    }

    #[instrument(skip(self, host), fields(host = %host))]
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        let job = self.job_for_host(host).await?;
        self.bkr("job-cancel", &[job.as_str()]).await?;
        info!(job_id = %job, "cancelled job");
        Ok(json!({ "cancelled": job }))
    }

    #[instrument(skip(self, host, args), fields(host = %host))]
    async fn extend(&self, host: &Host, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        let hours = match args.get("extend_duration").filter(|v| !v.is_null()) {
            None => DEFAULT_EXTEND_HOURS,
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .filter(|h| (1..=99).contains(h))
                .ok_or_else(|| {
                    BrokerError::User("extend_duration must be between 1 and 99 hours".into())
                })?,
        };
        let hostname = host.identifier().to_string();
        let command = format!("{EXTEND_SCRIPT} {hours}");
        let hint = format!("Try running: root@{hostname} {command}");

        match host.execute(&command, None).await {
            Ok(result) if result.success() => Ok(json!({ "extended": hostname, "hours": hours })),
            Ok(result) => Err(BrokerError::provider(
                NAME,
                format!(
                    "Failed to extend host {hostname}: {}\n{hint}",
                    result.combined_output().trim()
                ),
            )),
            Err(e) => Err(BrokerError::provider(
                NAME,
                format!("Failed to extend host {hostname}: {e}\n{hint}"),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn get_inventory(&self, _filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        let line = self.bkr_line("system-list", &["--mine"])?;
        let listing = run(self.runner.as_ref(), NAME, &line).await?;
        if !listing.success() {
            info!("no systems reserved");
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for system in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut details = self.system_details(system).await?;
            if !details.contains_key("job_id") {
                let hostname = details
                    .get("hostname")
                    .and_then(Value::as_str)
                    .unwrap_or(system)
                    .to_string();
                if let Some(job) = self.job_for_system(&hostname).await? {
                    details.insert("job_id".into(), Value::String(job));
                }
            }
            entries.push(InventoryEntry::from(details));
        }
        Ok(entries)
    }

    async fn nick_help(&self, args: &Map<String, Value>) -> Result<Value, BrokerError> {
        if let Some(job) = args.get("job").and_then(Value::as_str) {
            let job = normalize_job_id(job);
            let xml = self
                .bkr("job-clone", &[job.as_str(), "--prettyxml", "--dryrun"])
                .await?;
            return Ok(json!({ "job": job, "xml": xml }));
        }
        if args.contains_key("jobs") {
            let limit = args
                .get("results_limit")
                .and_then(Value::as_u64)
                .map_or(self.results_limit, |n| n as usize);
            let raw = self.bkr("job-list", &["--mine"]).await?;
            let jobs: Vec<String> = serde_json::from_str(&raw)
                .unwrap_or_else(|_| raw.lines().map(str::to_string).collect());
            return Ok(json!({ "jobs": jobs.into_iter().take(limit).collect::<Vec<_>>() }));
        }
        Err(BrokerError::User(
            "Beaker help accepts --jobs or --job <id>".into(),
        ))
    }
}
