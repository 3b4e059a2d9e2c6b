//! Broker orchestrator
//!
//! `BrokerCore` holds everything immutable (settings, registry, inventory
//! store, host classes) and is shared with workers. `Broker` adds the working
//! set of hosts this caller checked out and drives the checkout, checkin,
//! extend and sync protocols.
//!
//! A host is never returned without being in inventory, and never recorded
//! before its provider reported success.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use hostbroker_exec::CommandResult;
use hostbroker_inventory::entry::{PROVIDER, PROVIDER_INSTANCE};
use hostbroker_inventory::{Filter, InventoryEntry, InventoryStore};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::BrokerError;
use crate::host::{Host, HostClasses};
use crate::pool::{TaskPool, WorkerPool, WorkerTask};
use crate::provider::{HostContext, Provider};
use crate::registry::{ActionKind, ProviderRegistry};
use crate::request::{ActionRequest, CheckoutRequest};
use crate::settings::Settings;

// ============================================================================
// Core
// ============================================================================

/// Shared, immutable broker state
#[derive(Debug)]
pub struct BrokerCore {
    settings: Settings,
    registry: ProviderRegistry,
    inventory: InventoryStore,
    host_classes: HostClasses,
    cancel: CancellationToken,
}

impl BrokerCore {
    /// Core using the inventory file named by `settings`
    #[must_use]
    pub fn new(settings: Settings, registry: ProviderRegistry) -> Self {
        let inventory = InventoryStore::new(settings.inventory_path());
        Self {
            settings,
            registry,
            inventory,
            host_classes: HostClasses::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a different inventory store
    #[must_use]
    pub fn with_inventory(mut self, inventory: InventoryStore) -> Self {
        self.inventory = inventory;
        self
    }

    /// Register host setup/teardown behaviour
    #[must_use]
    pub fn with_host_classes(mut self, classes: HostClasses) -> Self {
        self.host_classes = classes;
        self
    }

    /// Settings
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Inventory store
    #[must_use]
    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    /// Host classes
    #[must_use]
    pub fn host_classes(&self) -> &HostClasses {
        &self.host_classes
    }

    /// Stop every polling loop started through this core
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn action_request(&self, key: &str, args: Map<String, Value>) -> ActionRequest {
        ActionRequest::new(key, args).with_cancel(self.cancel.child_token())
    }

    /// Check out one host from fully resolved arguments
    ///
    /// Does not touch the inventory.
    ///
    /// # Errors
    /// Returns `BrokerError::User` for a bad request, `Configuration` for bad
    /// settings (both before any backend call), or whatever the provider
    /// returns
    #[instrument(skip_all)]
    pub async fn provision(&self, args: Map<String, Value>) -> Result<Host, BrokerError> {
        let action = self.registry.resolve(&args, Some(ActionKind::Checkout))?;
        let provider =
            self.registry
                .instantiate(action.provider, action.instance.as_deref(), &self.settings)?;

        info!(provider = %provider.view(), action = %action.key, "checking out host");
        let request = self.action_request(&action.key, args.clone());
        let data = provider.invoke(&action.method, &request).await?;

        let ctx = HostContext::new(provider.clone(), self.settings.ssh.clone()).with_args(args);
        let host = provider.construct_host(Some(data), ctx).await?;
        info!(host = %host, provider = %provider.view(), "host checked out");
        Ok(host)
    }

    /// Provider instance for a host's provider tag
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the host has no provider tag, or the
    /// instantiation error
    pub fn provider_for(&self, host: &Host) -> Result<Arc<dyn Provider>, BrokerError> {
        let view = host.provider().ok_or_else(|| BrokerError::Host {
            host: host.identifier().to_string(),
            message: "host has no provider".to_string(),
        })?;
        self.registry
            .instantiate(&view.name, view.instance.as_deref(), &self.settings)
    }

    /// Rebuild a host from its inventory record
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the record has no provider tag, or the
    /// error from instantiating the provider or constructing the host
    pub async fn rebuild_host(&self, entry: InventoryEntry) -> Result<Host, BrokerError> {
        let Some(provider_name) = entry.provider() else {
            return Err(BrokerError::Host {
                host: entry.identifier().unwrap_or("<unnamed>").to_string(),
                message: "inventory entry has no provider".to_string(),
            });
        };
        let provider =
            self.registry
                .instantiate(provider_name, entry.provider_instance(), &self.settings)?;

        let ctx = HostContext::new(provider.clone(), self.settings.ssh.clone())
            .with_args(entry.args().cloned().unwrap_or_default())
            .with_record(entry);
        provider.construct_host(None, ctx).await
    }

    /// Rebuild a host from its inventory record, if possible
    ///
    /// Returns `None`, with a warning, when the record's provider is unknown
    /// or cannot be built.
    pub async fn reconstruct_host(&self, entry: InventoryEntry) -> Option<Host> {
        let host_id = entry.identifier().map(str::to_string);
        let provider = entry.provider().map(str::to_string);
        match self.rebuild_host(entry).await {
            Ok(host) => Some(host),
            Err(e) => {
                warn!(host = ?host_id, provider = ?provider, error = %e, "cannot reconstruct host, skipping");
                None
            }
        }
    }
}

// ============================================================================
// Host selection
// ============================================================================

/// Which hosts a batch operation applies to
#[derive(Debug, Clone)]
pub enum HostSelection {
    /// Every host in the working set
    All,
    /// One host
    One(Arc<Host>),
    /// A list of hosts
    Many(Vec<Arc<Host>>),
    /// Hosts grouped by name, as returned by `checkout_many`
    Groups(BTreeMap<String, Vec<Arc<Host>>>),
}

impl HostSelection {
    fn resolve(self, working_set: &[Arc<Host>]) -> Vec<Arc<Host>> {
        match self {
            HostSelection::All => working_set.to_vec(),
            HostSelection::One(host) => vec![host],
            HostSelection::Many(hosts) => hosts,
            HostSelection::Groups(groups) => groups.into_values().flatten().collect(),
        }
    }
}

impl From<Arc<Host>> for HostSelection {
    fn from(host: Arc<Host>) -> Self {
        HostSelection::One(host)
    }
}

impl From<Vec<Arc<Host>>> for HostSelection {
    fn from(hosts: Vec<Arc<Host>>) -> Self {
        HostSelection::Many(hosts)
    }
}

/// Result of reconciling local inventory with a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Provider synced
    pub provider: String,
    /// Identifiers added locally
    pub added: Vec<String>,
    /// Identifiers removed locally
    pub removed: Vec<String>,
}

/// Parse `provider[:arg][::instance]`
fn parse_sync_target<'a>(target: &'a str) -> (&'a str, Option<&'a str>, Option<&'a str>) {
    let (head, instance) = match target.split_once("::") {
        Some((head, instance)) => (head, Some(instance)),
        None => (target, None),
    };
    let (provider, arg) = match head.split_once(':') {
        Some((provider, arg)) => (provider, Some(arg)),
        None => (head, None),
    };
    let non_empty = |s: Option<&'a str>| s.filter(|s| !s.is_empty());
    (provider, non_empty(arg), non_empty(instance))
}

// ============================================================================
// Broker
// ============================================================================

/// Orchestrates checkouts for one caller
#[derive(Debug)]
pub struct Broker {
    core: Arc<BrokerCore>,
    pool: Arc<dyn WorkerPool>,
    hosts: Vec<Arc<Host>>,
    sequential: bool,
}

impl Broker {
    /// Broker with an in-process worker pool and an empty working set
    #[must_use]
    pub fn new(core: Arc<BrokerCore>) -> Self {
        Self {
            core,
            pool: Arc::new(TaskPool::new()),
            hosts: Vec::new(),
            sequential: false,
        }
    }

    /// Use a different worker pool
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Start with hosts already checked out
    #[must_use]
    pub fn with_hosts(mut self, hosts: Vec<Arc<Host>>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Check in and extend one host at a time instead of concurrently
    #[must_use]
    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Shared state
    #[must_use]
    pub fn core(&self) -> &Arc<BrokerCore> {
        &self.core
    }

    /// Working set
    #[must_use]
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    // ------------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------------

    /// Check out `request.count` hosts
    ///
    /// Hosts are persisted to inventory and added to the working set before
    /// this returns. With a partial failure, the successful hosts are still
    /// persisted and tracked, then `BrokerError::Batch` is returned.
    ///
    /// # Errors
    /// `User`/`Configuration` errors before any backend call; the provider's
    /// error for a single host; `Batch` when some of several hosts failed
    #[instrument(skip_all, fields(count = request.count))]
    pub async fn checkout(&mut self, request: &CheckoutRequest) -> Result<Vec<Arc<Host>>, BrokerError> {
        let (hosts, failure) = checkout_batch(&self.core, self.pool.as_ref(), request).await?;
        self.hosts.extend(hosts.iter().cloned());
        match failure {
            Some(e) => Err(e),
            None => Ok(hosts),
        }
    }

    /// Run several checkouts concurrently, grouped by name
    ///
    /// If any group fails, every host that did get checked out is checked
    /// back in before the error is returned.
    ///
    /// # Errors
    /// Returns `BrokerError::Batch` with every failure
    pub async fn checkout_many(
        &mut self,
        requests: BTreeMap<String, CheckoutRequest>,
    ) -> Result<BTreeMap<String, Vec<Arc<Host>>>, BrokerError> {
        let core = &self.core;
        let pool = self.pool.as_ref();
        let total = requests.len();
        let results = join_all(requests.into_iter().map(|(name, request)| async move {
            let result = checkout_batch(core, pool, &request).await;
            (name, result)
        }))
        .await;

        let mut groups = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, result) in results {
            match result {
                Ok((hosts, failure)) => {
                    self.hosts.extend(hosts.iter().cloned());
                    if let Some(e) = failure {
                        errors.push(e);
                    }
                    groups.insert(name, hosts);
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            return Ok(groups);
        }

        warn!(failed = errors.len(), "checkout group failed, checking in the rest");
        if let Err(e) = self.checkin(HostSelection::Groups(groups)).await {
            error!(error = %e, "checkin after failed checkout group also failed");
            errors.push(e);
        }
        Err(BrokerError::Batch { total, errors })
    }

    /// Check out the same arguments again
    ///
    /// # Errors
    /// Returns `BrokerError::User` if the host has no recorded arguments
    pub async fn duplicate(&mut self, host: &Host, count: usize) -> Result<Vec<Arc<Host>>, BrokerError> {
        if host.args().is_empty() {
            return Err(BrokerError::User(format!(
                "{host} has no checkout arguments to duplicate"
            )));
        }
        let request = CheckoutRequest::new()
            .with_args(host.args().clone())
            .with_count(count);
        self.checkout(&request).await
    }

    // ------------------------------------------------------------------------
    // Checkin and extend
    // ------------------------------------------------------------------------

    /// Release hosts, last first
    ///
    /// Hosts are checked in concurrently, up to `thread_limit` at a time, or
    /// one after another when the broker is sequential. Each host is closed,
    /// released, dropped from the working set and removed from inventory as
    /// soon as its own release finishes. Concurrently, a release error does
    /// not stop the other hosts; sequentially it stops the batch, and hosts
    /// already processed stay checked in.
    ///
    /// # Errors
    /// The release or inventory error, or `Batch` when several hosts failed
    #[instrument(skip_all, fields(sequential = self.sequential))]
    pub async fn checkin(&mut self, selection: HostSelection) -> Result<(), BrokerError> {
        let hosts = selection.resolve(&self.hosts);
        if hosts.is_empty() {
            debug!("checkin called with no hosts");
            return Ok(());
        }
        let total = hosts.len();
        let limit = self.batch_limit(total);
        let core = self.core.clone();

        let mut pending = stream::iter(hosts.into_iter().rev())
            .map(|host| {
                let core = core.clone();
                async move {
                    let result = checkin_host(&core, &host).await;
                    (host, result)
                }
            })
            .buffer_unordered(limit);

        let mut errors = Vec::new();
        while let Some((host, result)) = pending.next().await {
            match result {
                Ok(()) => self.hosts.retain(|tracked| !Arc::ptr_eq(tracked, &host)),
                Err(e) => {
                    error!(host = %host, error = %e, "checkin failed");
                    errors.push(e);
                    if self.sequential {
                        break;
                    }
                }
            }
        }
        batch_result(total, errors)
    }

    /// Extend each selected host's lease
    ///
    /// Runs concurrently up to `thread_limit`, or one host at a time when the
    /// broker is sequential. Results follow reverse selection order.
    ///
    /// # Errors
    /// The provider error, or `Batch` when several hosts failed
    #[instrument(skip_all, fields(sequential = self.sequential))]
    pub async fn extend(
        &self,
        selection: HostSelection,
        args: &Map<String, Value>,
    ) -> Result<Vec<Value>, BrokerError> {
        let hosts = selection.resolve(&self.hosts);
        let total = hosts.len();
        let limit = self.batch_limit(total);

        let mut pending = stream::iter(hosts.into_iter().rev())
            .map(|host| async move {
                info!(host = %host, "extending");
                let provider = self.core.provider_for(&host)?;
                provider.extend(&host, args).await
            })
            .buffered(limit);

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();
        while let Some(result) = pending.next().await {
            match result {
                Ok(value) => results.push(value),
                Err(e) => {
                    error!(error = %e, "extend failed");
                    errors.push(e);
                    if self.sequential {
                        break;
                    }
                }
            }
        }
        batch_result(total, errors).map(|()| results)
    }

    fn batch_limit(&self, hosts: usize) -> usize {
        if self.sequential {
            return 1;
        }
        self.core
            .settings()
            .thread_limit
            .unwrap_or(hosts)
            .clamp(1, hosts.max(1))
    }

    // ------------------------------------------------------------------------
    // Execute
    // ------------------------------------------------------------------------

    /// Run an execute action and return its result
    ///
    /// # Errors
    /// `User`/`Configuration` errors before any backend call, then whatever
    /// the provider returns
    pub async fn execute(&self, request: &CheckoutRequest) -> Result<Value, BrokerError> {
        let args = request.resolve_args(self.core.settings())?;
        let action = self.core.registry().resolve(&args, Some(ActionKind::Execute))?;
        let provider = self.core.registry().instantiate(
            action.provider,
            action.instance.as_deref(),
            self.core.settings(),
        )?;
        info!(provider = %provider.view(), action = %action.key, "executing");
        let request = self.core.action_request(&action.key, args);
        provider.invoke(&action.method, &request).await
    }

    /// Run a command on several hosts at once
    ///
    /// Concurrency is bounded by `thread_limit`. Results keep host order.
    pub async fn run_parallel(
        &self,
        hosts: &[Arc<Host>],
        command: &str,
        timeout: Option<Duration>,
    ) -> Vec<(String, Result<CommandResult, BrokerError>)> {
        let limit = self
            .core
            .settings()
            .thread_limit
            .unwrap_or(hosts.len())
            .max(1);
        stream::iter(hosts.iter().cloned())
            .map(|host| async move {
                let result = host.execute(command, timeout).await;
                (host.identifier().to_string(), result)
            })
            .buffered(limit)
            .collect()
            .await
    }

    // ------------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------------

    /// Load hosts from inventory into the working set
    ///
    /// Entries that cannot be reconstructed are skipped with a warning.
    ///
    /// # Errors
    /// Returns `BrokerError::Inventory` if the file cannot be read
    pub async fn from_inventory(&mut self, filter: Option<&Filter>) -> Result<Vec<Arc<Host>>, BrokerError> {
        let entries = self.core.inventory().load(filter).await?;
        let mut hosts = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(host) = self.core.reconstruct_host(entry).await {
                hosts.push(Arc::new(host));
            }
        }
        self.hosts.extend(hosts.iter().cloned());
        Ok(hosts)
    }

    /// Reconcile local inventory with what a backend reports
    ///
    /// `target` is `provider[:arg][::instance]`. Remote hosts missing locally
    /// are added and local hosts missing remotely are removed. Only local
    /// hosts of the synced instance are compared. Nothing is released on the
    /// backend.
    ///
    /// # Errors
    /// Returns the provider's error, or `NotImplemented` if it cannot list
    /// inventory
    #[instrument(skip(self))]
    pub async fn sync_inventory(&self, target: &str) -> Result<SyncReport, BrokerError> {
        let (provider_name, arg, instance) = parse_sync_target(target);
        let provider = self
            .core
            .registry()
            .instantiate(provider_name, instance, self.core.settings())?;
        let view = provider.view();

        let mut remote = provider.get_inventory(arg).await?;
        for entry in &mut remote {
            entry.insert(PROVIDER, view.name.clone());
            if let Some(instance) = &view.instance {
                entry.insert(PROVIDER_INSTANCE, instance.clone());
            }
        }

        let local: Vec<InventoryEntry> = self
            .core
            .inventory()
            .load(None)
            .await?
            .into_iter()
            .filter(|e| e.provider() == Some(view.name.as_str()))
            .filter(|e| {
                view.instance.is_none() || e.provider_instance() == view.instance.as_deref()
            })
            .collect();

        let added: Vec<InventoryEntry> = remote
            .iter()
            .filter(|r| !local.iter().any(|l| l.same_host(r)))
            .cloned()
            .collect();
        let removed: Vec<String> = local
            .iter()
            .filter(|l| !remote.iter().any(|r| r.same_host(l)))
            .filter_map(|l| l.identifier().map(str::to_string))
            .collect();

        let report = SyncReport {
            provider: view.to_string(),
            added: added
                .iter()
                .filter_map(|e| e.identifier().map(str::to_string))
                .collect(),
            removed: removed.clone(),
        };
        info!(
            provider = %view,
            added = report.added.len(),
            removed = report.removed.len(),
            "inventory synced"
        );

        self.core.inventory().update(added, &removed).await?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Scoped use
    // ------------------------------------------------------------------------

    /// Check out, set up, run `body`, tear down and check in
    ///
    /// Teardown and checkin happen even when setup or `body` fails. The
    /// body's error wins over a checkin error.
    ///
    /// # Errors
    /// The checkout, setup, body or checkin error
    pub async fn scoped<F, Fut, T>(&mut self, request: &CheckoutRequest, body: F) -> Result<T, BrokerError>
    where
        F: FnOnce(Vec<Arc<Host>>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let before = self.hosts.len();
        let hosts = match self.checkout(request).await {
            Ok(hosts) => hosts,
            Err(e) => {
                let partial = self.hosts[before..].to_vec();
                if let Err(checkin_err) = self.checkin(HostSelection::Many(partial)).await {
                    error!(error = %checkin_err, "checkin after failed checkout also failed");
                }
                return Err(e);
            }
        };

        let mut outcome = Ok(());
        for host in &hosts {
            if let Some(class) = self.core.host_classes().for_host(host)
                && let Err(e) = class.setup(host).await
            {
                outcome = Err(e);
                break;
            }
        }
        let outcome = match outcome {
            Ok(()) => body(hosts.clone()).await,
            Err(e) => Err(e),
        };

        for host in &hosts {
            if let Some(class) = self.core.host_classes().for_host(host)
                && let Err(e) = class.teardown(host).await
            {
                warn!(host = %host, error = %e, "teardown failed");
            }
        }

        let checkin = self.checkin(HostSelection::Many(hosts)).await;
        match (outcome, checkin) {
            (Err(e), checkin) => {
                if let Err(checkin_err) = checkin {
                    error!(error = %checkin_err, "checkin after failed body also failed");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

/// Close, release and forget one host
async fn checkin_host(core: &BrokerCore, host: &Host) -> Result<(), BrokerError> {
    info!(host = %host, "checking in");
    if let Err(e) = host.close().await {
        warn!(host = %host, error = %e, "closing session failed");
    }
    host.release().await?;
    core.inventory()
        .remove(&[host.identifier().to_string()])
        .await?;
    debug!(host = %host, "host checked in");
    Ok(())
}

/// One error as itself, several as `Batch`
fn batch_result(total: usize, mut errors: Vec<BrokerError>) -> Result<(), BrokerError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(BrokerError::Batch { total, errors }),
    }
}

/// Check out one request's hosts and persist the successes
///
/// Returns the persisted hosts and, if some failed, the error to report
/// after the caller has tracked them.
async fn checkout_batch(
    core: &Arc<BrokerCore>,
    pool: &dyn WorkerPool,
    request: &CheckoutRequest,
) -> Result<(Vec<Arc<Host>>, Option<BrokerError>), BrokerError> {
    let args = request.resolve_args(core.settings())?;
    // reject bad requests before any provider exists
    core.registry().resolve(&args, Some(ActionKind::Checkout))?;

    if request.count == 0 {
        return Ok((Vec::new(), None));
    }

    let mut hosts = Vec::with_capacity(request.count);
    let mut records = Vec::with_capacity(request.count);
    let mut errors = Vec::new();

    if request.count == 1 {
        let host = core.provision(args).await?;
        records.push(host.to_record());
        hosts.push(host);
    } else {
        let tasks = (0..request.count)
            .map(|_| WorkerTask::new(args.clone(), core.settings()))
            .collect();
        for result in pool.run(core.clone(), tasks).await {
            match result {
                Ok(record) => {
                    match core.rebuild_host(record.clone()).await {
                        Ok(host) => hosts.push(host),
                        Err(e) => {
                            error!(host = ?record.identifier(), error = %e, "cannot rebuild worker result");
                            errors.push(e);
                        }
                    }
                    // recorded even if it cannot be rebuilt here, so it is never lost
                    records.push(record);
                }
                Err(e) => errors.push(e),
            }
        }
    }

    core.inventory().add(records).await?;
    let hosts: Vec<Arc<Host>> = hosts.into_iter().map(Arc::new).collect();

    if request.connect {
        for host in &hosts {
            if let Err(e) = host.connect().await {
                errors.push(e);
            }
        }
    }

    let failure = if errors.is_empty() {
        None
    } else {
        error!(failed = errors.len(), total = request.count, "checkout partially failed");
        Some(BrokerError::Batch {
            total: request.count,
            errors,
        })
    };
    Ok((hosts, failure))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_target() {
        assert_eq!(parse_sync_target("Beaker"), ("Beaker", None, None));
        assert_eq!(
            parse_sync_target("AnsibleTower:jdoe"),
            ("AnsibleTower", Some("jdoe"), None)
        );
        assert_eq!(
            parse_sync_target("AnsibleTower::prod"),
            ("AnsibleTower", None, Some("prod"))
        );
        assert_eq!(
            parse_sync_target("AnsibleTower:jdoe::prod"),
            ("AnsibleTower", Some("jdoe"), Some("prod"))
        );
    }
}
