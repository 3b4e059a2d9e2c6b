//! Provider capability contract
//!
//! A provider is a configured handle to one backend instance. It is created
//! per invocation from a validated settings snapshot, runs action methods,
//! and turns what the backend returned into a `Host`.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use hostbroker_inventory::InventoryEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;
use crate::host::{Host, HostBuilder};
use crate::request::ActionRequest;
use crate::settings::SshSettings;

/// Serializable identity of a provider instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderView {
    /// Provider name, e.g. "Beaker"
    pub name: String,
    /// Settings instance, if the provider has named instances
    pub instance: Option<String>,
}

impl ProviderView {
    /// Create a view
    pub fn new(name: impl Into<String>, instance: Option<String>) -> Self {
        Self {
            name: name.into(),
            instance,
        }
    }
}

impl fmt::Display for ProviderView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}::{instance}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A backend that can provision and release hosts
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// Provider name as registered
    fn name(&self) -> &'static str;

    /// Settings instance this provider was built for
    fn instance(&self) -> Option<&str>;

    /// Serializable identity
    fn view(&self) -> ProviderView {
        ProviderView::new(self.name(), self.instance().map(str::to_string))
    }

    /// Run an action method
    ///
    /// Checkout methods return the backend data later handed to
    /// `construct_host`; execute methods return their result.
    ///
    /// # Errors
    /// Returns `BrokerError::Provider` when the backend call fails
    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError>;

    /// Build a host from fresh backend data, or from `ctx.record` when
    /// `params` is `None`
    ///
    /// # Errors
    /// Returns `BrokerError::Provider` if the data does not describe a host
    async fn construct_host(
        &self,
        params: Option<Value>,
        ctx: HostContext,
    ) -> Result<Host, BrokerError> {
        match params {
            Some(Value::Object(map)) => {
                let hostname = map
                    .get("hostname")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BrokerError::provider(self.name(), "checkout returned no hostname")
                    })?
                    .to_string();
                let mut extras = map;
                extras.remove("hostname");
                Ok(ctx.host_builder(hostname).with_extras(extras).build())
            }
            Some(other) => Err(BrokerError::provider(
                self.name(),
                format!("cannot build a host from {other}"),
            )),
            None => Ok(ctx.reconstruct()),
        }
    }

    /// Give a host back to the backend
    ///
    /// # Errors
    /// Returns `BrokerError::NotImplemented` unless the provider supports it
    async fn release(&self, _host: &Host) -> Result<Value, BrokerError> {
        Err(BrokerError::not_implemented(self.name(), "release"))
    }

    /// Extend a host's lease
    ///
    /// # Errors
    /// Returns `BrokerError::NotImplemented` unless the provider supports it
    async fn extend(&self, _host: &Host, _args: &Map<String, Value>) -> Result<Value, BrokerError> {
        Err(BrokerError::not_implemented(self.name(), "extend"))
    }

    /// Hosts the backend believes belong to us
    ///
    /// # Errors
    /// Returns `BrokerError::NotImplemented` unless the provider supports it
    async fn get_inventory(&self, _filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        Err(BrokerError::not_implemented(self.name(), "get_inventory"))
    }

    /// Describe what can be requested (workflows, images, ...)
    ///
    /// # Errors
    /// Returns `BrokerError::NotImplemented` unless the provider supports it
    async fn nick_help(&self, _args: &Map<String, Value>) -> Result<Value, BrokerError> {
        Err(BrokerError::not_implemented(self.name(), "nick_help"))
    }
}

/// Capability a host uses to release itself
#[async_trait]
pub trait Releaser: Send + Sync + Debug {
    /// Release `host`
    async fn release(&self, host: &Host) -> Result<Value, BrokerError>;
}

/// Releases through the provider instance that built the host
#[derive(Debug, Clone)]
pub struct BoundProvider(pub Arc<dyn Provider>);

#[async_trait]
impl Releaser for BoundProvider {
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        self.0.release(host).await
    }
}

/// Releaser for hosts that were never bound to a provider
#[derive(Debug, Clone, Default)]
pub struct Unreleasable;

#[async_trait]
impl Releaser for Unreleasable {
    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        let provider = host
            .provider()
            .map_or_else(|| "unknown".to_string(), |p| p.name.clone());
        Err(BrokerError::not_implemented(provider, "release"))
    }
}

/// Everything a provider needs to build a host
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Provider identity stamped on the host
    pub provider: ProviderView,
    /// Bound release capability
    pub releaser: Arc<dyn Releaser>,
    /// Connection defaults
    pub ssh: SshSettings,
    /// Arguments the host was checked out with
    pub args: Map<String, Value>,
    /// Inventory record when reconstructing
    pub record: Option<InventoryEntry>,
}

impl HostContext {
    /// Context bound to `provider`
    pub fn new(provider: Arc<dyn Provider>, ssh: SshSettings) -> Self {
        Self {
            provider: provider.view(),
            releaser: Arc::new(BoundProvider(provider)),
            ssh,
            args: Map::new(),
            record: None,
        }
    }

    /// Attach checkout arguments
    #[must_use]
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    /// Attach the inventory record being reconstructed
    #[must_use]
    pub fn with_record(mut self, record: InventoryEntry) -> Self {
        self.record = Some(record);
        self
    }

    /// Builder with provider tags, arguments, defaults and releaser applied
    pub fn host_builder(&self, hostname: impl Into<String>) -> HostBuilder {
        Host::builder(hostname)
            .with_ssh_defaults(self.ssh.clone())
            .with_provider(self.provider.clone())
            .with_args(self.args.clone())
            .with_releaser(self.releaser.clone())
    }

    /// Rebuild a host from `record`, keeping the bound releaser
    #[must_use]
    pub fn reconstruct(&self) -> Host {
        let record = self.record.clone().unwrap_or_default();
        Host::from_record(record, self.ssh.clone()).with_releaser(self.releaser.clone())
    }
}
