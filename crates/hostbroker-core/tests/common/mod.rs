#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hostbroker_core::*;
use hostbroker_exec::{ConnectionInfo, ExecError, LocalSession, Session, SessionFactory};
use hostbroker_inventory::InventoryEntry;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

/// Records every backend call the stub sees
#[derive(Debug, Default)]
pub struct Calls {
    pub checkouts: AtomicUsize,
    pub executes: AtomicUsize,
    pub releases: AtomicUsize,
    pub extends: AtomicUsize,
    pub instances_built: AtomicUsize,
    pub fail_release_for: Mutex<Option<String>>,
    pub remote_inventory: Mutex<Vec<InventoryEntry>>,
}

impl Calls {
    pub fn backend_calls(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
            + self.executes.load(Ordering::SeqCst)
            + self.releases.load(Ordering::SeqCst)
            + self.extends.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StubProvider {
    calls: Arc<Calls>,
    instance: Option<String>,
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "Stub"
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    async fn invoke(&self, method: &str, request: &ActionRequest) -> Result<Value, BrokerError> {
        match method {
            "provision" => {
                let n = self.calls.checkouts.fetch_add(1, Ordering::SeqCst);
                if let Some(every) = request.get("fail_every").and_then(Value::as_u64)
                    && (n as u64) % every == every - 1
                {
                    return Err(BrokerError::provider("Stub", format!("checkout {n} failed")));
                }
                Ok(json!({
                    "hostname": format!("stub-{n}.example.com"),
                    "name": format!("stub-{n}"),
                    "flavor": request.payload,
                }))
            }
            "run_job" => {
                self.calls.executes.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ran": request.payload}))
            }
            other => Err(BrokerError::not_implemented("Stub", other)),
        }
    }

    async fn release(&self, host: &Host) -> Result<Value, BrokerError> {
        if let Some(name) = self.calls.fail_release_for.lock().unwrap().as_deref()
            && host.matches(name)
        {
            return Err(BrokerError::provider("Stub", format!("cannot release {name}")));
        }
        self.calls.releases.fetch_add(1, Ordering::SeqCst);
        Ok(json!(true))
    }

    async fn extend(&self, host: &Host, _args: &Map<String, Value>) -> Result<Value, BrokerError> {
        self.calls.extends.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"extended": host.identifier()}))
    }

    async fn get_inventory(&self, _filter: Option<&str>) -> Result<Vec<InventoryEntry>, BrokerError> {
        Ok(self.calls.remote_inventory.lock().unwrap().clone())
    }
}

/// Second provider so dispatch has something to be ambiguous with
#[derive(Debug)]
pub struct OtherProvider;

#[async_trait]
impl Provider for OtherProvider {
    fn name(&self) -> &'static str {
        "Other"
    }

    fn instance(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, _method: &str, _request: &ActionRequest) -> Result<Value, BrokerError> {
        Ok(json!({"hostname": "other.example.com"}))
    }
}

pub fn registry(calls: Arc<Calls>) -> ProviderRegistry {
    let stub_calls = calls.clone();
    ProviderRegistry::new(vec![
        ProviderDescriptor::new("Stub", move |settings: ProviderSettings| {
            stub_calls.instances_built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubProvider {
                calls: stub_calls.clone(),
                instance: settings.instance().map(str::to_string),
            }) as Arc<dyn Provider>)
        })
        .with_validators(vec![Validator::required("api_url")])
        .with_checkout("stub_host", "provision")
        .with_execute("stub_job", "run_job"),
        ProviderDescriptor::new("Other", |_settings: ProviderSettings| {
            Ok(Arc::new(OtherProvider) as Arc<dyn Provider>)
        })
        .with_checkout("other_host", "provision"),
    ])
    .unwrap()
}

pub struct Fixture {
    pub dir: TempDir,
    pub calls: Arc<Calls>,
    pub core: Arc<BrokerCore>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(
            r#"
[stub]
api_url = "http://stub.example.com"

[nicks.small]
stub_host = "small"
"#,
        )
    }

    pub fn with_settings(extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inventory = dir.path().join("inventory.yaml");
        let toml = format!("inventory_path = {:?}\n{extra}", inventory.display().to_string());
        let settings = Settings::from_toml_str(&toml).unwrap();
        let calls = Arc::new(Calls::default());
        let core = Arc::new(BrokerCore::new(settings, registry(calls.clone())));
        Self { dir, calls, core }
    }

    pub fn broker(&self) -> Broker {
        Broker::new(self.core.clone())
    }

    pub async fn inventory(&self) -> Vec<InventoryEntry> {
        self.core.inventory().load(None).await.unwrap()
    }
}

/// Opens local shell sessions regardless of hostname
#[derive(Debug)]
pub struct LocalFactory;

#[async_trait]
impl SessionFactory for LocalFactory {
    async fn open(&self, _conn: &ConnectionInfo) -> Result<Arc<dyn Session>, ExecError> {
        Ok(Arc::new(LocalSession::new()))
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

pub fn stub_request() -> CheckoutRequest {
    CheckoutRequest::new().with_arg("stub_host", "medium")
}
