//! Subcommand handlers

use std::collections::BTreeSet;
use std::sync::Arc;

use eyre::Result;
use hostbroker_core::settings::{SETTINGS_FILE, broker_directory};
use hostbroker_core::{
    Broker, BrokerCore, BrokerError, CheckoutRequest, Host, HostSelection, Settings, WorkerPool,
};
use hostbroker_inventory::{Filter, InventoryEntry};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::output::{self, OutputFormat};

// ============================================================================
// Host selection
// ============================================================================

/// Which inventory hosts a command targets
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Hostnames, names or inventory indexes
    pub selectors: Vec<String>,
    /// Every host in the (filtered) inventory
    pub all: bool,
    /// Inventory filter expression
    pub filter: Option<String>,
}

/// Entries named by `selectors`, in selector order
///
/// A selector that parses as an index into `entries` picks that entry;
/// otherwise it must match a hostname or name.
///
/// # Errors
/// Returns `BrokerError::User` if nothing was selected or a selector matches
/// no entry
pub fn pick_entries(
    entries: Vec<InventoryEntry>,
    selectors: &[String],
    all: bool,
) -> Result<Vec<InventoryEntry>, BrokerError> {
    if all {
        return Ok(entries);
    }
    if selectors.is_empty() {
        return Err(BrokerError::User(
            "name at least one host, or pass --all".to_string(),
        ));
    }

    let mut picked = BTreeSet::new();
    let mut order = Vec::new();
    for selector in selectors {
        let index = selector
            .parse::<usize>()
            .ok()
            .filter(|i| *i < entries.len())
            .or_else(|| entries.iter().position(|e| e.matches(selector)))
            .ok_or_else(|| BrokerError::User(format!("no host in inventory matches {selector}")))?;
        if picked.insert(index) {
            order.push(index);
        }
    }
    Ok(order.into_iter().map(|i| entries[i].clone()).collect())
}

fn parse_filter(source: Option<&str>) -> Result<Option<Filter>, BrokerError> {
    Ok(source.map(Filter::parse).transpose()?)
}

async fn select_hosts(core: &BrokerCore, selection: &Selection) -> Result<Vec<Arc<Host>>> {
    let filter = parse_filter(selection.filter.as_deref())?;
    let entries = core.inventory().load(filter.as_ref()).await.map_err(BrokerError::from)?;
    let picked = pick_entries(entries, &selection.selectors, selection.all)?;

    let mut hosts = Vec::with_capacity(picked.len());
    for entry in picked {
        if let Some(host) = core.reconstruct_host(entry).await {
            hosts.push(Arc::new(host));
        }
    }
    if hosts.is_empty() {
        warn!("no hosts selected");
    }
    Ok(hosts)
}

// ============================================================================
// Lifecycle
// ============================================================================

pub async fn checkout(
    core: Arc<BrokerCore>,
    pool: Arc<dyn WorkerPool>,
    request: CheckoutRequest,
) -> Result<()> {
    let mut broker = Broker::new(core).with_pool(pool);
    let hosts = broker.checkout(&request).await?;
    for host in &hosts {
        println!("{host}");
    }
    Ok(())
}

pub async fn checkin(core: Arc<BrokerCore>, selection: Selection, sequential: bool) -> Result<()> {
    let hosts = select_hosts(&core, &selection).await?;
    let count = hosts.len();
    let mut broker = Broker::new(core)
        .with_hosts(hosts)
        .with_sequential(sequential);
    broker.checkin(HostSelection::All).await?;
    info!(count, "checkin complete");
    Ok(())
}

pub async fn extend(
    core: Arc<BrokerCore>,
    selection: Selection,
    args: Map<String, Value>,
    sequential: bool,
) -> Result<()> {
    let hosts = select_hosts(&core, &selection).await?;
    let broker = Broker::new(core)
        .with_hosts(hosts)
        .with_sequential(sequential);
    let results = broker.extend(HostSelection::All, &args).await?;
    if !results.is_empty() {
        print!("{}", output::render(&Value::Array(results), OutputFormat::Yaml)?);
    }
    Ok(())
}

pub async fn duplicate(
    core: Arc<BrokerCore>,
    pool: Arc<dyn WorkerPool>,
    selection: Selection,
    count: usize,
) -> Result<()> {
    let hosts = select_hosts(&core, &selection).await?;
    let mut broker = Broker::new(core).with_pool(pool);
    for host in &hosts {
        info!(host = %host, count, "duplicating");
        for copy in broker.duplicate(host, count).await? {
            println!("{copy}");
        }
    }
    Ok(())
}

pub async fn execute(
    core: Arc<BrokerCore>,
    request: CheckoutRequest,
    format: OutputFormat,
) -> Result<()> {
    let result = Broker::new(core).execute(&request).await?;
    let rendered = output::render(&result, format)?;
    if rendered.ends_with('\n') {
        print!("{rendered}");
    } else {
        println!("{rendered}");
    }
    Ok(())
}

// ============================================================================
// Inventory
// ============================================================================

/// How `inventory` prints entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryView {
    /// Table of `inventory_fields`
    Table,
    /// `index: <inventory_list_vars>` lines
    List,
    /// Full entries as YAML
    Details,
}

pub async fn inventory(
    core: Arc<BrokerCore>,
    sync: Option<String>,
    filter: Option<String>,
    view: InventoryView,
) -> Result<()> {
    if let Some(target) = sync {
        let report = Broker::new(core.clone()).sync_inventory(&target).await?;
        eprint!("{}", serde_yaml::to_string(&report)?);
    }

    let filter = parse_filter(filter.as_deref())?;
    let entries = core.inventory().load(filter.as_ref()).await.map_err(BrokerError::from)?;
    if entries.is_empty() {
        info!("inventory is empty");
        return Ok(());
    }

    let actions = core.registry().provider_actions();
    let settings = core.settings();
    match view {
        InventoryView::Table => println!(
            "{}",
            output::inventory_table(&entries, &settings.inventory_fields, &actions)
        ),
        InventoryView::List => println!(
            "{}",
            output::inventory_list(&entries, &settings.inventory_list_vars, &actions)
        ),
        InventoryView::Details => {
            for (index, entry) in entries.iter().enumerate() {
                println!("{index}:");
                let yaml = serde_yaml::to_string(entry.as_map())?;
                for line in yaml.lines() {
                    println!("  {line}");
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Providers
// ============================================================================

pub async fn providers(
    core: Arc<BrokerCore>,
    name: Option<String>,
    mut args: Map<String, Value>,
) -> Result<()> {
    let registry = core.registry();
    let Some(name) = name else {
        for descriptor in registry.providers() {
            let configured = if core.settings().has_section(descriptor.name()) {
                ""
            } else {
                " (not configured)"
            };
            println!("{}{configured}", descriptor.name());
            for action in descriptor.actions() {
                println!("  --{:<16} {}", action.key, action.kind);
            }
            if !descriptor.help_options().is_empty() {
                println!("  help: {}", descriptor.help_options().join(", "));
            }
        }
        return Ok(());
    };

    let descriptor = registry
        .provider(&name)
        .ok_or_else(|| BrokerError::User(format!("unknown provider {name}")))?;
    let instance = match args.remove(descriptor.name()) {
        Some(Value::String(instance)) => Some(instance),
        _ => None,
    };
    let provider = registry.instantiate(descriptor.name(), instance.as_deref(), core.settings())?;
    let help = provider.nick_help(&args).await?;
    print!("{}", output::render(&help, OutputFormat::Yaml)?);
    Ok(())
}

// ============================================================================
// Config
// ============================================================================

/// Settings, or the subtree at a dotted `key`, as YAML
///
/// # Errors
/// Returns `BrokerError::User` for an unknown key
pub fn config_view(settings: &Settings, key: Option<&str>) -> Result<String> {
    let mut value = serde_json::to_value(settings)?;
    if let Some(key) = key {
        for part in key.split('.') {
            value = match value {
                Value::Object(mut map) => map.remove(part),
                _ => None,
            }
            .ok_or_else(|| BrokerError::User(format!("no setting named {key}")))?;
        }
    }
    Ok(serde_yaml::to_string(&value)?)
}

/// Where settings came from, or where they would be read from
#[must_use]
pub fn config_path(settings: &Settings) -> String {
    match settings.source() {
        Some(path) => path.display().to_string(),
        None => format!(
            "{} (not found)",
            broker_directory().join(SETTINGS_FILE).display()
        ),
    }
}
