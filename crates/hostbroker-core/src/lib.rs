//! hostbroker-core: provider abstraction and host lifecycle orchestration
//!
//! This crate provides:
//! - The `Provider` contract and the action registry that dispatches to it
//! - The `Host` entity with its lazily opened session
//! - The `Broker` orchestrator: checkout, checkin, extend, execute, sync
//! - Worker pools for multi-host checkout
//! - Settings loading with per-provider validated snapshots

pub mod broker;
pub mod error;
pub mod host;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod request;
pub mod settings;
pub mod timeout;
pub mod validators;

pub use broker::{Broker, BrokerCore, HostSelection, SyncReport};
pub use error::BrokerError;
pub use host::{Host, HostBuilder, HostClass, HostClasses, HostHook, HostShell, host_hook};
pub use pool::{ProcessPool, TaskPool, WorkerOutcome, WorkerPool, WorkerTask, serve_worker};
pub use provider::{BoundProvider, HostContext, Provider, ProviderView, Releaser, Unreleasable};
pub use registry::{ActionKind, ActionSpec, ProviderDescriptor, ProviderRegistry, ResolvedAction};
pub use request::{ActionRequest, CheckoutRequest};
pub use settings::{ProviderSettings, Settings, SshSettings};
pub use timeout::parse_timeout;
pub use validators::{Validator, ValueKind};
