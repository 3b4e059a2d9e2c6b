//! hostbroker-providers: backends that provision hosts
//!
//! Each module exposes a `descriptor()` for the provider registry:
//!
//! - `ansible_tower`: AnsibleTower / AAP workflows and job templates
//! - `beaker`: Beaker lab reservations through the `bkr` CLI
//! - `container`: podman or docker containers, local or remote
//! - `foreman`: Foreman hostgroup deployments
//!
//! # Examples
//!
//! ```no_run
//! use hostbroker_core::{Broker, BrokerCore, Settings};
//! use hostbroker_providers::default_registry;
//!
//! # async fn example() -> Result<(), hostbroker_core::BrokerError> {
//! let settings = Settings::discover(None)?;
//! let core = BrokerCore::new(settings, default_registry()?);
//! let broker = Broker::new(std::sync::Arc::new(core));
//! # let _ = broker;
//! # Ok(())
//! # }
//! ```

pub mod ansible_tower;
pub mod beaker;
pub mod cli;
pub mod container;
pub mod foreman;
pub mod http;
pub mod poll;

use hostbroker_core::{BrokerError, ProviderRegistry};

pub use ansible_tower::AnsibleTower;
pub use beaker::Beaker;
pub use container::Container;
pub use foreman::Foreman;
pub use http::{Auth, ClientError, RestClient};
pub use poll::{PollOptions, poll_until};

/// Registry of every built-in provider
///
/// # Errors
/// Returns `BrokerError::Configuration` if two providers claim the same action
pub fn default_registry() -> Result<ProviderRegistry, BrokerError> {
    ProviderRegistry::new(vec![
        ansible_tower::descriptor(),
        beaker::descriptor(),
        container::descriptor(),
        foreman::descriptor(),
    ])
}

/// Who asked for a resource: the CI build URL, else the local user
pub(crate) fn requester() -> String {
    std::env::var("BUILD_URL")
        .or_else(|_| std::env::var("USER").map(|user| format!("user:{user}")))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use hostbroker_core::ActionKind;
    use serde_json::{Map, Value, json};

    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_default_registry_routes_actions() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.providers().len(), 4);

        let resolved = registry
            .resolve(&args(json!({"workflow": "deploy-rhel", "AnsibleTower": "prod"})), None)
            .unwrap();
        assert_eq!(resolved.provider, "AnsibleTower");
        assert_eq!(resolved.instance.as_deref(), Some("prod"));

        let resolved = registry
            .resolve(&args(json!({"job_id": "J:1"})), Some(ActionKind::Checkout))
            .unwrap();
        assert_eq!(resolved.provider, "Beaker");
        assert_eq!(resolved.method, "submit_job");

        let resolved = registry
            .resolve(&args(json!({"container_app": "alpine"})), Some(ActionKind::Execute))
            .unwrap();
        assert_eq!(resolved.provider, "Container");

        let resolved = registry
            .resolve(&args(json!({"job_template": "sat-install"})), Some(ActionKind::Execute))
            .unwrap();
        assert_eq!(resolved.method, "execute");
    }

    #[test]
    fn test_checkout_action_rejected_for_execute() {
        let registry = default_registry().unwrap();
        let err = registry
            .resolve(&args(json!({"hostgroup": "rhel9"})), Some(ActionKind::Execute))
            .unwrap_err();
        assert!(matches!(err, BrokerError::User(_)));
    }
}
