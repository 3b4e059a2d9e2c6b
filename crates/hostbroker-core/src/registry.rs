//! Action registry
//!
//! Maps action keys (`workflow`, `job_xml`, `container_host`, ...) to the
//! provider and method that handle them. Built once from provider descriptors
//! and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hostbroker_inventory::ProviderActions;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::BrokerError;
use crate::provider::Provider;
use crate::settings::{ProviderSettings, Settings};
use crate::validators::Validator;

/// What an action produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    /// Provisions a host
    Checkout,
    /// Returns a result without provisioning
    Execute,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Checkout => f.write_str("checkout"),
            ActionKind::Execute => f.write_str("execute"),
        }
    }
}

/// One action a provider offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSpec {
    /// Argument key that selects the action
    pub key: String,
    /// Provider method invoked for it
    pub method: String,
    /// What it produces
    pub kind: ActionKind,
}

/// Builds a provider from its validated settings
pub type ProviderFactory =
    Arc<dyn Fn(ProviderSettings) -> Result<Arc<dyn Provider>, BrokerError> + Send + Sync>;

/// Static description of a provider
#[derive(Clone)]
pub struct ProviderDescriptor {
    name: &'static str,
    validators: Vec<Validator>,
    actions: Vec<ActionSpec>,
    help_options: Vec<String>,
    factory: ProviderFactory,
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("actions", &self.actions)
            .field("help_options", &self.help_options)
            .finish_non_exhaustive()
    }
}

impl ProviderDescriptor {
    /// Describe a provider built by `factory`
    pub fn new<F>(name: &'static str, factory: F) -> Self
    where
        F: Fn(ProviderSettings) -> Result<Arc<dyn Provider>, BrokerError> + Send + Sync + 'static,
    {
        Self {
            name,
            validators: Vec::new(),
            actions: Vec::new(),
            help_options: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Settings rules checked before the provider is built
    #[must_use]
    pub fn with_validators(mut self, validators: Vec<Validator>) -> Self {
        self.validators = validators;
        self
    }

    /// Register a checkout action
    #[must_use]
    pub fn with_checkout(mut self, key: impl Into<String>, method: impl Into<String>) -> Self {
        self.actions.push(ActionSpec {
            key: key.into(),
            method: method.into(),
            kind: ActionKind::Checkout,
        });
        self
    }

    /// Register an execute action
    #[must_use]
    pub fn with_execute(mut self, key: impl Into<String>, method: impl Into<String>) -> Self {
        self.actions.push(ActionSpec {
            key: key.into(),
            method: method.into(),
            kind: ActionKind::Execute,
        });
        self
    }

    /// Option accepted by `nick_help`
    #[must_use]
    pub fn with_help_option(mut self, option: impl Into<String>) -> Self {
        self.help_options.push(option.into());
        self
    }

    /// Provider name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Settings rules
    #[must_use]
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Actions offered
    #[must_use]
    pub fn actions(&self) -> &[ActionSpec] {
        &self.actions
    }

    /// Options accepted by `nick_help`
    #[must_use]
    pub fn help_options(&self) -> &[String] {
        &self.help_options
    }
}

/// An action key matched in a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAction {
    /// Matched key
    pub key: String,
    /// Provider name
    pub provider: &'static str,
    /// Method to invoke
    pub method: String,
    /// What it produces
    pub kind: ActionKind,
    /// Instance named by a `<Provider>` argument, if any
    pub instance: Option<String>,
}

/// Immutable table of providers and their actions
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
    actions: BTreeMap<String, (usize, ActionSpec)>,
}

impl ProviderRegistry {
    /// Build the registry
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if two providers claim the same
    /// name or action key
    pub fn new(providers: Vec<ProviderDescriptor>) -> Result<Self, BrokerError> {
        let mut actions = BTreeMap::new();
        for (index, descriptor) in providers.iter().enumerate() {
            if providers[..index]
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(descriptor.name))
            {
                return Err(BrokerError::Configuration(format!(
                    "provider {} registered twice",
                    descriptor.name
                )));
            }
            for action in &descriptor.actions {
                if let Some((other, _)) = actions.get(&action.key) {
                    let other: &ProviderDescriptor = &providers[*other];
                    return Err(BrokerError::Configuration(format!(
                        "action {} is claimed by both {} and {}",
                        action.key, other.name, descriptor.name
                    )));
                }
                actions.insert(action.key.clone(), (index, action.clone()));
            }
        }
        Ok(Self { providers, actions })
    }

    /// Every provider, in registration order
    #[must_use]
    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    /// Provider by name, ignoring case
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Every action, sorted by key
    pub fn actions(&self) -> impl Iterator<Item = (&str, &'static str, &ActionSpec)> {
        self.actions
            .iter()
            .map(|(key, (index, spec))| (key.as_str(), self.providers[*index].name, spec))
    }

    /// Action keys per provider, for `$action` inventory fields
    #[must_use]
    pub fn provider_actions(&self) -> ProviderActions {
        self.providers
            .iter()
            .map(|p| {
                (
                    p.name.to_string(),
                    p.actions.iter().map(|a| a.key.clone()).collect(),
                )
            })
            .collect()
    }

    /// Find the single action key present in `args`
    ///
    /// # Errors
    /// Returns `BrokerError::User` when no key or more than one key is
    /// present, or when the action is not of the `expected` kind
    pub fn resolve(
        &self,
        args: &Map<String, Value>,
        expected: Option<ActionKind>,
    ) -> Result<ResolvedAction, BrokerError> {
        let found: Vec<&String> = args
            .iter()
            .filter(|(key, value)| !value.is_null() && self.actions.contains_key(*key))
            .map(|(key, _)| key)
            .collect();

        let key = match found.as_slice() {
            [key] => *key,
            [] => {
                let known: Vec<&str> = self.actions.keys().map(String::as_str).collect();
                return Err(BrokerError::User(format!(
                    "no action found in request; expected one of: {}",
                    known.join(", ")
                )));
            }
            many => {
                let keys: Vec<&str> = many.iter().map(|k| k.as_str()).collect();
                return Err(BrokerError::User(format!(
                    "ambiguous request: found multiple actions ({}); provide exactly one",
                    keys.join(", ")
                )));
            }
        };

        let Some((index, spec)) = self.actions.get(key) else {
            return Err(BrokerError::User(format!("unknown action {key}")));
        };
        if let Some(expected) = expected
            && spec.kind != expected
        {
            return Err(BrokerError::User(format!(
                "{key} is a {} action, not {expected}",
                spec.kind
            )));
        }

        let provider = self.providers[*index].name;
        let instance = args
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(provider))
            .and_then(|(_, v)| v.as_str())
            .map(str::to_string);

        debug!(action = %key, provider, instance = ?instance, "resolved action");
        Ok(ResolvedAction {
            key: key.clone(),
            provider,
            method: spec.method.clone(),
            kind: spec.kind,
            instance,
        })
    }

    /// Validate settings and build a provider instance
    ///
    /// # Errors
    /// Returns `BrokerError::User` for an unknown provider and
    /// `BrokerError::Configuration` when validation fails
    pub fn instantiate(
        &self,
        provider: &str,
        instance: Option<&str>,
        settings: &Settings,
    ) -> Result<Arc<dyn Provider>, BrokerError> {
        let descriptor = self
            .provider(provider)
            .ok_or_else(|| BrokerError::User(format!("unknown provider {provider}")))?;
        let snapshot = settings.provider_settings(descriptor.name, instance, &descriptor.validators)?;
        (descriptor.factory)(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::request::ActionRequest;

    #[derive(Debug)]
    struct Noop(Option<String>);

    #[async_trait]
    impl Provider for Noop {
        fn name(&self) -> &'static str {
            "Noop"
        }

        fn instance(&self) -> Option<&str> {
            self.0.as_deref()
        }

        async fn invoke(&self, _method: &str, _request: &ActionRequest) -> Result<Value, BrokerError> {
            Ok(Value::Null)
        }
    }

    fn noop(name: &'static str) -> ProviderDescriptor {
        ProviderDescriptor::new(name, |s: ProviderSettings| {
            Ok(Arc::new(Noop(s.instance().map(str::to_string))) as Arc<dyn Provider>)
        })
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(vec![
            noop("Noop")
                .with_checkout("workflow", "execute_workflow")
                .with_execute("job_template", "execute_job"),
            noop("Other").with_checkout("image", "run_image"),
        ])
        .unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_resolve_single_action() {
        let resolved = registry()
            .resolve(&args(json!({"workflow": "deploy", "Noop": "prod"})), None)
            .unwrap();
        assert_eq!(resolved.provider, "Noop");
        assert_eq!(resolved.method, "execute_workflow");
        assert_eq!(resolved.instance.as_deref(), Some("prod"));
    }

    #[test]
    fn test_resolve_rejects_zero_and_many() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&args(json!({"count": 2})), None),
            Err(BrokerError::User(_))
        ));
        let err = registry
            .resolve(&args(json!({"workflow": "a", "image": "b"})), None)
            .unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_resolve_checks_kind() {
        let err = registry()
            .resolve(&args(json!({"job_template": "x"})), Some(ActionKind::Checkout))
            .unwrap_err();
        assert!(matches!(err, BrokerError::User(_)));
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let result = ProviderRegistry::new(vec![
            noop("A").with_checkout("workflow", "a"),
            noop("B").with_checkout("workflow", "b"),
        ]);
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }

    #[test]
    fn test_enumeration() {
        let registry = registry();
        let keys: Vec<&str> = registry.actions().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec!["image", "job_template", "workflow"]);
        assert_eq!(
            registry.provider_actions()["Noop"],
            vec!["workflow".to_string(), "job_template".to_string()]
        );
    }

    #[test]
    fn test_instantiate_unknown_provider() {
        let err = registry()
            .instantiate("Missing", None, &Settings::default())
            .unwrap_err();
        assert!(matches!(err, BrokerError::User(_)));
    }
}
