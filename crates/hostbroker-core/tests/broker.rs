mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use common::{Fixture, LocalFactory, stub_request};
use futures::FutureExt;
use hostbroker_core::*;
use hostbroker_inventory::entry::PROVIDER;
use hostbroker_inventory::{Filter, InventoryEntry};
use serde_json::{Map, json};

/// Task pool whose last result names a provider nobody registered
#[derive(Debug)]
struct OrphaningPool;

#[async_trait]
impl WorkerPool for OrphaningPool {
    async fn run(
        &self,
        core: Arc<BrokerCore>,
        tasks: Vec<WorkerTask>,
    ) -> Vec<Result<InventoryEntry, BrokerError>> {
        let mut results = TaskPool::new().run(core, tasks).await;
        if let Some(Ok(record)) = results.last_mut() {
            record.insert(PROVIDER, "Ghost");
        }
        results
    }
}

fn remaining_names(inventory: &[InventoryEntry]) -> Vec<String> {
    let mut names: Vec<String> = inventory
        .iter()
        .filter_map(|e| e.name().map(str::to_string))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_checkout_then_checkin_leaves_no_entries() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let hosts = broker.checkout(&stub_request()).await.unwrap();
    assert_eq!(hosts.len(), 1);
    let hostname = hosts[0].hostname().unwrap().to_string();

    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].hostname(), Some(hostname.as_str()));
    assert_eq!(inventory[0].provider(), Some("Stub"));
    assert_eq!(inventory[0].get_path("_broker_args.stub_host"), Some(&json!("medium")));

    broker.checkin(HostSelection::All).await.unwrap();
    assert!(broker.hosts().is_empty());
    assert!(fx.inventory().await.iter().all(|e| !e.matches(&hostname)));
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_record_round_trip_through_reconstruct() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    let host = broker.checkout(&stub_request()).await.unwrap().remove(0);

    let record = host.to_record();
    let rebuilt = fx.core.reconstruct_host(record.clone()).await.unwrap();
    assert_eq!(rebuilt.to_record(), record);
    assert_eq!(rebuilt.extra("flavor"), Some(&json!("medium")));

    // the rebuilt host can still release itself through its provider
    rebuilt.release().await.unwrap();
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ambiguous_dispatch_makes_no_backend_calls() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let request = stub_request().with_arg("other_host", "x");
    let err = broker.checkout(&request).await.unwrap_err();
    assert!(matches!(err, BrokerError::User(_)));

    let err = broker.checkout(&CheckoutRequest::new()).await.unwrap_err();
    assert!(matches!(err, BrokerError::User(_)));

    assert_eq!(fx.calls.backend_calls(), 0);
    assert_eq!(fx.calls.instances_built.load(Ordering::SeqCst), 0);
    assert!(fx.inventory().await.is_empty());
}

#[tokio::test]
async fn test_missing_setting_is_configuration_error() {
    let fx = Fixture::with_settings("[stub]\nregion = \"eu\"\n");
    let mut broker = fx.broker();

    let err = broker.checkout(&stub_request()).await.unwrap_err();
    let BrokerError::Configuration(message) = &err else {
        panic!("expected configuration error, got {err}");
    };
    assert!(message.contains("api_url is required"));
    assert_eq!(err.exit_code(), 8);
    assert_eq!(fx.calls.backend_calls(), 0);
}

#[tokio::test]
async fn test_multi_host_checkout_counts() {
    for count in [1, 2, 7, 50] {
        let fx = Fixture::new();
        let mut broker = fx.broker();

        let hosts = broker
            .checkout(&stub_request().with_count(count))
            .await
            .unwrap();
        assert_eq!(hosts.len(), count);
        assert_eq!(broker.hosts().len(), count);
        assert_eq!(fx.inventory().await.len(), count);

        broker.checkin(HostSelection::All).await.unwrap();
        assert!(broker.hosts().is_empty());
        assert!(fx.inventory().await.is_empty());
        assert_eq!(fx.calls.releases.load(Ordering::SeqCst), count);
    }
}

#[tokio::test]
async fn test_thread_limit_bounds_pool() {
    let fx = Fixture::with_settings("thread_limit = 2\n[stub]\napi_url = \"u\"\n");
    let mut broker = fx.broker();
    let hosts = broker
        .checkout(&stub_request().with_count(5))
        .await
        .unwrap();
    assert_eq!(hosts.len(), 5);
}

#[tokio::test]
async fn test_partial_failure_keeps_successes() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let request = stub_request().with_count(6).with_arg("fail_every", 3);
    let err = broker.checkout(&request).await.unwrap_err();
    let BrokerError::Batch { total, errors } = &err else {
        panic!("expected batch error, got {err}");
    };
    assert_eq!(*total, 6);
    assert_eq!(errors.len(), 2);
    assert_eq!(err.exit_code(), 7);

    assert_eq!(broker.hosts().len(), 4);
    assert_eq!(fx.inventory().await.len(), 4);

    broker.checkin(HostSelection::All).await.unwrap();
    assert!(fx.inventory().await.is_empty());
}

#[tokio::test]
async fn test_sequential_checkin_stops_on_release_error() {
    let fx = Fixture::new();
    let mut broker = fx.broker().with_sequential(true);
    for _ in 0..3 {
        broker.checkout(&stub_request()).await.unwrap();
    }
    *fx.calls.fail_release_for.lock().unwrap() = Some("stub-1".to_string());

    let err = broker.checkin(HostSelection::All).await.unwrap_err();
    assert!(matches!(err, BrokerError::Provider { .. }));

    // stub-2 went first and is gone; stub-1 failed; stub-0 never started
    assert_eq!(remaining_names(&fx.inventory().await), vec!["stub-0", "stub-1"]);
    assert_eq!(broker.hosts().len(), 2);
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_checkin_releases_the_rest() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    for _ in 0..4 {
        broker.checkout(&stub_request()).await.unwrap();
    }
    *fx.calls.fail_release_for.lock().unwrap() = Some("stub-1".to_string());

    let err = broker.checkin(HostSelection::All).await.unwrap_err();
    assert!(matches!(err, BrokerError::Provider { .. }));
    assert!(err.to_string().contains("cannot release stub-1"));

    // only the host that failed is still tracked
    assert_eq!(remaining_names(&fx.inventory().await), vec!["stub-1"]);
    assert_eq!(broker.hosts().len(), 1);
    assert!(broker.hosts()[0].matches("stub-1"));
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_concurrent_checkin_respects_thread_limit() {
    let fx = Fixture::with_settings("thread_limit = 2\n[stub]\napi_url = \"u\"\n");
    let mut broker = fx.broker();
    broker
        .checkout(&stub_request().with_count(5))
        .await
        .unwrap();

    broker.checkin(HostSelection::All).await.unwrap();
    assert!(broker.hosts().is_empty());
    assert!(fx.inventory().await.is_empty());
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_checkin_one_host() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    let hosts = broker
        .checkout(&stub_request().with_count(2))
        .await
        .unwrap();

    broker.checkin(hosts[0].clone().into()).await.unwrap();
    assert_eq!(broker.hosts().len(), 1);
    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 1);
    assert!(hosts[1].matches(inventory[0].hostname().unwrap()));
}

#[tokio::test]
async fn test_nick_resolves_arguments() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    let hosts = broker
        .checkout(&CheckoutRequest::new().with_nick("small"))
        .await
        .unwrap();
    assert_eq!(hosts[0].extra("flavor"), Some(&json!("small")));

    let err = broker
        .checkout(&CheckoutRequest::new().with_nick("huge"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown nick: huge");
    assert_eq!(err.exit_code(), 11);
}

#[tokio::test]
async fn test_execute_action() {
    let fx = Fixture::new();
    let broker = fx.broker();

    let result = broker
        .execute(&CheckoutRequest::new().with_arg("stub_job", "report"))
        .await
        .unwrap();
    assert_eq!(result, json!({"ran": "report"}));
    assert!(fx.inventory().await.is_empty());

    // a checkout key is not an execute action
    let err = broker.execute(&stub_request()).await.unwrap_err();
    assert!(matches!(err, BrokerError::User(_)));
}

#[tokio::test]
async fn test_extend_in_reverse_order() {
    for sequential in [false, true] {
        let fx = Fixture::new();
        let mut broker = fx.broker().with_sequential(sequential);
        broker
            .checkout(&stub_request().with_count(2))
            .await
            .unwrap();

        let results = broker
            .extend(HostSelection::All, &Map::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["extended"], json!(broker.hosts()[1].identifier()));
        assert_eq!(fx.calls.extends.load(Ordering::SeqCst), 2);
    }
}

#[tokio::test]
async fn test_extend_unknown_provider_fails() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    broker.checkout(&stub_request()).await.unwrap();
    let stray = Arc::new(Host::builder("stray.example.com").build());

    let err = broker
        .extend(HostSelection::Many(vec![broker.hosts()[0].clone(), stray]), &Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Host { .. }), "{err}");
    // the tracked host was still extended
    assert_eq!(fx.calls.extends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_reuses_arguments() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    let original = broker.checkout(&stub_request()).await.unwrap().remove(0);

    let copies = broker.duplicate(&original, 2).await.unwrap();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|h| h.extra("flavor") == Some(&json!("medium"))));
    assert_eq!(fx.inventory().await.len(), 3);
}

#[tokio::test]
async fn test_sync_inventory_adds_and_removes() {
    let fx = Fixture::new();
    let mut broker = fx.broker();
    let local = broker.checkout(&stub_request()).await.unwrap().remove(0);

    let remote: InventoryEntry = serde_json::from_value(json!({
        "hostname": "remote.example.com",
        "name": "remote-1",
    }))
    .unwrap();
    fx.calls.remote_inventory.lock().unwrap().push(remote);

    let report = broker.sync_inventory("Stub").await.unwrap();
    assert_eq!(report.added, vec!["remote.example.com"]);
    assert_eq!(report.removed, vec![local.hostname().unwrap()]);

    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].provider(), Some("Stub"));
    assert!(inventory[0].matches("remote-1"));
    // nothing was released on the backend
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 0);

    // a second sync is a no-op
    let report = broker.sync_inventory("Stub").await.unwrap();
    assert!(report.added.is_empty() && report.removed.is_empty());
}

#[tokio::test]
async fn test_sync_inventory_leaves_other_instances_alone() {
    let fx = Fixture::with_settings(
        r#"
[stub]
api_url = "http://stub.example.com"

[stub.instances.a]
default = true

[stub.instances.b]
api_url = "http://b.stub.example.com"
"#,
    );
    let mut broker = fx.broker();
    let on_a = broker.checkout(&stub_request()).await.unwrap().remove(0);
    let on_b = broker
        .checkout(&stub_request().with_arg("Stub", "b"))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(on_b.provider().unwrap().instance.as_deref(), Some("b"));

    // instance a reports nothing left
    let report = broker.sync_inventory("Stub::a").await.unwrap();
    assert_eq!(report.removed, vec![on_a.hostname().unwrap()]);

    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].hostname(), on_b.hostname());
    assert_eq!(inventory[0].provider_instance(), Some("b"));
}

#[tokio::test]
async fn test_unrebuildable_worker_result_is_an_error() {
    let fx = Fixture::new();
    let mut broker = fx.broker().with_pool(Arc::new(OrphaningPool));

    let err = broker
        .checkout(&stub_request().with_count(3))
        .await
        .unwrap_err();
    let BrokerError::Batch { total, errors } = &err else {
        panic!("expected batch error, got {err}");
    };
    assert_eq!(*total, 3);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("unknown provider Ghost"));

    // the orphan is still recorded so it is not lost
    assert_eq!(broker.hosts().len(), 2);
    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 3);
    assert_eq!(inventory.iter().filter(|e| e.provider() == Some("Ghost")).count(), 1);
}

#[tokio::test]
async fn test_checkout_many_rolls_back_unrebuildable_result() {
    let fx = Fixture::new();
    let mut broker = fx.broker().with_pool(Arc::new(OrphaningPool));

    let mut requests = BTreeMap::new();
    requests.insert("web".to_string(), stub_request().with_count(3));
    let err = broker.checkout_many(requests).await.unwrap_err();
    assert!(matches!(err, BrokerError::Batch { .. }));

    assert!(broker.hosts().is_empty());
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 2);
    let inventory = fx.inventory().await;
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].provider(), Some("Ghost"));
}

#[tokio::test]
async fn test_sync_without_inventory_support() {
    let fx = Fixture::new();
    let err = fx.broker().sync_inventory("Other").await.unwrap_err();
    assert_eq!(err.exit_code(), 9);
}

#[tokio::test]
async fn test_from_inventory_skips_unknown_providers() {
    let fx = Fixture::new();
    let path = fx.core.inventory().path().to_path_buf();
    std::fs::write(
        &path,
        r"
- hostname: ghost.example.com
  _broker_provider: Ghost
- hostname: stub-9.example.com
  name: stub-9
  _broker_provider: Stub
  _broker_args:
    stub_host: large
  type: host
",
    )
    .unwrap();

    let mut broker = fx.broker();
    let hosts = broker.from_inventory(None).await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].name(), Some("stub-9"));

    let filter: Filter = "@inv._broker_args.stub_host == 'none'".parse().unwrap();
    assert!(fx.broker().from_inventory(Some(&filter)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scoped_checks_in_when_body_fails() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let result: Result<(), BrokerError> = broker
        .scoped(&stub_request().with_count(2), |hosts| async move {
            assert_eq!(hosts.len(), 2);
            Err(BrokerError::User("test body failed".into()))
        })
        .await;

    assert!(matches!(result, Err(BrokerError::User(_))));
    assert!(broker.hosts().is_empty());
    assert!(fx.inventory().await.is_empty());
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_scoped_runs_host_class_hooks() {
    let fx = Fixture::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let setup_seen = seen.clone();
    let teardown_seen = seen.clone();
    let classes = HostClasses::new().with_class(
        "host",
        HostClass::new()
            .with_setup(host_hook(move |host| {
                setup_seen
                    .lock()
                    .unwrap()
                    .push(format!("setup {}", host.identifier()));
                async { Ok(()) }.boxed()
            }))
            .with_teardown(host_hook(move |host| {
                teardown_seen
                    .lock()
                    .unwrap()
                    .push(format!("teardown {}", host.identifier()));
                async { Ok(()) }.boxed()
            })),
    );
    let core = Arc::new(
        BrokerCore::new(fx.core.settings().clone(), common::registry(fx.calls.clone()))
            .with_host_classes(classes),
    );
    let mut broker = Broker::new(core);

    let value = broker
        .scoped(&stub_request(), |_hosts| async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].starts_with("setup stub-"));
    assert!(seen[1].starts_with("teardown stub-"));
}

#[tokio::test]
async fn test_checkout_many_rolls_back_on_failure() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let mut requests = BTreeMap::new();
    requests.insert("good".to_string(), stub_request().with_count(2));
    requests.insert(
        "bad".to_string(),
        CheckoutRequest::new().with_arg("stub_host", "x").with_nick("missing"),
    );

    let err = broker.checkout_many(requests).await.unwrap_err();
    assert!(matches!(err, BrokerError::Batch { .. }));
    assert!(broker.hosts().is_empty());
    assert!(fx.inventory().await.is_empty());
    assert_eq!(fx.calls.releases.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_checkout_many_groups_hosts() {
    let fx = Fixture::new();
    let mut broker = fx.broker();

    let mut requests = BTreeMap::new();
    requests.insert("web".to_string(), stub_request().with_count(2));
    requests.insert("db".to_string(), stub_request());

    let groups = broker.checkout_many(requests).await.unwrap();
    assert_eq!(groups["web"].len(), 2);
    assert_eq!(groups["db"].len(), 1);
    assert_eq!(broker.hosts().len(), 3);

    broker.checkin(HostSelection::Groups(groups)).await.unwrap();
    assert!(fx.inventory().await.is_empty());
}

#[tokio::test]
async fn test_run_parallel_keeps_host_order() {
    let fx = Fixture::new();
    let broker = fx.broker();
    let hosts: Vec<Arc<Host>> = ["a.example.com", "b.example.com", "c.example.com"]
        .into_iter()
        .map(|h| {
            Arc::new(
                Host::builder(h)
                    .with_session_factory(Arc::new(LocalFactory))
                    .build(),
            )
        })
        .collect();

    let results = broker.run_parallel(&hosts, "echo hi", None).await;
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["a.example.com", "b.example.com", "c.example.com"]);
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap().stdout, "hi\n");
    }
}

#[tokio::test]
async fn test_remove_twice_is_noop() {
    let fx = Fixture::new();
    let store = fx.core.inventory();
    let entry: InventoryEntry =
        serde_json::from_value(json!({"hostname": "host.example.com", "_broker_provider": "Stub"}))
            .unwrap();
    store.add(vec![entry]).await.unwrap();

    store.remove(&["host.example.com".to_string()]).await.unwrap();
    store.remove(&["host.example.com".to_string()]).await.unwrap();
    assert!(fx.inventory().await.is_empty());
}
