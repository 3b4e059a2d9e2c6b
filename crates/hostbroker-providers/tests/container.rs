mod common;

use std::sync::Arc;

use common::{CannedSession, result, runner, settings, ssh};
use hostbroker_core::{ActionRequest, BrokerError, HostContext, Provider};
use hostbroker_providers::container::{self, Container};
use serde_json::{Map, Value, json};

fn inspect(name: &str, ports: Value) -> String {
    json!([{
        "Id": "f00dcafe1234",
        "Name": format!("/{name}"),
        "Config": {
            "Hostname": "f00dcafe1234",
            "Image": "localhost/ubi9-ssh:latest",
            "Labels": {"broker.origin": "user:tester"}
        },
        "State": {"Status": "running"},
        "NetworkSettings": {"Ports": ports}
    }])
    .to_string()
}

fn provider(session: CannedSession, extra: Value) -> (Arc<CannedSession>, Arc<dyn Provider>) {
    let (session, runner) = runner(session);
    let mut values = json!({"name_prefix": "tester"});
    if let (Some(values), Some(extra)) = (values.as_object_mut(), extra.as_object()) {
        values.extend(extra.clone());
    }
    let settings = settings(&container::descriptor(), values);
    let provider = Container::new(&settings).unwrap().with_runner(runner);
    (session, Arc::new(provider))
}

fn request(action: &str, args: Value) -> ActionRequest {
    let args: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
    ActionRequest::new(action, args)
}

#[tokio::test]
async fn test_run_container_with_ssh_port() {
    let ports = json!({"22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "2222"}]});
    let session = CannedSession::new()
        .on("image inspect", "[{}]")
        .on("run -d", "f00dcafe1234\n")
        .on("inspect", &inspect("tester_box", ports));
    let (session, provider) = provider(session, json!({}));

    let params = provider
        .invoke(
            "run_container",
            &request(
                "container_host",
                json!({
                    "container_host": "localhost/ubi9-ssh:latest",
                    "name": "tester_box",
                    "ports": "22:2222",
                    "environment": "MODE=test",
                    "provider_labels": {"team": "qe"}
                }),
            ),
        )
        .await
        .unwrap();
    assert!(session.ran(&["run", "--publish-all", "2222:22/tcp", "MODE=test"]));
    assert!(session.ran(&["run", "broker.team=qe", "broker.origin="]));
    assert!(!session.ran(&["pull"]));

    let ctx = HostContext::new(provider.clone(), ssh());
    let host = provider.construct_host(Some(params), ctx).await.unwrap();
    assert_eq!(host.hostname(), Some("localhost"));
    assert_eq!(host.port(), 2222);
    assert_eq!(host.name(), Some("tester_box"));
    assert_eq!(host.extra("container_id"), Some(&json!("f00dcafe1234")));
    assert_eq!(host.extra("exposed_ports"), Some(&json!({"22": "2222"})));
}

#[tokio::test]
async fn test_run_container_pulls_missing_image() {
    let session = CannedSession::new()
        .on_result("image inspect", result(125, "", "image not known"))
        .on("pull", "done")
        .on("run -d", "f00dcafe1234\n")
        .on("inspect", &inspect("tester_box", json!({})));
    let (session, provider) = provider(session, json!({"auto_map_ports": false}));

    let params = provider
        .invoke(
            "run_container",
            &request("container_host", json!({"container_host": "ubi9", "name": "tester_box"})),
        )
        .await
        .unwrap();
    assert!(session.ran(&["pull", "ubi9"]));
    assert!(!session.ran(&["--publish-all"]));

    let ctx = HostContext::new(provider.clone(), ssh());
    let host = provider.construct_host(Some(params), ctx).await.unwrap();
    assert_eq!(host.hostname(), Some("f00dcafe1234"));
    assert!(host.extra("exposed_ports").is_none());
}

#[tokio::test]
async fn test_unknown_image_is_provider_error() {
    let session = CannedSession::new()
        .on_result("image inspect", result(125, "", "image not known"))
        .on_result("pull", result(125, "", "manifest unknown"));
    let (_, provider) = provider(session, json!({}));

    let err = provider
        .invoke("run_container", &request("container_host", json!({"container_host": "nope"})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Provider { .. }));
    assert!(err.to_string().contains("Unable to find image: nope"));
}

#[tokio::test]
async fn test_execute_returns_output() {
    let session = CannedSession::new().on("run --rm", "hello world\n");
    let (session, provider) = provider(session, json!({}));

    let output = provider
        .invoke(
            "execute",
            &request(
                "container_app",
                json!({"container_app": "alpine", "command": "echo 'hello world'"}),
            ),
        )
        .await
        .unwrap();
    assert_eq!(output, json!("hello world\n"));
    assert!(session.ran(&["run", "--rm", "alpine", "echo", "hello world"]));
}

#[tokio::test]
async fn test_remote_engine_url() {
    let session = CannedSession::new().on("rm -f", "tester_box");
    let (session, provider) = provider(
        session,
        json!({"host": "engine.example.com", "host_username": "ops", "host_port": 2200}),
    );
    let ctx = HostContext::new(provider.clone(), ssh());
    let host = ctx.host_builder("engine.example.com").with_name("tester_box").build();

    provider.release(&host).await.unwrap();
    assert!(session.ran(&[
        "podman --url",
        "ssh://ops@engine.example.com:2200/run/podman/podman.sock",
        "tester_box"
    ]));
}

#[tokio::test]
async fn test_inventory_filters_by_prefix() {
    let session = CannedSession::new()
        .on("ps -a", "tester_one\nsomeone_else\n")
        .on("inspect", &inspect("tester_one", json!({})));
    let (session, provider) = provider(session, json!({}));

    let entries = provider.get_inventory(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), Some("tester_one"));
    assert_eq!(
        entries[0].get_path("_broker_args.container_host"),
        Some(&json!("localhost/ubi9-ssh:latest"))
    );
    assert!(!session.ran(&["inspect", "someone_else"]));
}

#[tokio::test]
async fn test_reconstructed_host_without_ssh_uses_container_session() {
    let (_, provider) = provider(CannedSession::new(), json!({}));
    let record = hostbroker_inventory::InventoryEntry::from(
        json!({"hostname": "f00dcafe1234", "name": "tester_box", "_broker_provider": "Container"})
            .as_object()
            .cloned()
            .unwrap(),
    );
    let ctx = HostContext::new(provider.clone(), ssh()).with_record(record);

    let host = provider.construct_host(None, ctx).await.unwrap();
    assert_eq!(host.name(), Some("tester_box"));
    assert_eq!(host.hostname(), Some("f00dcafe1234"));
}
