mod common;

use std::sync::Arc;

use common::{settings, ssh};
use hostbroker_core::{ActionRequest, BrokerError, HostContext, Provider, Settings};
use hostbroker_providers::default_registry;
use hostbroker_providers::foreman::{self, Foreman};
use serde_json::{Map, Value, json};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOST: &str = "broker-1a2b3c4d.lab.example.com";

fn provider(server: &MockServer) -> Arc<dyn Provider> {
    let settings = settings(
        &foreman::descriptor(),
        json!({
            "foreman_url": server.uri(),
            "foreman_username": "admin",
            "foreman_password": "changeme",
            "organization": "ACME",
            "location": "Lab",
            "poll_interval": 0
        }),
    );
    Arc::new(Foreman::new(&settings).unwrap())
}

async fn get_json(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_scope(server: &MockServer) {
    get_json(
        server,
        "/api/organizations",
        json!({"results": [{"id": 1, "name": "ACME", "title": "ACME"}]}),
    )
    .await;
    get_json(
        server,
        "/api/locations",
        json!({"results": [{"id": 2, "name": "Lab", "title": "Lab"}]}),
    )
    .await;
}

fn hostgroup_request() -> ActionRequest {
    let mut args = Map::new();
    args.insert("hostgroup".into(), json!("rhel9/base"));
    args.insert("comment".into(), json!("ci run"));
    ActionRequest::new("hostgroup", args)
}

#[tokio::test]
async fn test_create_host_waits_for_build_and_sets_hostname() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    get_json(
        &server,
        "/api/hostgroups",
        json!({"results": [{"id": 5, "name": "base", "title": "rhel9/base"}]}),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/api/hosts"))
        .and(body_partial_json(json!({
            "organization_id": 1,
            "location_id": 2,
            "host": {"hostgroup_id": 5, "build": true, "comment": "ci run"}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 42,
            "name": HOST,
            "ip": "10.0.0.5",
            "hostgroup_title": "rhel9/base"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/hosts/{HOST}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"build_status": 1})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    get_json(&server, &format!("/api/hosts/{HOST}"), json!({"build_status": 0})).await;
    get_json(
        &server,
        "/api/job_templates",
        json!({"results": [{"id": 9, "name": "Run Command - Script Default"}]}),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/api/job_invocations"))
        .and(body_partial_json(json!({
            "job_invocation": {
                "job_template_id": 9,
                "inputs": {"command": format!("hostname {HOST}")}
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
        .expect(1)
        .mount(&server)
        .await;
    get_json(&server, "/api/job_invocations/77", json!({"status_label": "succeeded"})).await;
    get_json(
        &server,
        "/api/job_invocations/77/outputs",
        json!({"outputs": [{"output": [
            {"output_type": "stdout", "output": ""},
            {"output_type": "stdout", "output": "Exit status: 0"}
        ]}]}),
    )
    .await;

    let provider = provider(&server);
    let params = provider
        .invoke("create_host", &hostgroup_request())
        .await
        .unwrap();

    let ctx = HostContext::new(provider.clone(), ssh());
    let host = provider.construct_host(Some(params), ctx).await.unwrap();
    assert_eq!(host.hostname(), Some(HOST));
    assert_eq!(host.name(), Some(HOST));
    assert_eq!(host.extra("ip"), Some(&json!("10.0.0.5")));
    assert_eq!(host.extra("hostgroup"), Some(&json!("rhel9/base")));
}

#[tokio::test]
async fn test_unknown_hostgroup() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    get_json(&server, "/api/hostgroups", json!({"results": []})).await;

    let err = provider(&server)
        .invoke("create_host", &hostgroup_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Could not find rhel9/base in hostgroups"));
}

#[tokio::test]
async fn test_creation_error_surfaces_messages() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    get_json(
        &server,
        "/api/hostgroups",
        json!({"results": [{"id": 5, "name": "base", "title": "rhel9/base"}]}),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/api/hosts"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": {"full_messages": ["Name has already been taken"]}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .invoke("create_host", &hostgroup_request())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Provider { .. }));
    assert!(err.to_string().contains("Name has already been taken"));
}

#[tokio::test]
async fn test_bad_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/organizations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Unable to authenticate user admin"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .invoke("create_host", &hostgroup_request())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 5);
}

#[test]
fn test_unreadable_build_timeout_rejected_at_instantiate() {
    let settings = Settings::from_toml_str(
        r#"
[foreman]
foreman_url = "https://foreman.example.com"
foreman_username = "admin"
foreman_password = "changeme"
organization = "ACME"
location = "Lab"
build_timeout = "90min"
"#,
    )
    .unwrap();

    let err = default_registry()
        .unwrap()
        .instantiate("Foreman", None, &settings)
        .unwrap_err();
    assert!(matches!(err, BrokerError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("build_timeout must be of type duration"));
    assert!(!err.to_string().contains("changeme"));
}

#[tokio::test]
async fn test_release_deletes_host() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    Mock::given(method("DELETE"))
        .and(path(format!("/api/hosts/{HOST}")))
        .and(body_partial_json(json!({"organization_id": 1, "location_id": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": HOST})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server);
    let ctx = HostContext::new(provider.clone(), ssh());
    let host = ctx.host_builder(HOST).with_name(HOST).build();
    let released = provider.release(&host).await.unwrap();
    assert_eq!(released["id"], json!(42));
}

#[tokio::test]
async fn test_inventory_searches_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/hosts"))
        .and(query_param("search", "broker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [
            {"certname": HOST, "hostgroup_title": "rhel9/base", "ip": "10.0.0.5"}
        ]})))
        .mount(&server)
        .await;

    let entries = provider(&server).get_inventory(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].hostname(), Some(HOST));
    assert_eq!(entries[0].get("hostgroup"), Some(&json!("rhel9/base")));
}

#[tokio::test]
async fn test_nick_help_lists_hostgroups() {
    let server = MockServer::start().await;
    get_json(
        &server,
        "/api/hostgroups",
        json!({"results": [{"id": 5, "title": "rhel9/base"}, {"id": 6, "title": "rhel8/base"}]}),
    )
    .await;

    let mut args = Map::new();
    args.insert("hostgroups".into(), Value::Bool(true));
    let help = provider(&server).nick_help(&args).await.unwrap();
    assert_eq!(help["hostgroups"], json!(["rhel9/base", "rhel8/base"]));
}
