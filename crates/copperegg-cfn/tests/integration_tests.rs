// Integration tests: full job flow from a raw message through the handlers
// built from configuration, against a mock CopperEgg API and stack callback.

use std::sync::Arc;

use copperegg_cfn::app::{self, Dispatcher};
use copperegg_cfn::config::{Config, CredentialsConfig};
use copperegg_cfn::handlers::{self, probe};
use copperegg_cfn::protocol::JobStatus;
use copperegg_cfn::ws_server::{self, WsEvent};

use futures_util::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ===========================================================================
// Test helpers
// ===========================================================================

const STACK_ID: &str = "arn:aws:cloudformation:us-east-1:123456789012:stack/web/1";

/// Config with both CopperEgg products pointed at the mock server.
fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.copperegg.revealcloud_url = server.uri();
    config.copperegg.revealuptime_url = server.uri();
    config.copperegg.request_timeout_secs = 5;
    config.credentials = CredentialsConfig {
        revealcloud_username: Some("cloud".into()),
        revealcloud_password: Some("U".into()),
        revealuptime_username: Some("uptime".into()),
        revealuptime_password: Some("U".into()),
    };
    config
}

fn dispatcher_for(server: &MockServer) -> Dispatcher {
    Dispatcher::new(handlers::from_config(&config_for(server)).unwrap())
}

fn probe_job(server: &MockServer, request_type: &str, physical_id: Option<&str>) -> String {
    let mut resource = json!({
        "RequestType": request_type,
        "ResponseURL": format!("{}/cfn-callback", server.uri()),
        "StackId": STACK_ID,
        "RequestId": "2f7c0b1e",
        "ResourceType": "Custom::CoppereggProbe",
        "LogicalResourceId": "SiteProbes",
        "ResourceProperties": {
            "Parameters": {
                "Probes": [{
                    "ProbeDesc": "homepage",
                    "Type": "GET",
                    "ProbeDest": "https://example.com",
                    "Frequency": 60,
                    "Stations": ["LON", "DAL"]
                }]
            }
        }
    });
    if let Some(id) = physical_id {
        resource["PhysicalResourceId"] = json!(id);
    }
    json!({ "id": "job-probe", "data": { "cfn_resource": resource } }).to_string()
}

fn stack_deleted_job() -> String {
    json!({
        "id": "job-cleanup",
        "data": { "cfn_event": {
            "stack_id": STACK_ID,
            "stack_name": "web",
            "resource_type": "AWS::CloudFormation::Stack",
            "resource_status": "DELETE_COMPLETE"
        }}
    })
    .to_string()
}

async fn expect_callback(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("PUT"))
        .and(path("/cfn-callback"))
        .and(body_partial_json(body))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

// ===========================================================================
// Probe resource lifecycle
// ===========================================================================

#[tokio::test]
async fn probe_create_then_delete_round_trip() {
    let server = MockServer::start().await;

    // base64("uptime:U")
    Mock::given(method("POST"))
        .and(path("/v2/revealuptime/probes.json"))
        .and(header("authorization", "Basic dXB0aW1lOlU="))
        .and(body_partial_json(json!({
            "probe_desc": "homepage",
            "probe_dest": "https://example.com",
            "stations": ["LON", "DAL"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "pr-42" })))
        .expect(1)
        .mount(&server)
        .await;

    let token = probe::encode_probe_ids(&[json!("pr-42")]);
    expect_callback(
        &server,
        json!({
            "Status": "SUCCESS",
            "StackId": STACK_ID,
            "RequestId": "2f7c0b1e",
            "LogicalResourceId": "SiteProbes",
            "PhysicalResourceId": token,
            "Data": { "Reason": "New copperegg probes added: 1" }
        }),
    )
    .await;

    let dispatcher = dispatcher_for(&server);
    let outcomes = dispatcher.dispatch(&probe_job(&server, "Create", None)).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].handler, "copperegg_probe");
    assert_eq!(outcomes[0].status, JobStatus::Completed);

    // The stack later deletes the resource with the token we handed back.
    server.verify().await;
    server.reset().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/revealuptime/probes/pr-42.json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    expect_callback(
        &server,
        json!({
            "Status": "SUCCESS",
            "PhysicalResourceId": token,
            "Data": { "Reason": "Probes removed (1)" }
        }),
    )
    .await;

    let outcomes = dispatcher
        .dispatch(&probe_job(&server, "Delete", Some(&token)))
        .await;
    assert_eq!(outcomes[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn probe_update_is_reported_as_failed_to_stack() {
    let server = MockServer::start().await;
    expect_callback(
        &server,
        json!({
            "Status": "FAILED",
            "Reason": "Updates are not supported on this resource",
            "PhysicalResourceId": "existing"
        }),
    )
    .await;

    let outcomes = dispatcher_for(&server)
        .dispatch(&probe_job(&server, "Update", Some("existing")))
        .await;

    // The stack was told about the failure; the job itself completed.
    assert_eq!(outcomes[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn unreachable_callback_fails_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
        .mount(&server)
        .await;

    let outcomes = dispatcher_for(&server)
        .dispatch(&probe_job(&server, "Delete", Some("garbage")))
        .await;

    match &outcomes[0].status {
        JobStatus::Failed { reason } => {
            assert!(reason.contains("failed to respond to stack"), "{reason}");
            assert!(reason.contains("403"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

// ===========================================================================
// Stack server cleanup
// ===========================================================================

#[tokio::test]
async fn stack_deletion_removes_tagged_servers() {
    let server = MockServer::start().await;

    // base64("cloud:U")
    Mock::given(method("GET"))
        .and(path("/v2/revealcloud/systems.json"))
        .and(query_param("show_hidden", "1"))
        .and(header("authorization", "Basic Y2xvdWQ6VQ=="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "uuid": "srv-1", "t": [STACK_ID] },
            { "uuid": "srv-2", "t": ["unrelated"] }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/revealcloud/uuids/srv-1.json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let outcomes = dispatcher_for(&server).dispatch(&stack_deleted_job()).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].handler, "copperegg_stack_server_cleanup");
    assert_eq!(outcomes[0].job_id.as_deref(), Some("job-cleanup"));
    assert_eq!(outcomes[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn other_stack_events_are_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let job = json!({
        "data": { "cfn_event": {
            "stack_id": STACK_ID,
            "resource_type": "AWS::CloudFormation::Stack",
            "resource_status": "UPDATE_COMPLETE"
        }}
    })
    .to_string();

    assert!(dispatcher_for(&server).dispatch(&job).await.is_empty());
}

// ===========================================================================
// WebSocket ingress to outcomes
// ===========================================================================

#[tokio::test]
async fn jobs_over_websocket_produce_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/revealcloud/systems.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let listener = ws_server::bind(0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ws_tx, ws_rx) = mpsc::channel::<WsEvent>(16);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(16);

    let ws_handle = tokio::spawn(ws_server::run(listener, ws_tx));
    tokio::spawn(app::run(ws_rx, outcome_tx, Arc::new(dispatcher_for(&server))));

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    // A garbled frame is dropped without closing the connection.
    client.send(Message::text("{not json")).await.unwrap();
    client.send(Message::text(stack_deleted_job())).await.unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), outcome_rx.recv())
        .await
        .expect("outcome within timeout")
        .expect("outcome channel open");
    assert_eq!(outcome.job_id.as_deref(), Some("job-cleanup"));
    assert!(outcome.is_completed());

    client.close(None).await.unwrap();
    ws_handle.abort();
}
