//! Integration tests for observer-backed run authorization.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use runbridge::agent::{AgentEvent, RunAgent, RunOutcome};
use runbridge::client::{RunClient, RunListener};
use runbridge::config::Config;
use runbridge::protocol::{AuthorizationGrant, ObserverMessage};
use runbridge::server::RunServer;
use runbridge::ws::{self, WsMessage};

/// Scripted observer service: grants or rejects every authorization and
/// records the frames mirrored to it afterwards.
async fn start_observer(
    grant: Option<AuthorizationGrant>,
    mirrored: Arc<Mutex<Vec<String>>>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let grant = grant.clone();
            let mirrored = Arc::clone(&mirrored);
            tokio::spawn(async move {
                let (mut writer, mut reader) = ws::accept(tcp).await.unwrap();
                let Some(Ok(WsMessage::Text(_init))) = reader.recv().await else {
                    return;
                };
                let reply = match grant {
                    Some(grant) => ObserverMessage::AcceptAuthorize(grant),
                    None => ObserverMessage::Error {
                        message: "invalid key".to_string(),
                    },
                };
                writer
                    .send_text(&serde_json::to_string(&reply).unwrap())
                    .await
                    .unwrap();
                while let Some(Ok(WsMessage::Text(text))) = reader.recv().await {
                    mirrored.lock().unwrap().push(text);
                }
            });
        }
    });
    format!("ws://{addr}")
}

struct PassingAgent;

#[async_trait]
impl RunAgent for PassingAgent {
    async fn run(
        &self,
        _run_id: &str,
        _test_case: Value,
        _start_url: Option<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        events.send(AgentEvent::Start {
            run_metadata: json!({"browser": "chromium"}),
        })?;
        events.send(AgentEvent::Done {
            result: RunOutcome::new(true),
        })?;
        Ok(())
    }
}

async fn start_server(observer_url: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        port: addr.port(),
        observer_url: Some(observer_url),
        sockets_per_run: 2,
    };
    let server = RunServer::new(config, Arc::new(PassingAgent));
    tokio::spawn(async move {
        server.serve_on(listener).await.ok();
    });
    format!("ws://{addr}")
}

#[derive(Default)]
struct MetadataCapture {
    metadata: Mutex<Option<Value>>,
}

impl RunListener for MetadataCapture {
    fn on_start(&self, run_metadata: &Value) {
        *self.metadata.lock().unwrap() = Some(run_metadata.clone());
    }
}

#[tokio::test]
async fn test_grant_metadata_reaches_the_caller() {
    let mirrored = Arc::new(Mutex::new(Vec::new()));
    let observer_url = start_observer(
        Some(AuthorizationGrant {
            org_name: "Acme".to_string(),
            dashboard_url: Some("https://observer/runs/42".to_string()),
        }),
        Arc::clone(&mirrored),
    )
    .await;
    let server_url = start_server(observer_url).await;

    let capture = Arc::new(MetadataCapture::default());
    let mut client = RunClient::new(server_url).with_api_key("good-key");
    client.add_listener(Arc::clone(&capture) as Arc<dyn RunListener>);

    let outcome = client.run(json!({}), Some("tc-42".to_string())).await.unwrap();
    assert!(outcome.passed);

    let metadata = capture.metadata.lock().unwrap().clone().unwrap();
    assert_eq!(metadata["orgName"], "Acme");
    assert_eq!(metadata["dashboardUrl"], "https://observer/runs/42");
    assert_eq!(metadata["browser"], "chromium");
}

#[tokio::test]
async fn test_rejection_message_surfaces_to_the_caller() {
    let mirrored = Arc::new(Mutex::new(Vec::new()));
    let observer_url = start_observer(None, mirrored).await;
    let server_url = start_server(observer_url).await;

    let client = RunClient::new(server_url).with_api_key("bad-key");
    let err = client.run(json!({}), None).await.unwrap_err();
    assert!(err.to_string().contains("invalid key"));
}

#[tokio::test]
async fn test_events_are_mirrored_to_the_observer() {
    let mirrored = Arc::new(Mutex::new(Vec::new()));
    let observer_url = start_observer(
        Some(AuthorizationGrant {
            org_name: "Acme".to_string(),
            dashboard_url: None,
        }),
        Arc::clone(&mirrored),
    )
    .await;
    let server_url = start_server(observer_url).await;

    let client = RunClient::new(server_url).with_api_key("good-key");
    client.run(json!({}), None).await.unwrap();

    // Mirroring is fire-and-forget; give the frames a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mirrored = mirrored.lock().unwrap();
    let kinds: Vec<Value> = mirrored
        .iter()
        .map(|text| serde_json::from_str::<Value>(text).unwrap()["kind"].clone())
        .collect();
    assert_eq!(kinds, vec![json!("event:start"), json!("event:done")]);
}
