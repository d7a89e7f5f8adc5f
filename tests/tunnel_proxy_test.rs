//! End-to-end tunnel test: hosted-browser traffic reaches the caller's
//! local origin through the proxy path and the tunnel socket pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use runbridge::agent::{AgentEvent, RunAgent, RunOutcome};
use runbridge::client::RunClient;
use runbridge::config::Config;
use runbridge::server::RunServer;

/// Plays the hosted browser: issues one raw HTTP request against the
/// server's proxy port with a `<runId>.localhost` Host header and passes
/// the run when the tunneled response comes back intact.
struct ProxyProbeAgent {
    proxy_port: u16,
}

#[async_trait]
impl RunAgent for ProxyProbeAgent {
    async fn run(
        &self,
        run_id: &str,
        _test_case: Value,
        start_url: Option<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        events.send(AgentEvent::Start {
            run_metadata: json!({}),
        })?;

        let start_url = start_url.context("tunneled run must get a start URL")?;
        assert_eq!(start_url, format!("http://{run_id}.localhost:{}", self.proxy_port));

        let body = probe(self.proxy_port, run_id).await?;
        events.send(AgentEvent::Done {
            result: RunOutcome::new(body.contains("hello from local origin")),
        })?;
        Ok(())
    }
}

/// One raw HTTP request through the proxy path.
async fn probe(port: u16, run_id: &str) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request =
        format!("GET /greeting HTTP/1.1\r\nHost: {run_id}.localhost:{port}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

#[tokio::test]
async fn test_browser_traffic_round_trips_through_tunnel() {
    // The caller-local app under test.
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/greeting"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/plain")
                .set_body_string("hello from local origin"),
        )
        .mount(&origin)
        .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = Config {
        port,
        observer_url: None,
        sockets_per_run: 2,
    };
    let server = RunServer::new(config, Arc::new(ProxyProbeAgent { proxy_port: port }));
    tokio::spawn(async move {
        server.serve_on(listener).await.ok();
    });

    let client = RunClient::new(format!("ws://127.0.0.1:{port}"))
        .with_local_origin(origin.uri());
    let outcome = client
        .run(json!({"url": "http://localhost:3000"}), None)
        .await
        .unwrap();

    assert!(outcome.passed, "tunneled response should reach the agent");
}

#[tokio::test]
async fn test_proxy_request_for_unknown_run_is_404() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = RunServer::new(
        Config {
            port,
            observer_url: None,
            sockets_per_run: 2,
        },
        Arc::new(ProxyProbeAgent { proxy_port: port }),
    );
    tokio::spawn(async move {
        server.serve_on(listener).await.ok();
    });

    let response = probe(port, "nosuchrun000").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));
}
