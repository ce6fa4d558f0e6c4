//! HTTP facade tests.
//!
//! The facade runs on an ephemeral port over the in-process host, with a
//! stub data source and model so no network or model server is needed.

use anyhow::{bail, Result};
use async_trait::async_trait;
use repo_digest::config::DispatcherConfig;
use repo_digest::dispatcher::Dispatcher;
use repo_digest::error::CallError;
use repo_digest::github::DataSource;
use repo_digest::local::InProcessHost;
use repo_digest::model::{GenerationOptions, ModelService};
use repo_digest::models::{RepoId, RepoMetadata};
use repo_digest::protocol::{RpcRequest, RpcResponse};
use repo_digest::server;
use repo_digest::store::SummaryStore;
use repo_digest::summarizer::{Summarizer, NO_PULL_REQUESTS};
use repo_digest::system::{RpcBackend, SystemApi};
use repo_digest::traits::{ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

// ─── Stubs ──────────────────────────────────────────────────────────

struct StubSource;

#[async_trait]
impl DataSource for StubSource {
    async fn readme(&self, repo: &RepoId) -> Result<String> {
        if repo.owner == "broken" {
            bail!("GitHub API error 500 Internal Server Error: boom");
        }
        Ok("# Flask\nA micro web framework.".to_string())
    }
    async fn commits(&self, _repo: &RepoId) -> Result<Vec<String>> {
        Ok(vec!["Fix routing bug".to_string()])
    }
    async fn issues(&self, _repo: &RepoId) -> Result<Vec<String>> {
        Ok(vec!["Crash on start - Steps".to_string()])
    }
    async fn pull_requests(&self, _repo: &RepoId) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn metadata(&self, repo: &RepoId) -> Result<RepoMetadata> {
        Ok(RepoMetadata {
            full_name: repo.to_string(),
            stars: 7,
            ..RepoMetadata::default()
        })
    }
}

struct StubModel;

#[async_trait]
impl ModelService for StubModel {
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
        Ok("stub summary".to_string())
    }
}

/// Starts fine, then never answers in time.
#[derive(Default)]
struct StalledBackend {
    running: AtomicBool,
}

#[async_trait]
impl RpcBackend for StalledBackend {
    async fn start(&self) -> Result<(), CallError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, CallError> {
        Err(CallError::Timeout {
            id: request.id,
            after: Duration::from_secs(300),
        })
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    api: Arc<SystemApi>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = SummaryStore::new(tmp.path());
        let summarizer = Summarizer::new(
            Arc::new(StubSource),
            Arc::new(StubModel),
            store.clone(),
            GenerationOptions::default(),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(ToolRegistry::with_builtins()),
            ToolContext::new(Arc::new(summarizer)),
            DispatcherConfig::default(),
        );
        let host = InProcessHost::new(Arc::new(dispatcher), Duration::from_secs(5));
        Self::with_backend(Arc::new(host), tmp).await
    }

    async fn with_backend(backend: Arc<dyn RpcBackend>, tmp: TempDir) -> Self {
        let api = Arc::new(SystemApi::new(backend, SummaryStore::new(tmp.path())));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();
        let served = api.clone();
        let handle = tokio::spawn(async move {
            server::serve(served, listener, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            base,
            api,
            shutdown: Some(tx),
            handle,
            _tmp: tmp,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap();
        self.api.stop_system().await;
    }
}

async fn summarize(client: &reqwest::Client, server: &TestServer, mode: &str, body: Value) -> (u16, Value) {
    let resp = client
        .post(server.url(&format!("/summarize/{}", mode)))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_reflects_system_state() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert!(body["detail"].is_string());

    server.api.start_system().await.unwrap();
    let resp = client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "status": "ok" }));

    server.stop().await;
}

#[tokio::test]
async fn test_summarize_and_read_back() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let flask = json!({ "owner": "pallets", "repo": "flask" });

    // The first call starts the system on demand.
    let (status, body) = summarize(&client, &server, "readme", flask.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"]["result"], "stub summary");
    assert!(body["data"]["id"].is_number());

    let (status, body) = summarize(&client, &server, "pulls", flask).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["result"], NO_PULL_REQUESTS);

    let list: Value = client
        .get(server.url("/summaries"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        list,
        json!([
            { "owner": "pallets", "repo": "flask", "mode": "readme" },
            { "owner": "pallets", "repo": "flask", "mode": "pull_requests" },
        ])
    );

    let resp = client
        .get(server.url("/summary/pallets/flask/readme"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let doc: Value = resp.json().await.unwrap();
    assert_eq!(doc["summary"], "stub summary");
    assert_eq!(doc["metadata"]["stars"], 7);
    assert_eq!(doc["metadata"]["model"], "stub");

    let resp = client
        .get(server.url("/summary/pallets/flask/issues"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_handler_failure_is_reported_in_data() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let (status, body) = summarize(
        &client,
        &server,
        "readme",
        json!({ "owner": "broken", "repo": "repo" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["error"]["code"], -32000);
    assert!(body["data"]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("boom"));
    assert!(body["data"].get("result").is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_call_error_is_internal_server_error() {
    let backend = Arc::new(StalledBackend::default());
    let server = TestServer::with_backend(backend, TempDir::new().unwrap()).await;
    let client = reqwest::Client::new();

    let (status, body) = summarize(
        &client,
        &server,
        "commits",
        json!({ "owner": "pallets", "repo": "flask" }),
    )
    .await;
    assert_eq!(status, 500);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("timed out"), "got: {}", detail);
    assert!(body.get("data").is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_bad_requests() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let (status, body) = summarize(
        &client,
        &server,
        "stars",
        json!({ "owner": "pallets", "repo": "flask" }),
    )
    .await;
    assert_eq!(status, 404);
    assert!(body["detail"].as_str().unwrap().contains("stars"));

    let (status, _) = summarize(&client, &server, "readme", json!({ "owner": "", "repo": "flask" })).await;
    assert_eq!(status, 400);

    let resp = client
        .get(server.url("/summary/pallets/flask/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/summaries"))
        .header("Origin", "http://dashboard.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "*"
    );

    server.stop().await;
}
