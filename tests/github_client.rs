//! GitHub client, model provider, and summarizer against local mock servers.
//!
//! A small axum app stands in for both the GitHub REST API and an
//! Ollama-compatible `/api/generate` endpoint.

use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use repo_digest::config::{GithubConfig, ModelConfig};
use repo_digest::github::{DataSource, GithubClient, NO_README};
use repo_digest::model::{GenerationOptions, ModelService, OllamaModel};
use repo_digest::models::{RepoId, SummaryKind};
use repo_digest::store::SummaryStore;
use repo_digest::summarizer::{Summarizer, NO_COMMITS};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── Mock server ────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct MockState {
    queries: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Vec<String>>>,
    generations: Arc<Mutex<Vec<Value>>>,
}

async fn readme(State(state): State<MockState>, headers: HeaderMap) -> Json<Value> {
    if let Some(auth) = headers.get("authorization") {
        state
            .auth
            .lock()
            .unwrap()
            .push(auth.to_str().unwrap().to_string());
    }
    let encoded =
        base64::engine::general_purpose::STANDARD.encode("# Flask\n\nA micro web framework.\n");
    // The contents API wraps base64 at 60 columns.
    let (head, tail) = encoded.split_at(20);
    Json(json!({ "content": format!("{}\n{}\n", head, tail), "encoding": "base64" }))
}

async fn commits(State(state): State<MockState>, RawQuery(query): RawQuery) -> Json<Value> {
    state.queries.lock().unwrap().push(query.unwrap_or_default());
    Json(json!([
        { "sha": "a1", "commit": { "message": "Fix routing bug" } },
        { "sha": "b2", "commit": { "message": "Bump version" } },
        { "sha": "c3", "commit": { "message": "Initial commit" } },
    ]))
}

async fn generate(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
    state.generations.lock().unwrap().push(body);
    Json(json!({ "response": "  Flask is a micro web framework.  ", "done": true }))
}

fn flask_metadata() -> Value {
    json!({
        "full_name": "pallets/flask",
        "description": "The Python micro framework for building web applications.",
        "stargazers_count": 68000,
        "forks_count": 16000,
        "open_issues_count": 5,
        "language": "Python",
        "license": { "key": "bsd-3-clause", "name": "BSD 3-Clause License" },
        "updated_at": "2024-01-01T00:00:00Z",
        "watchers_count": 68000
    })
}

async fn spawn_mock() -> (String, MockState) {
    let state = MockState::default();
    let app = Router::new()
        .route("/repos/pallets/flask", get(|| async { Json(flask_metadata()) }))
        .route("/repos/pallets/flask/readme", get(readme))
        .route("/repos/pallets/flask/commits", get(commits))
        .route(
            "/repos/pallets/flask/issues",
            get(|| async {
                Json(json!([
                    { "title": "Crash on start", "body": "Steps to reproduce the crash" },
                    { "title": "Add a thing", "body": "PR body", "pull_request": { "url": "x" } },
                    { "title": "Docs typo", "body": null },
                ]))
            }),
        )
        .route(
            "/repos/pallets/flask/pulls",
            get(|| async { Json(json!([{ "title": "Add async views", "body": "Implements async views" }])) }),
        )
        .route("/repos/ghost/empty", get(|| async { Json(json!({ "full_name": "ghost/empty" })) }))
        .route("/repos/ghost/empty/readme", get(|| async { StatusCode::NOT_FOUND }))
        .route("/repos/ghost/empty/commits", get(|| async { Json(json!([])) }))
        .route(
            "/repos/broken/repo/commits",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/api/generate", post(generate))
        .route(
            "/failing/api/generate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded") }),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn github(base: &str, token: Option<&str>) -> GithubClient {
    let config = GithubConfig {
        api_url: base.to_string(),
        item_limit: 2,
        body_preview_chars: 10,
        ..GithubConfig::default()
    };
    GithubClient::new(&config, token.map(str::to_string)).unwrap()
}

fn ollama(endpoint: &str) -> OllamaModel {
    OllamaModel::new(&ModelConfig {
        endpoint: endpoint.to_string(),
        ..ModelConfig::default()
    })
    .unwrap()
}

fn repo(s: &str) -> RepoId {
    s.parse().unwrap()
}

// ─── GitHub client ──────────────────────────────────────────────────

#[tokio::test]
async fn test_readme_is_decoded_and_token_is_sent() {
    let (base, state) = spawn_mock().await;
    let client = github(&base, Some("secret"));

    let text = client.readme(&repo("pallets/flask")).await.unwrap();
    assert_eq!(text, "# Flask\n\nA micro web framework.\n");
    assert_eq!(state.auth.lock().unwrap().as_slice(), ["Bearer secret"]);

    let missing = client.readme(&repo("ghost/empty")).await.unwrap();
    assert_eq!(missing, NO_README);
}

#[tokio::test]
async fn test_listings_respect_item_limit() {
    let (base, state) = spawn_mock().await;
    let client = github(&base, None);
    let flask = repo("pallets/flask");

    let commits = client.commits(&flask).await.unwrap();
    assert_eq!(commits, vec!["Fix routing bug", "Bump version"]);
    assert_eq!(state.queries.lock().unwrap().as_slice(), ["per_page=2"]);

    let issues = client.issues(&flask).await.unwrap();
    assert_eq!(issues, vec!["Crash on start - Steps to r", "Docs typo - "]);

    let pulls = client.pull_requests(&flask).await.unwrap();
    assert_eq!(pulls, vec!["Add async views - Implements"]);
}

#[tokio::test]
async fn test_metadata_mapping() {
    let (base, _) = spawn_mock().await;
    let client = github(&base, None);

    let meta = client.metadata(&repo("pallets/flask")).await.unwrap();
    assert_eq!(meta.full_name, "pallets/flask");
    assert_eq!(meta.stars, 68000);
    assert_eq!(meta.forks, 16000);
    assert_eq!(meta.language, "Python");
    assert_eq!(meta.license, "BSD 3-Clause License");

    let bare = client.metadata(&repo("ghost/empty")).await.unwrap();
    assert_eq!(bare.license, "Unknown");
    assert_eq!(bare.stars, 0);
    assert_eq!(bare.description, "");
}

#[tokio::test]
async fn test_server_error_surfaces_status() {
    let (base, _) = spawn_mock().await;
    let client = github(&base, None);

    let err = client.commits(&repo("broken/repo")).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("500"), "got: {}", message);
    assert!(message.contains("boom"), "got: {}", message);

    // Missing repositories are errors for listings, unlike the README.
    assert!(client.issues(&repo("ghost/gone")).await.is_err());
}

// ─── Model provider ─────────────────────────────────────────────────

#[tokio::test]
async fn test_ollama_request_shape() {
    let (base, state) = spawn_mock().await;
    let model = ollama(&base);
    assert_eq!(model.model_name(), "phi3.5");

    let text = model
        .generate("<|user|>\nhi\n<|assistant|>", &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "Flask is a micro web framework.");

    let sent = state.generations.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "phi3.5");
    assert_eq!(sent["stream"], false);
    assert_eq!(sent["raw"], true);
    assert_eq!(sent["options"]["num_predict"], 400);
    assert!(sent["prompt"].as_str().unwrap().ends_with("<|assistant|>"));
}

#[tokio::test]
async fn test_ollama_server_error() {
    let (base, _) = spawn_mock().await;
    let model = ollama(&format!("{}/failing", base));

    let err = model
        .generate("hi", &GenerationOptions::default())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Model server error 500"), "got: {}", message);
    assert!(message.contains("model not loaded"), "got: {}", message);
}

#[test]
fn test_ollama_rejects_untrusted_model() {
    let err = OllamaModel::new(&ModelConfig {
        model: "some/other-model".to_string(),
        ..ModelConfig::default()
    })
    .err()
    .unwrap();
    assert!(err.to_string().contains("Untrusted model"));
}

// ─── Summarizer ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_summarize_readme_end_to_end() {
    let (base, state) = spawn_mock().await;
    let tmp = TempDir::new().unwrap();
    let store = SummaryStore::new(tmp.path());
    let summarizer = Summarizer::new(
        Arc::new(github(&base, None)),
        Arc::new(ollama(&base)),
        store.clone(),
        GenerationOptions::default(),
    );
    let flask = repo("pallets/flask");

    let doc = summarizer.summarize(SummaryKind::Readme, &flask).await.unwrap();
    assert_eq!(doc.summary, "Flask is a micro web framework.");
    assert_eq!(doc.metadata["stars"], 68000);
    assert_eq!(doc.metadata["model"], "phi3.5");
    assert!(doc.metadata.contains_key("generated_at"));

    let prompt = state.generations.lock().unwrap()[0]["prompt"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(prompt.starts_with("<|system|>"));
    assert!(prompt.contains("A micro web framework."));

    let stored = store.load(&flask, SummaryKind::Readme).unwrap().unwrap();
    assert_eq!(stored, doc);
    assert!(tmp.path().join("pallets/flask/readme_summary.json").exists());
}

#[tokio::test]
async fn test_summarize_empty_commits_skips_model() {
    let (base, state) = spawn_mock().await;
    let tmp = TempDir::new().unwrap();
    let summarizer = Summarizer::new(
        Arc::new(github(&base, None)),
        Arc::new(ollama(&base)),
        SummaryStore::new(tmp.path()),
        GenerationOptions::default(),
    );

    let doc = summarizer
        .summarize(SummaryKind::Commits, &repo("ghost/empty"))
        .await
        .unwrap();
    assert_eq!(doc.summary, NO_COMMITS);
    assert_eq!(doc.metadata["license"], "Unknown");
    assert!(state.generations.lock().unwrap().is_empty());
    assert!(tmp.path().join("ghost/empty/commits_summary.json").exists());
}

#[tokio::test]
async fn test_summarize_failure_stores_nothing() {
    let (base, _) = spawn_mock().await;
    let tmp = TempDir::new().unwrap();
    let summarizer = Summarizer::new(
        Arc::new(github(&base, None)),
        Arc::new(ollama(&base)),
        SummaryStore::new(tmp.path()),
        GenerationOptions::default(),
    );

    let err = summarizer
        .summarize(SummaryKind::Commits, &repo("broken/repo"))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("500"));
    assert!(summarizer.store().list().unwrap().is_empty());
}
