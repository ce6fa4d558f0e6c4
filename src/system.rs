//! Application facade over a running pipeline.
//!
//! [`SystemApi`] is what the HTTP server and the CLI talk to. It owns an
//! [`RpcBackend`] (the multi-process [`Supervisor`] or the in-process debug
//! host), hands out request ids, and reads stored summaries directly from
//! the [`SummaryStore`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{Config, SystemMode};
use crate::error::CallError;
use crate::local::InProcessHost;
use crate::models::{RepoId, SummaryDocument, SummaryEntry, SummaryKind};
use crate::protocol::{RequestId, RpcRequest, RpcResponse};
use crate::store::SummaryStore;
use crate::supervisor::{LaunchSpec, Supervisor};

/// Something that can carry JSON-RPC calls to a dispatcher.
#[async_trait]
pub trait RpcBackend: Send + Sync {
    /// Bring the backend up. Calling it while running is a no-op.
    async fn start(&self) -> Result<(), CallError>;

    /// Tear the backend down. Calling it while stopped is a no-op.
    async fn stop(&self);

    async fn restart(&self) -> Result<(), CallError> {
        self.stop().await;
        self.start().await
    }

    async fn is_running(&self) -> bool;

    /// Send one request and wait for the response carrying its id.
    ///
    /// Every failure, including timeouts and dead processes, is an `Err`.
    /// A dispatcher-side error (unknown method, handler failure) is a
    /// successful call whose response carries `error`.
    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, CallError>;
}

pub struct SystemApi {
    backend: Arc<dyn RpcBackend>,
    store: SummaryStore,
    next_id: AtomicU64,
}

impl SystemApi {
    pub fn new(backend: Arc<dyn RpcBackend>, store: SummaryStore) -> Self {
        Self {
            backend,
            store,
            next_id: AtomicU64::new(1),
        }
    }

    /// Pick the backend named by `[system] mode`.
    ///
    /// In pipeline mode the child processes are launched from the current
    /// executable with `--config <config_path>`.
    pub fn from_config(config: &Config, config_path: &Path) -> anyhow::Result<Self> {
        let backend: Arc<dyn RpcBackend> = match config.system.mode {
            SystemMode::Pipeline => Arc::new(Supervisor::new(
                config.supervisor.clone(),
                LaunchSpec::current_exe(config_path)?,
            )),
            SystemMode::InProcess => Arc::new(InProcessHost::from_config(config)?),
        };
        Ok(Self::new(backend, SummaryStore::new(&config.store.root)))
    }

    pub fn backend(&self) -> &Arc<dyn RpcBackend> {
        &self.backend
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn start_system(&self) -> Result<(), CallError> {
        self.backend.start().await
    }

    pub async fn stop_system(&self) {
        self.backend.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.backend.is_running().await
    }

    /// Send `method` with `params`, starting the system first if needed.
    pub async fn call(&self, method: &str, params: Map<String, Value>) -> Result<RpcResponse, CallError> {
        if !self.backend.is_running().await {
            self.backend.start().await?;
        }
        let request = RpcRequest::new(self.next_id(), method, params);
        self.backend.send_request(request).await
    }

    /// Request one summary for `repo`.
    ///
    /// Returns the raw JSON-RPC response; the summary text is its `result`.
    pub async fn summarize(&self, kind: SummaryKind, repo: &RepoId) -> Result<RpcResponse, CallError> {
        let mut params = Map::new();
        params.insert("owner".into(), Value::String(repo.owner.clone()));
        params.insert("repo".into(), Value::String(repo.repo.clone()));
        self.call(kind.method(), params).await
    }

    /// `true` when the dispatcher answers `ping` with `{"ok": true}`.
    ///
    /// Does not start the system.
    pub async fn ping(&self) -> bool {
        if !self.backend.is_running().await {
            return false;
        }
        let request = RpcRequest::new(self.next_id(), "ping", Map::new());
        match self.backend.send_request(request).await {
            Ok(resp) => resp
                .result
                .as_ref()
                .and_then(|r| r.get("ok"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "ping failed");
                false
            }
        }
    }

    pub fn list_summaries(&self) -> anyhow::Result<Vec<SummaryEntry>> {
        self.store.list()
    }

    pub fn load_summary(&self, repo: &RepoId, kind: SummaryKind) -> anyhow::Result<Option<SummaryDocument>> {
        self.store.load(repo, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records requests and answers from a script.
    #[derive(Default)]
    struct ScriptedBackend {
        running: AtomicBool,
        starts: AtomicU64,
        seen: Mutex<Vec<RpcRequest>>,
        fail_with_timeout: bool,
    }

    #[async_trait]
    impl RpcBackend for ScriptedBackend {
        async fn start(&self) -> Result<(), CallError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
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
            self.seen.lock().unwrap().push(request.clone());
            if self.fail_with_timeout {
                return Err(CallError::Timeout {
                    id: request.id,
                    after: std::time::Duration::from_secs(1),
                });
            }
            let result = match request.method.as_str() {
                "ping" => json!({ "ok": true }),
                _ => json!("text"),
            };
            Ok(RpcResponse::success(Some(request.id), result))
        }
    }

    fn api(backend: Arc<ScriptedBackend>, tmp: &TempDir) -> SystemApi {
        SystemApi::new(backend, SummaryStore::new(tmp.path()))
    }

    #[tokio::test]
    async fn test_summarize_starts_system_once_and_sends_params() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let api = api(backend.clone(), &tmp);
        let repo = RepoId::new("pallets", "flask").unwrap();

        let resp = api.summarize(SummaryKind::Issues, &repo).await.unwrap();
        assert_eq!(resp.result, Some(json!("text")));
        api.summarize(SummaryKind::Readme, &repo).await.unwrap();
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].method, "summarize.issues");
        assert_eq!(seen[0].params["owner"], "pallets");
        assert_eq!(seen[0].params["repo"], "flask");
        assert_ne!(seen[0].id, seen[1].id);
    }

    #[tokio::test]
    async fn test_ping_requires_running_system() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let api = api(backend.clone(), &tmp);

        assert!(!api.ping().await);
        api.start_system().await.unwrap();
        assert!(api.ping().await);
        api.stop_system().await;
        assert!(!api.ping().await);
    }

    #[tokio::test]
    async fn test_call_errors_pass_through() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend {
            fail_with_timeout: true,
            ..ScriptedBackend::default()
        });
        let api = api(backend, &tmp);
        let repo = RepoId::new("a", "b").unwrap();

        let err = api.summarize(SummaryKind::Commits, &repo).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!api.ping().await);
    }
}
