//! In-process host for debugging.
//!
//! Runs the [`Dispatcher`] as a task inside the caller's process, connected
//! through an in-memory duplex pipe instead of a relay and a socket. Calls
//! are correlated by id and bounded by the same request timeout as the
//! multi-process [`Supervisor`](crate::supervisor::Supervisor).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::correlate::{Closed, Correlator, LineOutcome};
use crate::dispatcher::{next_line, write_line, Dispatcher};
use crate::error::CallError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::system::RpcBackend;
use crate::traits::{ToolContext, ToolRegistry};

const PIPE_CAPACITY: usize = 64 * 1024;

struct LocalSession {
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    correlator: Arc<Correlator>,
    server: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub struct InProcessHost {
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
    session: Mutex<Option<LocalSession>>,
}

impl InProcessHost {
    pub fn new(dispatcher: Arc<Dispatcher>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
            session: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::new(
            Arc::new(ToolRegistry::with_builtins()),
            ToolContext::from_config(config)?,
            config.dispatcher.clone(),
        );
        Ok(Self::new(
            Arc::new(dispatcher),
            config.supervisor.request_timeout(),
        ))
    }
}

#[async_trait]
impl RpcBackend for InProcessHost {
    async fn start(&self) -> Result<(), CallError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.correlator.closed().is_none() {
                tracing::info!("in-process dispatcher already running");
                return Ok(());
            }
            tracing::warn!("replacing stopped in-process dispatcher");
            if let Some(dead) = guard.take() {
                dead.server.abort();
                dead.reader.abort();
            }
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let correlator = Arc::new(Correlator::new());

        let dispatcher = self.dispatcher.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = dispatcher.serve(BufReader::new(server_read), server_write).await {
                tracing::error!(error = %e, "in-process dispatcher failed");
            }
        });

        let routes = correlator.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(client_read);
            let mut buf = Vec::new();
            while let Ok(Some(line)) = next_line(&mut reader, &mut buf).await {
                if let LineOutcome::Unmatched(id) = routes.resolve_line(&line) {
                    tracing::warn!(%id, "discarding response with no waiting caller");
                }
            }
            routes.close(Closed::Died {
                process: "dispatcher".into(),
                status: "in-process pipe closed".into(),
            });
        });

        *guard = Some(LocalSession {
            writer: Arc::new(Mutex::new(client_write)),
            correlator,
            server,
            reader,
        });
        tracing::info!("in-process dispatcher started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(session) = self.session.lock().await.take() else {
            tracing::info!("in-process dispatcher not running, nothing to stop");
            return;
        };
        session.correlator.close(Closed::Stopped);
        session.server.abort();
        session.reader.abort();
        tracing::info!("in-process dispatcher stopped");
    }

    async fn is_running(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.correlator.closed().is_none(),
            None => false,
        }
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, CallError> {
        let (writer, correlator) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(CallError::NotRunning)?;
            if let Some(reason) = session.correlator.closed() {
                return Err(reason.error());
            }
            (session.writer.clone(), session.correlator.clone())
        };

        let rx = correlator.register(&request.id)?;
        let written = {
            let mut writer = writer.lock().await;
            write_line(&mut *writer, &request.to_line()).await
        };
        if let Err(e) = written {
            correlator.cancel(&request.id);
            return Err(CallError::BridgeFailure(format!(
                "failed to write to in-process dispatcher: {}",
                e
            )));
        }

        correlator.wait(&request.id, rx, self.timeout).await
    }
}
