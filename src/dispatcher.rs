//! JSON-RPC request dispatcher.
//!
//! Reads one request per line, resolves the method in the [`ToolRegistry`],
//! runs the tool, and writes exactly one response line per request. Every
//! response line is flushed as soon as it is written.
//!
//! # Policies
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `sequential` | one handler at a time, responses in request order |
//! | `concurrent` | each request runs as its own task (at most `max_in_flight`), responses written as they complete |
//!
//! # Transports
//!
//! - [`Dispatcher::serve_stdio`]: stdin/stdout; returns at end of input.
//! - [`Dispatcher::serve_unix`]: a Unix socket; each connection is served
//!   with the same loop until SIGTERM or Ctrl-C.
//!
//! Handlers run in their own task so that a panic is caught and reported as
//! a `HandlerFailure` response instead of taking the dispatcher down.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

use crate::config::{DispatchMode, DispatcherConfig};
use crate::error::ErrorKind;
use crate::protocol::{parse_request, IncomingRequest, RpcResponse};
use crate::traits::{ToolContext, ToolRegistry};

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext, config: DispatcherConfig) -> Self {
        Self {
            registry,
            ctx,
            config,
        }
    }

    /// Handle one input line. Blank lines produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match parse_request(line) {
            Ok(req) => Some(self.handle(req).await),
            Err(rejected) => {
                tracing::warn!(error = %rejected.message, "rejected request line");
                Some(RpcResponse::failure(
                    rejected.id,
                    ErrorKind::InvalidRequest.rpc_error(rejected.message),
                ))
            }
        }
    }

    /// Route a parsed request to its tool.
    pub async fn handle(&self, req: IncomingRequest) -> RpcResponse {
        let IncomingRequest { id, method, params } = req;

        let Some(tool) = self.registry.resolve(&method) else {
            tracing::warn!(method = %method, "unknown method");
            return RpcResponse::failure(
                id,
                ErrorKind::MethodNotFound.rpc_error(format!("Unknown method: {}", method)),
            );
        };

        let started = Instant::now();
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move { tool.execute(Value::Object(params), &ctx).await });

        let response = match task.await {
            Ok(Ok(result)) => RpcResponse::success(id, result),
            Ok(Err(e)) => {
                RpcResponse::failure(id, ErrorKind::HandlerFailure.rpc_error(format!("{:#}", e)))
            }
            Err(join) => {
                let message = if join.is_panic() {
                    format!("handler panicked: {}", panic_message(join.into_panic()))
                } else {
                    "handler was cancelled".to_string()
                };
                RpcResponse::failure(id, ErrorKind::HandlerFailure.rpc_error(message))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &response.error {
            None => tracing::info!(method = %method, elapsed_ms, "request handled"),
            Some(err) => {
                tracing::warn!(method = %method, elapsed_ms, error = %err.message, "request failed")
            }
        }
        response
    }

    /// Serve requests from `reader` until end of input.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match self.config.mode {
            DispatchMode::Sequential => self.serve_sequential(reader, writer).await,
            DispatchMode::Concurrent => self.serve_concurrent(reader, writer).await,
        }
    }

    async fn serve_sequential<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut buf).await? {
            if let Some(resp) = self.handle_line(&line).await {
                write_line(&mut writer, &resp.to_line()).await?;
            }
        }
        Ok(())
    }

    async fn serve_concurrent<R, W>(self: Arc<Self>, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let limit = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let (tx, mut rx) = mpsc::channel::<String>(self.config.max_in_flight.max(1));

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                write_line(&mut writer, &line).await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let mut buf = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut buf).await? {
            let permit = limit
                .clone()
                .acquire_owned()
                .await
                .context("dispatcher semaphore closed")?;
            let this = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Some(resp) = this.handle_line(&line).await {
                    if tx.send(resp.to_line()).await.is_err() {
                        tracing::warn!("response dropped: writer has stopped");
                    }
                }
            });
        }

        // The writer finishes once every in-flight task has sent its line.
        drop(tx);
        writer_task.await.context("response writer task failed")?
    }

    /// Serve stdin/stdout until stdin closes.
    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        tracing::info!(tools = self.registry.len(), "dispatcher serving stdio");
        let reader = BufReader::new(tokio::io::stdin());
        self.serve(reader, tokio::io::stdout()).await?;
        tracing::info!("stdin closed, dispatcher exiting");
        Ok(())
    }

    /// Listen on a Unix socket and serve each connection.
    ///
    /// A stale socket file at `path` is replaced. The file is removed again
    /// on SIGTERM or Ctrl-C.
    pub async fn serve_unix(self: Arc<Self>, path: &Path) -> Result<()> {
        use tokio::net::UnixListener;
        use tokio::signal::unix::{signal, SignalKind};

        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind socket: {}", path.display()))?;
        let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tracing::info!(socket = %path.display(), tools = self.registry.len(), "dispatcher listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("Failed to accept connection")?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        tracing::info!("connection opened");
                        let (read, write) = stream.into_split();
                        if let Err(e) = this.serve(BufReader::new(read), write).await {
                            tracing::warn!(error = %e, "connection ended with error");
                        }
                        tracing::info!("connection closed");
                    });
                }
                _ = terminate.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(path);
        Ok(())
    }
}

/// Read one `\n`-terminated line; `None` at end of input.
///
/// Invalid UTF-8 is replaced rather than treated as a transport error, so a
/// garbled line is answered like any other malformed request.
pub(crate) async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Write `line` plus a newline and flush.
pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
