//! Pass-through relay between the supervisor and the dispatcher.
//!
//! Request lines arriving on the relay's input are forwarded unparsed to the
//! dispatcher's Unix socket; every line coming back from the socket is
//! written unparsed to the relay's output. The two directions run as
//! separate tasks, so several requests can be in flight at once.
//!
//! When a request cannot be forwarded the relay answers it itself with a
//! `BridgeFailure` error carrying the request's id (the only part of a
//! request it ever parses), drops the connection, and reconnects on the next
//! request.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::dispatcher::{next_line, write_line};
use crate::error::ErrorKind;
use crate::protocol::{peek_id, RpcResponse};

type SharedOutput<W> = Arc<Mutex<W>>;

pub struct Relay {
    socket: PathBuf,
    config: RelayConfig,
    connect_timeout: Duration,
}

/// A live link to the dispatcher plus the task copying its replies out.
struct Link {
    writer: OwnedWriteHalf,
    replies: Option<JoinHandle<()>>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.replies.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Half-close towards the dispatcher and wait for its remaining replies.
    async fn finish(mut self) {
        let _ = self.writer.shutdown().await;
        if let Some(task) = self.replies.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.replies.take() {
            task.abort();
        }
    }
}

impl Relay {
    pub fn new(socket: impl Into<PathBuf>, config: RelayConfig, connect_timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            config,
            connect_timeout,
        }
    }

    /// Relay stdin/stdout.
    pub async fn run_stdio(&self) -> Result<()> {
        let input = BufReader::new(tokio::io::stdin());
        self.run(input, tokio::io::stdout()).await
    }

    /// Forward lines from `input` until it closes (and `exit_on_eof` is set).
    pub async fn run<R, W>(&self, mut input: R, output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let output: SharedOutput<W> = Arc::new(Mutex::new(output));

        let mut link = match connect_with_deadline(&self.socket, self.connect_timeout).await {
            Ok(stream) => Some(self.open(stream, &output)),
            Err(e) => {
                tracing::error!(socket = %self.socket.display(), error = %e, "initial connect failed");
                None
            }
        };

        let mut buf = Vec::new();
        loop {
            let line = match next_line(&mut input, &mut buf).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    if self.config.exit_on_eof {
                        tracing::info!("input closed, relay exiting");
                        if let Some(link) = link.take() {
                            link.finish().await;
                        }
                        return Ok(());
                    }
                    tokio::time::sleep(self.config.retry_delay()).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read input");
                    tokio::time::sleep(self.config.retry_delay()).await;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            if link.as_ref().is_some_and(Link::is_closed) {
                tracing::warn!("dispatcher closed the connection");
                link = None;
            }
            if link.is_none() {
                match UnixStream::connect(&self.socket).await {
                    Ok(stream) => {
                        tracing::info!(socket = %self.socket.display(), "reconnected to dispatcher");
                        link = Some(self.open(stream, &output));
                    }
                    Err(e) => tracing::warn!(error = %e, "reconnect failed"),
                }
            }

            let forwarded = match link.as_mut() {
                Some(l) => write_line(&mut l.writer, &line)
                    .await
                    .map_err(|e| format!("write to dispatcher failed: {}", e)),
                None => Err("no connection to dispatcher".to_string()),
            };

            if let Err(reason) = forwarded {
                tracing::error!(error = %reason, "forwarding failed");
                link = None;
                self.answer_failure(&output, &line, &reason).await?;
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }
    }

    fn open<W>(&self, stream: UnixStream, output: &SharedOutput<W>) -> Link
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (read, writer) = stream.into_split();
        let output = output.clone();
        let replies = tokio::spawn(async move {
            let mut reader = BufReader::new(read);
            let mut buf = Vec::new();
            loop {
                match next_line(&mut reader, &mut buf).await {
                    Ok(Some(line)) => {
                        let mut out = output.lock().await;
                        if let Err(e) = write_line(&mut *out, &line).await {
                            tracing::error!(error = %e, "failed to write reply");
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("dispatcher connection reached EOF");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read from dispatcher");
                        return;
                    }
                }
            }
        });
        Link {
            writer,
            replies: Some(replies),
        }
    }

    async fn answer_failure<W>(&self, output: &SharedOutput<W>, line: &str, reason: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let resp = RpcResponse::failure(
            peek_id(line),
            ErrorKind::BridgeFailure.rpc_error(format!("relay could not forward request: {}", reason)),
        );
        let mut out = output.lock().await;
        write_line(&mut *out, &resp.to_line())
            .await
            .context("Failed to write bridge failure response")
    }
}

/// Connect to `path`, retrying every 50 ms until `deadline` has elapsed.
pub async fn connect_with_deadline(path: &Path, deadline: Duration) -> Result<UnixStream> {
    let start = Instant::now();
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if start.elapsed() >= deadline => {
                bail!(
                    "dispatcher socket {} did not become ready within {:?}: {}",
                    path.display(),
                    deadline,
                    e
                );
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
