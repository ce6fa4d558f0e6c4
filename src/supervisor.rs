//! Process supervisor for the dispatcher and relay.
//!
//! [`Supervisor::start`] launches two OS processes from the same binary:
//!
//! ```text
//!   Supervisor ──stdin──▶ relay ──unix socket──▶ dispatcher
//!       ▲                   │
//!       └──────stdout───────┘
//! ```
//!
//! The relay's stdout is drained by a background task that hands every line
//! to the session's [`Correlator`], which completes the caller waiting for
//! that response id. All other child output (both stderr streams, and
//! anything on stdout that is not a pending response) is appended to
//! `<log_dir>/<process>.log` and re-emitted as `tracing` debug events.
//!
//! Each start creates a fresh session with its own correlator, so output
//! from a stopped session can never complete a call made on a newer one.
//! A session whose child has died no longer counts as running; the next
//! [`start`](RpcBackend::start) tears it down and launches a new one.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::config::SupervisorConfig;
use crate::correlate::{Closed, Correlator, LineOutcome};
use crate::dispatcher::{next_line, write_line};
use crate::error::CallError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::system::RpcBackend;

const DISPATCHER: &str = "dispatcher";
const RELAY: &str = "relay";

/// How to launch the child processes: a program plus leading arguments.
///
/// The supervisor appends `dispatch --listen <socket>` or
/// `relay --connect <socket>`.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Re-launch the running executable with the same config file.
    pub fn current_exe(config_path: &Path) -> anyhow::Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {}", e))?;
        Ok(Self::new(
            program,
            vec!["--config".to_string(), config_path.display().to_string()],
        ))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).args(args).kill_on_drop(true);
        cmd
    }
}

struct Session {
    dispatcher: Child,
    relay: Child,
    relay_stdin: Arc<Mutex<ChildStdin>>,
    correlator: Arc<Correlator>,
    socket: PathBuf,
}

impl Session {
    /// `ProcessDied` if either child has exited or its output has closed.
    fn check_alive(&mut self) -> Result<(), CallError> {
        for (name, child) in [(DISPATCHER, &mut self.dispatcher), (RELAY, &mut self.relay)] {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(CallError::process_died(name, status.to_string()));
            }
        }
        match self.correlator.closed() {
            Some(reason) => Err(reason.error()),
            None => Ok(()),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    launch: LaunchSpec,
    session: Mutex<Option<Session>>,
    /// Held for the whole call when `serialize_requests` is on.
    gate: Mutex<()>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launch: LaunchSpec) -> Self {
        Self {
            config,
            launch,
            session: Mutex::new(None),
            gate: Mutex::new(()),
        }
    }

    /// PIDs of the dispatcher and relay, when running.
    pub async fn process_ids(&self) -> Option<(u32, u32)> {
        let guard = self.session.lock().await;
        let session = guard.as_ref()?;
        Some((session.dispatcher.id()?, session.relay.id()?))
    }

    async fn launch(&self) -> Result<Session, CallError> {
        for dir in [&self.config.log_dir, &self.config.run_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|source| CallError::Io {
                context: format!("failed to create {}", dir.display()),
                source,
            })?;
        }
        let socket = self
            .config
            .run_dir
            .join(format!("dispatch-{}.sock", uuid::Uuid::new_v4().simple()));
        let socket_arg = socket.display().to_string();
        let correlator = Arc::new(Correlator::new());

        let mut dispatcher = self
            .launch
            .command(&["dispatch", "--listen", &socket_arg])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CallError::Spawn {
                process: DISPATCHER.to_string(),
                source,
            })?;

        let mut relay = match self
            .launch
            .command(&["relay", "--connect", &socket_arg])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                let _ = dispatcher.kill().await;
                return Err(CallError::Spawn {
                    process: RELAY.to_string(),
                    source,
                });
            }
        };

        let relay_stdin = match relay.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = relay.kill().await;
                let _ = dispatcher.kill().await;
                return Err(CallError::BridgeFailure("relay stdin was not captured".into()));
            }
        };

        for (name, child) in [(DISPATCHER, &mut dispatcher), (RELAY, &mut relay)] {
            let log = self.open_log(name).await?;
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(drain(
                    name,
                    "stdout",
                    stdout,
                    log.clone(),
                    correlator.clone(),
                    name == RELAY,
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(drain(name, "stderr", stderr, log, correlator.clone(), false));
            }
        }

        tracing::info!(
            dispatcher_pid = dispatcher.id().unwrap_or_default(),
            relay_pid = relay.id().unwrap_or_default(),
            socket = %socket.display(),
            "system started"
        );

        Ok(Session {
            dispatcher,
            relay,
            relay_stdin: Arc::new(Mutex::new(relay_stdin)),
            correlator,
            socket,
        })
    }

    async fn open_log(&self, process: &str) -> Result<Arc<Mutex<File>>, CallError> {
        let path = self.config.log_dir.join(format!("{}.log", process));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| CallError::Io {
                context: format!("failed to open {}", path.display()),
                source,
            })?;
        Ok(Arc::new(Mutex::new(file)))
    }

    async fn terminate(&self, name: &str, child: &mut Child) {
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(process = name, pid, error = %e, "SIGTERM failed");
        }
        let grace = self.config.stop_grace();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(process = name, pid, %status, "process exited"),
            Ok(Err(e)) => tracing::warn!(process = name, pid, error = %e, "wait failed"),
            Err(_) => {
                tracing::warn!(process = name, pid, ?grace, "did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(process = name, pid, error = %e, "kill failed");
                }
            }
        }
    }

    /// Fail pending calls, stop both children and remove the socket.
    async fn shutdown(&self, mut session: Session, reason: Closed) {
        session.correlator.close(reason);
        self.terminate(RELAY, &mut session.relay).await;
        self.terminate(DISPATCHER, &mut session.dispatcher).await;

        match tokio::fs::remove_file(&session.socket).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %session.socket.display(), error = %e, "failed to remove socket"),
        }
    }
}

#[async_trait]
impl RpcBackend for Supervisor {
    async fn start(&self) -> Result<(), CallError> {
        let mut guard = self.session.lock().await;
        let health = guard.as_mut().map(Session::check_alive);
        match health {
            Some(Ok(())) => {
                tracing::info!("system already running");
                return Ok(());
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "replacing dead session");
                if let Some(dead) = guard.take() {
                    self.shutdown(dead, Closed::Stopped).await;
                }
            }
            None => {}
        }
        *guard = Some(self.launch().await?);
        Ok(())
    }

    async fn stop(&self) {
        let Some(session) = self.session.lock().await.take() else {
            tracing::info!("system not running, nothing to stop");
            return;
        };
        self.shutdown(session, Closed::Stopped).await;
        tracing::info!("system stopped");
    }

    /// `false` once either child has exited, even before `stop`.
    async fn is_running(&self) -> bool {
        match self.session.lock().await.as_mut() {
            Some(session) => session.check_alive().is_ok(),
            None => false,
        }
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, CallError> {
        let _serial = if self.config.serialize_requests {
            Some(self.gate.lock().await)
        } else {
            None
        };

        let (stdin, correlator) = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(CallError::NotRunning)?;
            session.check_alive()?;
            (session.relay_stdin.clone(), session.correlator.clone())
        };

        let rx = correlator.register(&request.id)?;
        tracing::debug!(id = %request.id, method = %request.method, "sending request");

        let written = {
            let mut stdin = stdin.lock().await;
            write_line(&mut *stdin, &request.to_line()).await
        };
        if let Err(e) = written {
            correlator.cancel(&request.id);
            return Err(CallError::BridgeFailure(format!(
                "failed to write to relay stdin: {}",
                e
            )));
        }

        correlator
            .wait(&request.id, rx, self.config.request_timeout())
            .await
    }
}

/// Copy one child stream into its log file and `tracing`.
///
/// With `route` set, lines that answer a pending request are also delivered
/// to the waiting caller. End of stream means the process has gone
/// away, so every pending call is failed.
async fn drain<R>(
    process: &'static str,
    stream: &'static str,
    reader: R,
    log: Arc<Mutex<File>>,
    correlator: Arc<Correlator>,
    route: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let line = match next_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(process, stream, error = %e, "failed to read child output");
                break;
            }
        };

        {
            let mut file = log.lock().await;
            if let Err(e) = write_line(&mut *file, &line).await {
                tracing::warn!(process, error = %e, "failed to append to log");
            }
        }

        if route {
            match correlator.resolve_line(&line) {
                LineOutcome::Delivered(id) => {
                    tracing::debug!(process, %id, "response delivered");
                    continue;
                }
                LineOutcome::Unmatched(id) => {
                    tracing::warn!(process, %id, "discarding response with no waiting caller");
                }
                LineOutcome::NotAResponse => {}
            }
        }
        tracing::debug!(process, stream, "{}", line);
    }

    correlator.close(Closed::Died {
        process: process.to_string(),
        status: format!("{} closed", stream),
    });
    let _ = log.lock().await.flush().await;
}
