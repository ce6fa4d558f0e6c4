//! # repo-digest CLI (`digest`)
//!
//! The `digest` binary runs every part of the pipeline: the HTTP facade, the
//! supervisor, and the two child processes it launches.
//!
//! ## Usage
//!
//! ```bash
//! digest --config ./config/digest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `digest serve` | Start the system and the HTTP facade |
//! | `digest host` | Start the system and send JSON-RPC requests typed on stdin |
//! | `digest call <method>` | Send one request through a fresh system |
//! | `digest batch` | Summarize every repository in `[repositories]` |
//! | `digest summaries list` | List stored summaries |
//! | `digest summaries show <owner/repo> <kind>` | Print one stored summary |
//! | `digest dispatch` | Run the dispatcher (stdin/stdout or `--listen <socket>`) |
//! | `digest relay --connect <socket>` | Run the relay |
//!
//! `dispatch` and `relay` are launched by the supervisor; their stdout is the
//! protocol channel, so all logging goes to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use repo_digest::config::{self, Config};
use repo_digest::dispatcher::Dispatcher;
use repo_digest::models::{RepoId, SummaryKind};
use repo_digest::protocol::{RequestId, RpcRequest};
use repo_digest::relay::Relay;
use repo_digest::server;
use repo_digest::store::SummaryStore;
use repo_digest::system::SystemApi;
use repo_digest::traits::{ToolContext, ToolRegistry};

/// repo-digest: summarize GitHub repositories with a local language model.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Every setting has a default, so the file is optional.
#[derive(Parser)]
#[command(
    name = "digest",
    about = "Summarize GitHub repositories with a local language model",
    version,
    long_about = "repo-digest fetches README, commit, issue, and pull request data from GitHub and \
    summarizes it with a locally hosted language model. Requests travel as line-delimited JSON-RPC \
    through a supervised relay to a dispatcher process, and results are stored as JSON files."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/digest.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/digest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the system and serve the HTTP facade.
    ///
    /// Binds to `[server].bind`. Ctrl-C stops the server and the child
    /// processes.
    Serve,

    /// Start the system and relay requests from stdin.
    ///
    /// Each input line is a JSON object with `method`, optional `params`,
    /// and optional `id`. Each response is printed as one JSON line.
    Host,

    /// Send one request and print the response.
    ///
    /// Starts the system, sends the request, prints the JSON-RPC response,
    /// and stops the system again.
    Call {
        /// Method name (e.g. `ping`, `summarize.readme`).
        method: String,

        /// Request parameters as `key=value` pairs.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Summarize every repository listed in `[repositories]`.
    Batch {
        /// Only produce this summary kind (`readme`, `commits`, `issues`, `pulls`).
        #[arg(long)]
        kind: Option<SummaryKind>,
    },

    /// Browse stored summaries.
    Summaries {
        #[command(subcommand)]
        action: SummariesAction,
    },

    /// Run the dispatcher.
    ///
    /// Serves JSON-RPC on stdin/stdout, or on a Unix socket with `--listen`.
    Dispatch {
        /// Unix socket path to listen on.
        #[arg(long)]
        listen: Option<PathBuf>,
    },

    /// Run the relay between stdin/stdout and a dispatcher socket.
    Relay {
        /// Dispatcher socket path.
        #[arg(long)]
        connect: PathBuf,
    },
}

/// Stored-summary subcommands.
#[derive(Subcommand)]
enum SummariesAction {
    /// List every stored summary.
    List,
    /// Print one stored summary as JSON.
    Show {
        /// Repository as `owner/repo`.
        repo: RepoId,
        /// Summary kind.
        kind: SummaryKind,
    },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config_or_minimal(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg, &cli.config).await?;
        }
        Commands::Host => {
            run_host(&cfg, &cli.config).await?;
        }
        Commands::Call { method, params } => {
            run_call(&cfg, &cli.config, &method, params).await?;
        }
        Commands::Batch { kind } => {
            run_batch(&cfg, &cli.config, kind).await?;
        }
        Commands::Summaries { action } => {
            let store = SummaryStore::new(&cfg.store.root);
            match action {
                SummariesAction::List => {
                    let entries = store.list()?;
                    if entries.is_empty() {
                        println!("No summaries stored under {}", store.root().display());
                    }
                    for entry in entries {
                        println!("{}/{}  {}", entry.owner, entry.repo, entry.mode);
                    }
                }
                SummariesAction::Show { repo, kind } => match store.load(&repo, kind)? {
                    Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                    None => bail!("No {} summary stored for {}", kind, repo),
                },
            }
        }
        Commands::Dispatch { listen } => {
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::new(ToolRegistry::with_builtins()),
                ToolContext::from_config(&cfg)?,
                cfg.dispatcher.clone(),
            ));
            match listen {
                Some(path) => dispatcher.serve_unix(&path).await?,
                None => dispatcher.serve_stdio().await?,
            }
        }
        Commands::Relay { connect } => {
            let relay = Relay::new(
                connect,
                cfg.relay.clone(),
                cfg.supervisor.startup_timeout(),
            );
            relay.run_stdio().await?;
        }
    }

    Ok(())
}

async fn run_call(
    cfg: &Config,
    config_path: &std::path::Path,
    method: &str,
    params: Vec<(String, String)>,
) -> Result<()> {
    let params: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let api = SystemApi::from_config(cfg, config_path)?;
    let outcome = api.call(method, params).await;
    api.stop_system().await;

    let resp = outcome.with_context(|| format!("call to '{}' failed", method))?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    if let Some(err) = resp.error {
        bail!("{} returned error {}: {}", method, err.code, err.message);
    }
    Ok(())
}

async fn run_batch(cfg: &Config, config_path: &std::path::Path, kind: Option<SummaryKind>) -> Result<()> {
    let repos = cfg.repositories.repo_ids()?;
    if repos.is_empty() {
        bail!("No repositories configured in [repositories].list");
    }
    let kinds: Vec<SummaryKind> = match kind {
        Some(kind) => vec![kind],
        None => SummaryKind::ALL.to_vec(),
    };

    let api = SystemApi::from_config(cfg, config_path)?;
    api.start_system().await?;

    let mut failures = 0usize;
    for repo in &repos {
        for kind in &kinds {
            match api.summarize(*kind, repo).await {
                Ok(resp) if !resp.is_error() => println!("ok    {} {}", repo, kind),
                Ok(resp) => {
                    failures += 1;
                    let message = resp.error.map(|e| e.message).unwrap_or_default();
                    println!("error {} {}: {}", repo, kind, message);
                }
                Err(e) => {
                    failures += 1;
                    println!("error {} {}: {}", repo, kind, e);
                }
            }
        }
    }
    api.stop_system().await;

    let total = repos.len() * kinds.len();
    println!("{} of {} summaries succeeded", total - failures, total);
    if failures > 0 {
        bail!("{} summaries failed", failures);
    }
    Ok(())
}

async fn run_host(cfg: &Config, config_path: &std::path::Path) -> Result<()> {
    let api = SystemApi::from_config(cfg, config_path)?;
    api.start_system().await?;
    eprintln!("System started. Enter one JSON request per line, Ctrl-D to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request = match host_request(&api, &line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("error: {:#}", e);
                continue;
            }
        };
        match api.backend().send_request(request).await {
            Ok(resp) => println!("{}", resp.to_line()),
            Err(e) => eprintln!("error ({}): {}", e.kind().as_str(), e),
        }
    }

    api.stop_system().await;
    Ok(())
}

/// Build a request from a host input line, assigning an id when absent.
fn host_request(api: &SystemApi, line: &str) -> Result<RpcRequest> {
    let value: Value = serde_json::from_str(line).context("input is not JSON")?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .context("input needs a string \"method\"")?;
    let params = match value.get("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => bail!("\"params\" must be an object"),
    };
    let id = match value.get("id") {
        None | Some(Value::Null) => api.next_id(),
        Some(raw) => serde_json::from_value::<RequestId>(raw.clone())
            .context("\"id\" must be an integer or a string")?,
    };
    Ok(RpcRequest::new(id, method, params))
}
