//! # repo-digest
//!
//! Summarize GitHub repositories with a locally hosted language model.
//!
//! Summaries are produced by tools running inside a **dispatcher** process.
//! The caller never talks to the dispatcher directly: a **supervisor** in the
//! caller's process launches the dispatcher plus a **relay** process and
//! exchanges line-delimited JSON-RPC with the relay, matching every response
//! to its request by id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────┐   ┌────────────┐
//! │ HTTP/CLI │──▶│ Supervisor │──▶│ Relay │──▶│ Dispatcher │
//! │ SystemApi│◀──│ correlator │◀──│       │◀──│  registry  │
//! └──────────┘   └────────────┘   └───────┘   └─────┬──────┘
//!                                                   ▼
//!                                ┌────────┐  ┌────────────┐  ┌───────┐
//!                                │ GitHub │◀─│ Summarizer │─▶│ Model │
//!                                └────────┘  └─────┬──────┘  └───────┘
//!                                                  ▼
//!                                          summaries/<owner>/<repo>/
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! digest serve                               # HTTP facade on [server].bind
//! digest call ping                           # one request through the pipeline
//! digest call summarize.readme --param owner=pallets --param repo=flask
//! digest batch --kind commits                # every repository in [repositories]
//! digest summaries list
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`protocol`] | JSON-RPC envelope types |
//! | [`error`] | Error kinds and wire codes |
//! | [`traits`] | `Tool` trait and registry |
//! | [`dispatcher`] | JSON-RPC server loop |
//! | [`relay`] | Pass-through between supervisor and dispatcher |
//! | [`correlate`] | Pending-call table keyed by request id |
//! | [`supervisor`] | Child process lifecycle |
//! | [`local`] | In-process debug host |
//! | [`system`] | Application facade |
//! | [`github`] | GitHub REST data source |
//! | [`model`] | Language model providers |
//! | [`summarizer`] | Prompting and persistence per summary kind |
//! | [`store`] | Flat-file summary store |
//! | [`server`] | HTTP facade |

pub mod config;
pub mod correlate;
pub mod dispatcher;
pub mod error;
pub mod github;
pub mod local;
pub mod model;
pub mod models;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod store;
pub mod summarizer;
pub mod supervisor;
pub mod system;
pub mod traits;
