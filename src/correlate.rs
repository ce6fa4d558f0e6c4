//! Pending-call table that matches response lines to waiting callers.
//!
//! Every outgoing request registers its id here and receives a one-shot
//! receiver. The task draining the peer's output feeds each line to
//! [`Correlator::resolve_line`], which completes the waiter registered under
//! the line's id. Lines whose id is not pending (late answers to timed-out
//! calls, stray output) are reported back as [`LineOutcome::Unmatched`] and
//! never reach another caller.
//!
//! The table lock is a `std::sync::Mutex` and is never held across an
//! `.await`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::CallError;
use crate::protocol::{RequestId, RpcResponse};

pub type Reply = Result<RpcResponse, CallError>;

/// Why a correlator stopped accepting calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closed {
    /// The owner shut the session down.
    Stopped,
    /// A peer process exited or its output stream closed.
    Died { process: String, status: String },
}

impl Closed {
    pub fn error(&self) -> CallError {
        match self {
            Closed::Stopped => CallError::NotRunning,
            Closed::Died { process, status } => CallError::process_died(process, status.clone()),
        }
    }
}

/// What [`Correlator::resolve_line`] did with a line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// A pending caller was completed.
    Delivered(RequestId),
    /// The line carries an id nobody is waiting for.
    Unmatched(RequestId),
    /// The line is not a JSON object with a usable id.
    NotAResponse,
}

#[derive(Default)]
struct Table {
    pending: HashMap<RequestId, oneshot::Sender<Reply>>,
    closed: Option<Closed>,
}

#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock leaves the map itself consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for `id`.
    ///
    /// Fails with `InvalidRequest` if the id is already in flight, or with
    /// the close reason once the correlator has been closed.
    pub fn register(&self, id: &RequestId) -> Result<oneshot::Receiver<Reply>, CallError> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(reason.error());
        }
        if table.pending.contains_key(id) {
            return Err(CallError::InvalidRequest(format!(
                "request id {} is already in flight",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.pending.insert(id.clone(), tx);
        Ok(rx)
    }

    /// Forget a waiter. A response arriving later is reported as unmatched.
    pub fn cancel(&self, id: &RequestId) {
        self.lock().pending.remove(id);
    }

    /// Route one output line to the caller waiting for its id.
    ///
    /// A line whose id is pending but which is not a well-formed response
    /// (it has neither or both of `result` and `error`) completes that caller
    /// with `InvalidResponse` carrying the raw text.
    pub fn resolve_line(&self, line: &str) -> LineOutcome {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            return LineOutcome::NotAResponse;
        };
        let Some(id) = obj
            .get("id")
            .and_then(|raw| serde_json::from_value::<RequestId>(raw.clone()).ok())
        else {
            return LineOutcome::NotAResponse;
        };

        let Some(tx) = self.lock().pending.remove(&id) else {
            return LineOutcome::Unmatched(id);
        };

        let well_formed = obj.contains_key("result") != obj.contains_key("error");
        let reply = match serde_json::from_value::<RpcResponse>(Value::Object(obj)) {
            Ok(resp) if well_formed && resp.is_well_formed() => Ok(resp),
            _ => Err(CallError::InvalidResponse {
                raw: line.to_string(),
            }),
        };

        // The receiver is gone if the caller timed out between our removal
        // and this send; treat that the same as a late line.
        match tx.send(reply) {
            Ok(()) => LineOutcome::Delivered(id),
            Err(_) => LineOutcome::Unmatched(id),
        }
    }

    /// Fail every pending call and refuse new registrations.
    ///
    /// The first close reason wins; later calls only drain the table.
    pub fn close(&self, reason: Closed) {
        let drained: Vec<_> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason);
            }
            table.pending.drain().collect()
        };
        let reason = self.closed().unwrap_or(Closed::Stopped);
        for (_, tx) in drained {
            let _ = tx.send(Err(reason.error()));
        }
    }

    pub fn closed(&self) -> Option<Closed> {
        self.lock().closed.clone()
    }

    /// Number of calls currently waiting.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await a registered reply for at most `timeout`.
    ///
    /// On expiry the id is unregistered, so the eventual response is
    /// discarded instead of being attributed to a later call.
    pub async fn wait(
        &self,
        id: &RequestId,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Reply {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: the table was torn down.
            Ok(Err(_)) => Err(self
                .closed()
                .map(|reason| reason.error())
                .unwrap_or(CallError::NotRunning)),
            Err(_) => {
                self.cancel(id);
                Err(CallError::Timeout {
                    id: id.clone(),
                    after: timeout,
                })
            }
        }
    }
}
