//! Outstanding-request table.
//!
//! Issues request ids and correlates responses with the caller waiting on
//! them. Each entry is resolved at most once: by a response, by a local
//! timeout (`forget`) or by the closure sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{RpcError, RpcResult};

type Outcome = RpcResult<Value>;

struct Slots {
    pending: HashMap<u64, oneshot::Sender<Outcome>>,
    /// Set by [`RequestRegistry::close`]; no registrations afterwards.
    closed: Option<String>,
}

pub(crate) struct RequestRegistry {
    next_id: AtomicU64,
    slots: Mutex<Slots>,
}

/// The receiving half of a registered request.
pub(crate) struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the outcome. A registry dropped without resolving counts as
    /// a closed connection.
    pub async fn wait(self) -> Outcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RpcError::ConnectionClosed("registry dropped".into())))
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Slots {
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh id and create its delivery slot.
    pub fn register(&self) -> RpcResult<PendingRequest> {
        let mut slots = self.slots();
        if let Some(reason) = &slots.closed {
            return Err(RpcError::ConnectionClosed(reason.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        slots.pending.insert(id, tx);
        Ok(PendingRequest { id, rx })
    }

    /// Deliver `outcome` to the request with `id`.
    ///
    /// Returns `false` if no such request is outstanding (never issued,
    /// already resolved, or forgotten after a timeout).
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(tx) = self.slots().pending.remove(&id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(id, "response arrived after caller stopped waiting");
        }
        true
    }

    /// Drop the entry for `id` without resolving it.
    pub fn forget(&self, id: u64) -> bool {
        self.slots().pending.remove(&id).is_some()
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn close(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut slots = self.slots();
            if slots.closed.is_none() {
                slots.closed = Some(reason.to_string());
            }
            slots.pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), reason, "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.slots().pending.len()
    }

    /// The reason given to [`Self::close`], once closed.
    pub fn closed_reason(&self) -> Option<String> {
        self.slots().closed.clone()
    }
}
