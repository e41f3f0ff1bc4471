//! Registry of callers waiting for the executor to go idle.
//!
//! Each waiter is a oneshot receiver keyed by id. The pipeline's cleanup
//! resolves every pending waiter at once; a waiter whose own timeout fires
//! first removes its entry so it is never resolved twice.

use std::collections::HashMap;

use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub struct IdleWaiters {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<()>>,
}

impl IdleWaiters {
    /// Add a waiter; the receiver completes when [`IdleWaiters::resolve_all`] runs.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Drop a waiter without resolving it. Returns false if it was already resolved.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Resolve and remove every pending waiter; returns how many were still listening.
    pub fn resolve_all(&mut self) -> usize {
        self.pending
            .drain()
            .filter_map(|(_, tx)| tx.send(()).ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
