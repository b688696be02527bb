//! Deferred action queue.
//!
//! Buffers an action against a principal that is not yet addressable in the
//! host runtime (mid-handshake), retrying on a fixed cadence until the
//! principal appears or a ceiling elapses. Entries are processed strictly in
//! enqueue order; a not-yet-ready head stops the scan, which bounds scan cost
//! and preserves ordering for same-principal sequences.

use crate::runtime::{HostRuntime, HostTask};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const SCAN_START_DELAY: Duration = Duration::from_secs(1);
const SCAN_PERIOD: Duration = Duration::from_millis(100);
const DEFAULT_CEILING: Duration = Duration::from_secs(2);
const DEFAULT_CAPACITY: usize = 10_000;

struct DeferredAction {
    principal: Uuid,
    enqueued_at: Instant,
    action: HostTask,
}

/// Capacity-bounded FIFO of deferred actions.
pub struct DeferredActionQueue {
    actions: Mutex<VecDeque<DeferredAction>>,
    capacity: usize,
    ceiling: Duration,
}

impl Default for DeferredActionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_CEILING)
    }
}

impl DeferredActionQueue {
    pub fn new(capacity: usize, ceiling: Duration) -> Self {
        Self {
            actions: Mutex::new(VecDeque::new()),
            capacity,
            ceiling,
        }
    }

    /// Enqueue an action for a principal. Returns false (rejecting the action,
    /// not blocking) when the queue is full.
    pub fn enqueue(&self, principal: Uuid, action: HostTask) -> bool {
        let Ok(mut actions) = self.actions.lock() else {
            return false;
        };

        if actions.len() >= self.capacity {
            warn!(principal = %principal, "deferred action queue is full, rejecting action");
            return false;
        }

        actions.push_back(DeferredAction {
            principal,
            enqueued_at: Instant::now(),
            action,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.actions.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute every ready entry from the head of the queue. An entry is ready
    /// when its principal is addressable or it has waited past the ceiling.
    /// Actions run on the host context, never on the scheduler thread.
    pub fn run_ready(&self, runtime: &Arc<dyn HostRuntime>) {
        loop {
            let entry = {
                let Ok(mut actions) = self.actions.lock() else {
                    return;
                };

                let ready = match actions.front() {
                    Some(head) => {
                        runtime.is_addressable(&head.principal)
                            || head.enqueued_at.elapsed() >= self.ceiling
                    }
                    None => false,
                };

                if !ready {
                    return;
                }
                actions.pop_front()
            };

            if let Some(entry) = entry {
                debug!(principal = %entry.principal, "running deferred action");
                runtime.run_on_host_context(entry.action);
            }
        }
    }

    /// Spawn the periodic scan task. Abort the handle and call
    /// [`DeferredActionQueue::drain`] on shutdown.
    pub fn start(self: &Arc<Self>, runtime: Arc<dyn HostRuntime>) -> JoinHandle<()> {
        let queue = Arc::clone(self);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SCAN_START_DELAY;
            let mut tick = tokio::time::interval_at(start, SCAN_PERIOD);

            loop {
                tick.tick().await;
                queue.run_ready(&runtime);
            }
        })
    }

    /// Discard all pending entries without executing them.
    pub fn drain(&self) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.clear();
        }
    }
}
