//! Serialized execution context for caller-facing callbacks.
//!
//! The caller supplies a [`CallQueue`]; every notification, signaling
//! send and completion the session produces is dispatched onto it in the
//! order the session produced them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// A unit of work dispatched onto a queue.
pub type QueueTask = Box<dyn FnOnce() + Send + 'static>;

/// Serialized execution context supplied by the caller.
pub trait CallQueue: Send + Sync + 'static {
    /// Run `task` on the queue after everything dispatched before it.
    fn dispatch(&self, task: QueueTask);

    /// Whether the calling code is currently running on this queue.
    fn is_current(&self) -> bool;
}

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// A [`CallQueue`] backed by a single tokio task.
///
/// Tasks run one at a time in dispatch order. Dropping every handle to the
/// queue lets the worker drain what is already queued and exit.
#[derive(Clone)]
pub struct SerialQueue {
    id: u64,
    tx: mpsc::UnboundedSender<QueueTask>,
}

impl SerialQueue {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn() -> Arc<Self> {
        Self::spawn_on(&tokio::runtime::Handle::current())
    }

    /// Spawn the worker on `handle`.
    #[must_use]
    pub fn spawn_on(handle: &tokio::runtime::Handle) -> Arc<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueTask>();

        handle.spawn(CURRENT_QUEUE.scope(id, async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            tracing::trace!("Serial queue {} drained", id);
        }));

        Arc::new(Self { id, tx })
    }
}

impl CallQueue for SerialQueue {
    fn dispatch(&self, task: QueueTask) {
        if self.tx.send(task).is_err() {
            tracing::debug!("Serial queue {} closed, task dropped", self.id);
        }
    }

    fn is_current(&self) -> bool {
        CURRENT_QUEUE.try_with(|id| *id == self.id).unwrap_or(false)
    }
}
