//! In-process dispatch queue of instance ids

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Unbounded FIFO shared by producers (admission, scheduler) and worker loops
///
/// Enqueue never blocks. Consumers take turns on the receiving end, so each
/// id is delivered to exactly one worker.
#[derive(Debug)]
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<Uuid>,
    receiver: Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn enqueue(&self, instance_id: Uuid) {
        // The receiver lives as long as the queue, so this only fails after drop
        if self.sender.send(instance_id).is_err() {
            warn!(%instance_id, "dispatch queue closed, id dropped");
        }
    }

    /// Wait for the next id; `None` once `cancel` fires
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<Uuid> {
        let mut receiver = tokio::select! {
            guard = self.receiver.lock() => guard,
            _ = cancel.cancelled() => return None,
        };
        tokio::select! {
            id = receiver.recv() => id,
            _ = cancel.cancelled() => None,
        }
    }

    /// Take an id if one is ready, without waiting
    pub fn try_dequeue(&self) -> Option<Uuid> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}
