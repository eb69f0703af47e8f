/// Commit sink
///
/// After each forward window commits, the ingester hands a summary to the
/// sink. The sink belongs to the API layer; from the core's side it is
/// best-effort only: a slow or dead consumer drops notifications, never
/// commits.

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::CommittedWindow;

/// The outbound notification seam. Implementations must not block.
pub trait CommitSink: Send + Sync {
    fn on_committed(&self, window: CommittedWindow);
}

/// Bounded in-process queue over a broadcast channel. Consumers subscribe;
/// with no consumer (or a lagging one) sends are dropped silently, which is
/// exactly the contract.
pub struct QueueSink {
    tx: broadcast::Sender<CommittedWindow>,
}

impl QueueSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommittedWindow> {
        self.tx.subscribe()
    }
}

impl CommitSink for QueueSink {
    fn on_committed(&self, window: CommittedWindow) {
        debug!(from = window.from_height, to = window.to_height, "broadcasting committed window");
        let _ = self.tx.send(window);
    }
}

/// Sink that ignores everything, for deployments without an API layer.
pub struct NullSink;

impl CommitSink for NullSink {
    fn on_committed(&self, _window: CommittedWindow) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(from: u64, to: u64) -> CommittedWindow {
        CommittedWindow {
            from_height: from,
            to_height: to,
            blocks: Vec::new(),
            transactions: Vec::new(),
            token_transfers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_windows() {
        let sink = QueueSink::new(16);
        let mut rx = sink.subscribe();
        sink.on_committed(window(1, 5));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.from_height, 1);
        assert_eq!(received.to_height, 5);
    }

    #[test]
    fn test_send_without_subscribers_does_not_panic() {
        let sink = QueueSink::new(16);
        sink.on_committed(window(1, 1));
    }
}
