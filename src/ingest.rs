// ============================================================================
// REMOTE EVENT INGESTOR — subscription → canvas filter → session channel
// ============================================================================

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::remote::{ChangeEvent, Scope, Subscription};

/// Events queued between the ingestor and the session task.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Owns the forwarding task (and through it the subscription).
///
/// Dropping the handle aborts the task, which drops the subscription and
/// releases it on the store.
#[derive(Debug)]
pub struct IngestorHandle {
    scope: Scope,
    task: Option<JoinHandle<u64>>,
}

impl IngestorHandle {
    /// Start forwarding events for `canvas_id` from `subscription` into `tx`.
    pub fn spawn(canvas_id: String, subscription: Subscription, tx: mpsc::Sender<ChangeEvent>) -> Self {
        let scope = subscription.scope().clone();
        let task = tokio::spawn(forward(canvas_id, subscription, tx));
        Self { scope, task: Some(task) }
    }

    /// Stop forwarding and wait until the subscription is released.
    ///
    /// Only this ingestor's own subscription goes away; other subscribers of
    /// the same scope on the store are untouched.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Resolves once the task, and the subscription it owns, are dropped
            let _ = task.await;
        }
        log::debug!("Ingestor for scope {} shut down", self.scope);
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for IngestorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Forwarding loop; returns the number of foreign-canvas events dropped.
async fn forward(canvas_id: String, mut subscription: Subscription, tx: mpsc::Sender<ChangeEvent>) -> u64 {
    let mut ignored = 0u64;
    while let Some(event) = subscription.next().await {
        if event.canvas_id != canvas_id {
            ignored += 1;
            continue;
        }
        if tx.send(event).await.is_err() {
            log::debug!("Session channel closed, stopping ingestor for {}", canvas_id);
            break;
        }
    }
    log::debug!("Ingestor for {} finished ({} foreign events ignored)", canvas_id, ignored);
    ignored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::remote::{MemoryStore, RemoteStore};

    #[tokio::test]
    async fn foreign_canvas_events_are_dropped() {
        let store = MemoryStore::with_blank_canvas("mine", 2, 2);
        store.add_blank_canvas("other", 2, 2);
        let subscription = store.subscribe_changes(Scope::All).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = IngestorHandle::spawn("mine".into(), subscription, tx);

        store.foreign_edit("other", 1, 1, Color::BLACK).unwrap();
        store.foreign_edit("mine", 2, 2, Color::BLACK).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!((event.canvas_id.as_str(), event.x, event.y), ("mine", 2, 2));
        assert!(rx.try_recv().is_err());

        handle.shutdown().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_keeps_other_subscribers() {
        let store = MemoryStore::with_blank_canvas("a", 1, 1);
        store.add_blank_canvas("b", 1, 1);
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = IngestorHandle::spawn("a".into(), store.subscribe_changes(Scope::All).await.unwrap(), tx_a);
        let b = IngestorHandle::spawn("b".into(), store.subscribe_changes(Scope::All).await.unwrap(), tx_b);
        assert_eq!(store.subscriber_count(), 2);

        a.shutdown().await;
        assert_eq!(store.subscriber_count(), 1);

        store.foreign_edit("b", 1, 1, Color::BLACK).unwrap();
        let event = rx_b.recv().await.unwrap();
        assert_eq!((event.canvas_id.as_str(), event.color), ("b", Color::BLACK));
        b.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_handle_releases_subscription() {
        let store = MemoryStore::with_blank_canvas("mine", 1, 1);
        let subscription = store.subscribe_changes(Scope::All).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let handle = IngestorHandle::spawn("mine".into(), subscription, tx);
        assert_eq!(store.subscriber_count(), 1);

        drop(handle);
        // Abort is processed on the next poll of the runtime
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(store.subscriber_count(), 0);
    }
}
