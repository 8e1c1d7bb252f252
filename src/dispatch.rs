// ============================================================================
// BULK DISPATCHER — chunked, paced, per-item isolated batch updates
// ============================================================================

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::grid::PixelId;
use crate::remote::{PixelMutation, RemoteStore};

/// Chunking and pacing for bulk operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub chunk_size: usize,
    /// Pause between consecutive chunks (not after the last one).
    pub inter_chunk_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { chunk_size: 10, inter_chunk_delay: Duration::from_millis(100) }
    }
}

impl DispatchConfig {
    pub fn new(chunk_size: usize, inter_chunk_delay: Duration) -> Self {
        Self { chunk_size, inter_chunk_delay }
    }

    /// Chunk size actually used; zero is treated as one.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

/// Aggregate outcome of one bulk run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    /// Chunks actually issued.
    pub chunks: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Never issued because the run was cancelled.
    pub skipped: usize,
    pub failures: Vec<(PixelId, SyncError)>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Issues mutations chunk by chunk against a store.
#[derive(Clone, Copy, Debug, Default)]
pub struct BulkDispatcher {
    config: DispatchConfig,
}

impl BulkDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    /// Run the whole batch. Mutations inside a chunk are issued concurrently;
    /// chunk N+1 starts only after every item of chunk N has settled.
    ///
    /// Failed items are counted and the run continues. Cancellation is
    /// observed before each chunk and during the pacing delay.
    pub async fn dispatch<S: RemoteStore>(
        &self,
        store: &S,
        mutations: Vec<PixelMutation>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let chunk_size = self.config.effective_chunk_size();
        let total = mutations.len();
        let chunk_count = total.div_ceil(chunk_size);
        let mut report = DispatchReport::default();

        for (index, chunk) in mutations.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcomes = join_all(chunk.iter().map(|m| store.update_pixel(m))).await;
            report.chunks += 1;
            for (mutation, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        log::warn!("Bulk update of {} at ({}, {}) failed: {}", mutation.id, mutation.x, mutation.y, e);
                        report.failed += 1;
                        report.failures.push((mutation.id.clone(), e));
                    }
                }
            }
            log::debug!("Chunk {}/{} settled", index + 1, chunk_count);

            let is_last = index + 1 == chunk_count;
            if !is_last && !self.config.inter_chunk_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.inter_chunk_delay) => {}
                }
            }
        }

        report.skipped = total - report.succeeded - report.failed;
        if report.cancelled {
            log::info!("Bulk run cancelled: {} issued, {} skipped", report.succeeded + report.failed, report.skipped);
        } else {
            log::info!(
                "Bulk run finished: {} chunks, {} ok, {} failed",
                report.chunks, report.succeeded, report.failed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::remote::MemoryStore;
    use rstest::rstest;
    use tokio::time::Instant;

    fn blank(n: u32) -> (MemoryStore, Vec<PixelMutation>) {
        let store = MemoryStore::with_blank_canvas("c", n, 1);
        let mutations = (1..=n)
            .map(|x| PixelMutation {
                id: store.pixel_id_at("c", x, 1).unwrap(),
                x,
                y: 1,
                color: Color::BLACK,
                version: None,
            })
            .collect();
        (store, mutations)
    }

    #[rstest]
    #[case(25, 10, 3)]
    #[case(10, 10, 1)]
    #[case(3, 0, 3)]
    #[case(0, 10, 0)]
    #[tokio::test(start_paused = true)]
    async fn chunk_count_and_pacing(#[case] n: u32, #[case] chunk_size: usize, #[case] chunks: usize) {
        let (store, mutations) = blank(n);
        let dispatcher = BulkDispatcher::new(DispatchConfig::new(chunk_size, Duration::from_millis(100)));
        let start = Instant::now();
        let report = dispatcher.dispatch(&store, mutations, &CancellationToken::new()).await;

        assert_eq!(report.chunks, chunks);
        assert_eq!(report.succeeded, n as usize);
        assert!(report.is_clean());
        let pauses = chunks.saturating_sub(1) as u64;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100 * pauses), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(100 * pauses + 50), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_preserve_order() {
        let (store, mutations) = blank(7);
        let expected: Vec<u32> = mutations.iter().map(|m| m.x).collect();
        BulkDispatcher::new(DispatchConfig::new(3, Duration::from_millis(5)))
            .dispatch(&store, mutations, &CancellationToken::new())
            .await;
        let applied: Vec<u32> = store.applied_updates().iter().map(|m| m.x).collect();
        assert_eq!(applied, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated() {
        let (store, mutations) = blank(4);
        let bad = mutations[1].id.clone();
        store.fail_updates_for(bad.clone());
        let report = BulkDispatcher::new(DispatchConfig::new(10, Duration::ZERO))
            .dispatch(&store, mutations, &CancellationToken::new())
            .await;
        assert_eq!((report.succeeded, report.failed, report.skipped), (3, 1, 0));
        assert_eq!(report.failures[0].0, bad);
        assert_eq!(store.color_at("c", 1, 1), Some(Color::BLACK));
        assert_eq!(store.color_at("c", 2, 1), Some(Color::WHITE));
        assert_eq!(store.color_at("c", 3, 1), Some(Color::BLACK));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_delay_skips_remainder() {
        let (store, mutations) = blank(30);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });
        let report = BulkDispatcher::new(DispatchConfig::new(10, Duration::from_millis(100)))
            .dispatch(&store, mutations, &cancel)
            .await;
        assert!(report.cancelled);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.succeeded, 20);
        assert_eq!(report.skipped, 10);
        assert_eq!(store.applied_updates().len(), 20);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_nothing() {
        let (store, mutations) = blank(5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = BulkDispatcher::default().dispatch(&store, mutations, &cancel).await;
        assert_eq!(report.chunks, 0);
        assert_eq!(report.skipped, 5);
        assert!(store.applied_updates().is_empty());
    }
}
