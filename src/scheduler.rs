//! Orders entities by an estimated page-depth and dispatches batches of them
//! to the producer pool under a shared per-window page-fetch cap.

use crate::model::Entity;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Approximate items returned per timeline page; used to convert a missing-post
/// count into a page-count estimate. 20 matches the typical page size
/// observed in the remote timeline's responses.
pub const AVG_PER_PAGE: u64 = 20;

/// Default per-window page-fetch budget.
pub const DEFAULT_CAP: u64 = 500;

/// Default producer concurrency bound, independent of `heap.size`; callers
/// additionally bound this by `min(PRODUCER_MAX_CONCURRENT, heap.size)`.
pub const PRODUCER_MAX_CONCURRENT: usize = 8;

/// Estimate the number of pages needed to catch an entity up to the remote
/// media count.
pub fn estimate_depth(local_media_count: i64, remote_media_count: i64) -> u64 {
    let mut depth = if local_media_count >= remote_media_count {
        1
    } else {
        let missing = (remote_media_count - local_media_count).max(0) as u64;
        missing.div_ceil(AVG_PER_PAGE)
    };
    if local_media_count == 0 {
        depth += 1;
    }
    depth.max(1)
}

/// One entity queued for a producer, carrying its estimated depth and the
/// heap tiebreaker: protected-and-followed accounts receive priority.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub entity: Entity,
    pub depth: u64,
    pub priority: bool,
}

impl PartialEq for ScheduleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.priority == other.priority
    }
}
impl Eq for ScheduleEntry {}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth.cmp(&other.depth).then(self.priority.cmp(&other.priority))
    }
}

/// Max-heap of pending entities, keyed on [`ScheduleEntry`]'s ordering.
pub type ScheduleHeap = BinaryHeap<ScheduleEntry>;

/// Drain `heap`, submitting batches whose summed depth fits under `cap`.
/// `submit` is invoked once per entity and run under a semaphore bounding
/// concurrency to `min(PRODUCER_MAX_CONCURRENT, heap.len())`; the loop waits
/// for each batch to finish before popping the next. A `submit` that returns
/// `Some(entry)` requeues that entity for a later batch (no client
/// available, `WouldBlock`, or cancellation mid-page).
pub async fn dispatch<F, Fut>(
    mut heap: ScheduleHeap,
    cap: u64,
    max_concurrent: usize,
    cancel: &CancellationToken,
    submit: F,
) where
    F: Fn(ScheduleEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<ScheduleEntry>> + Send + 'static,
{
    if heap.is_empty() {
        return;
    }

    let bound = max_concurrent.min(heap.len()).max(1);
    let semaphore = Arc::new(Semaphore::new(bound));
    let submit = Arc::new(submit);

    while !heap.is_empty() && !cancel.is_cancelled() {
        let mut batch = Vec::new();

        let top_alone_over_cap = heap.peek().map(|top| top.depth > cap).unwrap_or(false);
        if top_alone_over_cap {
            batch.push(heap.pop().expect("peeked above"));
        } else {
            let mut total = 0u64;
            while let Some(top) = heap.peek() {
                if total + top.depth > cap {
                    break;
                }
                let entry = heap.pop().expect("peeked above");
                total += entry.depth;
                batch.push(entry);
            }
        }

        if batch.is_empty() {
            break;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for entry in batch {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let submit = submit.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                submit(entry).await
            }));
        }
        for handle in handles {
            if let Ok(Some(requeued)) = handle.await {
                heap.push(requeued);
            }
        }
    }
}
