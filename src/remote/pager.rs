//! Timeline Pager: cursor-paginated iteration over a heterogeneous entry
//! stream, with time-range pruning.

use crate::error::TransportError;
use crate::remote::client::ClientIdentity;
use crate::remote::types::{classify_item, flatten_page, TimelineItem};
use crate::remote::ClientPool;
use crate::ResilienceError;
use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;

/// The inclusive-ish `[min, max]` created-at window paged items are pruned
/// against. `min == None` means "page until empty", matching a zero-value
/// `min` bound.
#[derive(Debug, Clone, Copy)]
pub struct PageBounds {
    pub min: Option<NaiveDateTime>,
    pub max: NaiveDateTime,
}

/// Walks one cursor-paginated endpoint, yielding typed items in pages while
/// applying the time-range pruning rule and stopping on an empty page.
pub struct TimelinePager<'a> {
    pool: &'a ClientPool,
    client: &'a ClientIdentity,
    base_url: String,
    path: String,
    bounds: PageBounds,
    cursor: Option<String>,
    first_page: bool,
    done: bool,
}

impl<'a> TimelinePager<'a> {
    pub fn new(
        pool: &'a ClientPool,
        client: &'a ClientIdentity,
        base_url: impl Into<String>,
        path: impl Into<String>,
        bounds: PageBounds,
    ) -> Self {
        Self {
            pool,
            client,
            base_url: base_url.into(),
            path: path.into(),
            bounds,
            cursor: None,
            first_page: true,
            done: false,
        }
    }

    fn request_url(&self) -> String {
        match &self.cursor {
            Some(cursor) => format!("{}?cursor={}", self.base_url, cursor),
            None => self.base_url.clone(),
        }
    }

    /// Fetch and return the next pruned page of items, or `None` once paging
    /// is exhausted (empty page, or the tail boundary was crossed).
    pub async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<TimelineItem>>, ResilienceError<TransportError>> {
        if self.done {
            return Ok(None);
        }

        let url = self.request_url();
        let (body, _headers) = self.pool.get(cancel, self.client, &url, &self.path).await?;

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        let instructions = parsed
            .pointer("/data/user/result/timeline/timeline/instructions")
            .or_else(|| parsed.pointer("/data/threaded_conversation_with_injections_v2/instructions"))
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));

        let (item_contents, next_cursor) = flatten_page(&instructions);

        if item_contents.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let raw: Vec<TimelineItem> = item_contents.iter().map(classify_item).collect();
        let (items, hit_tail) = prune_page(raw, self.bounds, self.first_page);

        self.first_page = false;
        self.cursor = next_cursor;

        if hit_tail || self.cursor.is_none() {
            self.done = true;
        }

        Ok(Some(items))
    }
}

/// Apply the time-range pruning rule to one already-classified page: on the
/// first page, discard items with `created_at >= max` (trim the head) and
/// keep paging; on any page, stop at the first item with `created_at <= min`
/// (cut the tail there, discarding it and everything after). Returns the
/// pruned items and whether the tail boundary was hit.
fn prune_page(raw: Vec<TimelineItem>, bounds: PageBounds, first_page: bool) -> (Vec<TimelineItem>, bool) {
    let mut items = Vec::with_capacity(raw.len());
    let mut hit_tail = false;

    for item in raw {
        if let TimelineItem::Post(post) = &item {
            if first_page && post.created_at >= bounds.max {
                continue;
            }
            if let Some(min) = bounds.min {
                if post.created_at <= min {
                    hit_tail = true;
                    break;
                }
            }
        }
        items.push(item);
    }

    (items, hit_tail)
}
