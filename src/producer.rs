//! Pages one entity's media timeline and feeds discovered posts into the
//! bounded media channel consumed by the [`crate::downloader`] pool.

use crate::db::Db;
use crate::error::TransportError;
use crate::model::{Entity, MediaPost};
use crate::remote::pager::{PageBounds, TimelinePager};
use crate::remote::types::TimelineItem;
use crate::remote::ClientPool;
use crate::scheduler::ScheduleEntry;
use crate::ResilienceError;
use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// One discovered media-bearing post, paired with the entity it belongs to.
#[derive(Debug, Clone)]
pub struct MediaEnvelope {
    pub entity: Entity,
    pub post: MediaPost,
}

const MEDIA_TIMELINE_PATH: &str = "/i/api/graphql/UserMedia";

/// Run one scheduled entity to completion: select a client, page its
/// timeline, push discovered posts into `media_tx`, and persist progress.
/// Returns `Some(entry)` when the entity should be requeued for a later batch.
///
/// `fatal` is set (never cleared) when the single critical write this
/// function makes — `latest_media_timestamp`/`media_count` — fails. That
/// failure cancels the whole run rather than silently dropping progress,
/// since a later rerun would otherwise wrongly assume this page range was
/// already covered.
pub async fn run_entity(
    entry: ScheduleEntry,
    pool: &ClientPool,
    db: &Db,
    media_tx: &Sender<MediaEnvelope>,
    now: NaiveDateTime,
    cancel: &CancellationToken,
    fatal: &AtomicBool,
) -> Option<ScheduleEntry> {
    let entity = entry.entity.clone();

    let client = match pool.select(cancel, MEDIA_TIMELINE_PATH).await {
        Ok(client) => client,
        Err(_) => return Some(entry),
    };

    let latest = entity_latest_timestamp(db, &entity).await;
    let bounds = PageBounds { min: Some(latest), max: now };
    let url = format!("https://api.x.com{MEDIA_TIMELINE_PATH}?variables=entity-{}", entity.subject_id);
    let mut pager = TimelinePager::new(pool, &client, url, MEDIA_TIMELINE_PATH, bounds);

    let mut first_created_at: Option<NaiveDateTime> = None;
    let mut remote_media_count = entry_media_count(db, &entity).await;

    loop {
        let page = match pager.next_page(cancel).await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(ResilienceError::Inner(TransportError::Api(api))) if api.is_sticky() => {
                client.mark_sticky(api.code);
                return Some(entry);
            }
            Err(ResilienceError::Inner(TransportError::WouldBlock)) => return Some(entry),
            Err(ResilienceError::Inner(TransportError::Cancelled)) => return Some(entry),
            Err(e) => {
                warn!(entity = entity.subject_id, error = %e, "producer: dropping entity for this run");
                return None;
            }
        };

        for item in page {
            if cancel.is_cancelled() {
                return Some(entry);
            }
            if let TimelineItem::Post(post) = item {
                if first_created_at.is_none() {
                    first_created_at = Some(post.created_at);
                }
                remote_media_count += 1;
                if media_tx.send(MediaEnvelope { entity: entity.clone(), post }).await.is_err() {
                    return None;
                }
            }
        }
    }

    let persisted = match (entity.id, first_created_at) {
        (Some(id), Some(created_at)) => {
            db.update_account_entity_progress(id, created_at, remote_media_count).await
        }
        (Some(id), None) => {
            db.update_account_entity_progress(id, latest, remote_media_count).await
        }
        (None, _) => {
            debug!(entity = entity.subject_id, "producer: entity has no row id, skipping progress write");
            Ok(())
        }
    };

    if let Err(e) = persisted {
        error!(entity = entity.subject_id, error = %e, "fatal: failed to persist producer progress, cancelling run");
        fatal.store(true, Ordering::SeqCst);
        cancel.cancel();
    }

    None
}

async fn entity_latest_timestamp(db: &Db, entity: &Entity) -> NaiveDateTime {
    match entity.id {
        Some(id) => match db.get_account_entity(id).await {
            Ok(Some(row)) => {
                chrono::DateTime::from_timestamp(row.latest_media_timestamp, 0)
                    .map(|dt| dt.naive_utc())
                    .unwrap_or_default()
            }
            _ => NaiveDateTime::default(),
        },
        None => NaiveDateTime::default(),
    }
}

async fn entry_media_count(db: &Db, entity: &Entity) -> i64 {
    match entity.id {
        Some(id) => db.get_account_entity(id).await.ok().flatten().map(|row| row.media_count).unwrap_or(0),
        None => 0,
    }
}
