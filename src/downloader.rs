//! Drains the bounded media channel, writing each post's media assets to
//! disk under a unique, sanitized filename.

use crate::model::FailedItem;
use crate::producer::MediaEnvelope;
use crate::sanitize::{sanitize, unique_path};
use futures::FutureExt;
use reqwest::StatusCode;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc::Receiver, mpsc::Sender, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Default worker count: ten workers per available core, approximated with
/// the available-parallelism hint since these tasks are I/O-bound.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 10
}

/// Derive a file extension (including the leading dot) from a media URL's
/// path component, defaulting to `.jpg` when none is present.
fn extension_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .and_then(|last| last.rsplit_once('.').map(|(_, ext)| format!(".{ext}")))
        .unwrap_or_else(|| ".jpg".to_string())
}

/// Run the fixed downloader pool: `worker_count` tasks share `media_rx`
/// behind a lock, each draining envelopes until the channel closes or the
/// run is cancelled. `name_lock` serializes the unique-path probe-then-create
/// sequence across every worker with a process-wide mutex covering both the
/// probe and the create, to avoid a TOCTOU race between two workers
/// resolving the same stem.
///
/// A worker panic cancels `cancel`, reports the in-flight envelope as
/// failed, and the pool drains every envelope still queued in `media_rx`
/// into `fail_tx` before returning.
pub async fn run_pool(
    worker_count: usize,
    http: reqwest::Client,
    media_rx: Receiver<MediaEnvelope>,
    fail_tx: Sender<FailedItem>,
    cancel: CancellationToken,
) {
    let shared_rx = Arc::new(AsyncMutex::new(media_rx));
    let name_lock = Arc::new(AsyncMutex::new(()));
    let mut set = tokio::task::JoinSet::new();

    for _ in 0..worker_count.max(1) {
        let http = http.clone();
        let shared_rx = shared_rx.clone();
        let fail_tx = fail_tx.clone();
        let name_lock = name_lock.clone();
        let cancel = cancel.clone();
        set.spawn(async move { worker_loop(http, shared_rx, fail_tx, name_lock, cancel).await });
    }

    while set.join_next().await.is_some() {}

    if cancel.is_cancelled() {
        drain_to_failures(&shared_rx, &fail_tx).await;
    }
}

async fn worker_loop(
    http: reqwest::Client,
    shared_rx: Arc<AsyncMutex<Receiver<MediaEnvelope>>>,
    fail_tx: Sender<FailedItem>,
    name_lock: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let envelope = {
            let mut rx = shared_rx.lock().await;
            rx.recv().await
        };
        let Some(envelope) = envelope else { return };
        let in_flight = envelope.clone();

        let outcome =
            AssertUnwindSafe(download_envelope(&http, envelope, &fail_tx, &name_lock)).catch_unwind().await;

        if outcome.is_err() {
            error!(entity = in_flight.entity.subject_id, "downloader worker panicked, cancelling run");
            cancel.cancel();
            let failed =
                FailedItem { account_entity_id: in_flight.entity.id.unwrap_or_default(), post: in_flight.post };
            let _ = fail_tx.send(failed).await;
            return;
        }
    }
}

async fn drain_to_failures(shared_rx: &Arc<AsyncMutex<Receiver<MediaEnvelope>>>, fail_tx: &Sender<FailedItem>) {
    let mut rx = shared_rx.lock().await;
    while let Ok(envelope) = rx.try_recv() {
        let failed = FailedItem { account_entity_id: envelope.entity.id.unwrap_or_default(), post: envelope.post };
        let _ = fail_tx.send(failed).await;
    }
}

async fn download_envelope(
    http: &reqwest::Client,
    envelope: MediaEnvelope,
    fail_tx: &Sender<FailedItem>,
    name_lock: &Arc<AsyncMutex<()>>,
) {
    let base = sanitize(&envelope.post.text);
    let base = if base.trim().is_empty() { envelope.post.id.to_string() } else { base };

    for media_url in &envelope.post.media_urls {
        let ext = extension_from_url(media_url);
        match download_one(http, media_url, &envelope.entity.path(), &base, &ext, name_lock).await {
            Ok(path) => {
                if let Err(e) = set_mtime(&path, envelope.post.created_at) {
                    warn!(path = %path.display(), error = %e, "downloader: failed to set mtime");
                }
            }
            Err(true) => {
                let failed = FailedItem {
                    account_entity_id: envelope.entity.id.unwrap_or_default(),
                    post: envelope.post.clone(),
                };
                let _ = fail_tx.send(failed).await;
            }
            Err(false) => {}
        }
    }
}

/// Download one asset, returning the written path, `Err(true)` for a hard
/// (retry-worthy) failure, or `Err(false)` for a silently-skipped 404/403.
async fn download_one(
    http: &reqwest::Client,
    url: &str,
    entity_dir: &Path,
    base: &str,
    ext: &str,
    name_lock: &Arc<AsyncMutex<()>>,
) -> Result<std::path::PathBuf, bool> {
    let response = match http.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(url, error = %e, "downloader: request failed");
            return Err(true);
        }
    };

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
        return Err(false);
    }
    if !status.is_success() {
        warn!(url, %status, "downloader: unexpected status");
        return Err(true);
    }

    let bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            warn!(url, error = %e, "downloader: failed reading body");
            return Err(true);
        }
    };

    let dest = {
        let _guard = name_lock.lock().await;
        std::fs::create_dir_all(entity_dir).map_err(|_| true)?;
        let path = unique_path(entity_dir, base, ext).map_err(|_| true)?;
        std::fs::write(&path, &bytes).map_err(|_| true)?;
        path
    };

    Ok(dest)
}

/// Set `path`'s mtime to `created_at`.
pub fn set_mtime(path: &Path, created_at: chrono::NaiveDateTime) -> std::io::Result<()> {
    let secs = created_at.and_utc().timestamp();
    let system_time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64);
    std::fs::File::options().write(true).open(path)?.set_modified(system_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_defaults_to_jpg_without_path_extension() {
        assert_eq!(extension_from_url("https://pbs.twimg.com/media/abc"), ".jpg");
    }

    #[test]
    fn extension_is_derived_from_url_path() {
        assert_eq!(extension_from_url("https://pbs.twimg.com/media/abc.png:large"), ".png:large");
    }

    #[test]
    fn extension_handles_plain_mp4() {
        assert_eq!(extension_from_url("https://video.twimg.com/ext_tw_video/1/pu/vid/720x1280/x.mp4"), ".mp4");
    }

    #[test]
    fn default_worker_count_is_positive() {
        assert!(default_worker_count() >= 10);
    }
}
