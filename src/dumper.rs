//! A durable, de-duplicating set of failed (entity-id, media-post) pairs.

use crate::db::Db;
use crate::model::{Entity, EntityKind, FailedItem, MediaPost};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DumperError {
    #[error("failed to read {path}: {source}")]
    Read { path: std::path::PathBuf, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: std::path::PathBuf, source: std::io::Error },
    #[error("failed to parse dump file {path}: {source}")]
    Parse { path: std::path::PathBuf, source: serde_json::Error },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// In-memory de-duplicating set of failures, keyed by account-entity id.
#[derive(Debug, Default)]
pub struct FailureDumper {
    data: HashMap<i64, Vec<MediaPost>>,
    seen: HashMap<i64, HashSet<u64>>,
    count: usize,
}

impl FailureDumper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push posts for `entity_id`, deduplicating by post id within that
    /// entity. Returns the number of posts actually added.
    pub fn push(&mut self, entity_id: i64, posts: impl IntoIterator<Item = MediaPost>) -> usize {
        let bucket = self.data.entry(entity_id).or_default();
        let seen = self.seen.entry(entity_id).or_default();

        let mut added = 0;
        for post in posts {
            if seen.insert(post.id) {
                bucket.push(post);
                added += 1;
            }
        }
        self.count += added;
        added
    }

    /// Load and re-push failures recorded in a prior run's dump file. A
    /// missing file is a no-op.
    pub fn load(&mut self, path: &Path) -> Result<(), DumperError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DumperError::Read { path: path.to_path_buf(), source: e }),
        };
        let loaded: HashMap<i64, Vec<MediaPost>> = serde_json::from_slice(&bytes)
            .map_err(|e| DumperError::Parse { path: path.to_path_buf(), source: e })?;
        for (entity_id, posts) in loaded {
            self.push(entity_id, posts);
        }
        Ok(())
    }

    /// Atomically overwrite `path` with the current contents as indented
    /// JSON. Does not merge with whatever is already on disk; callers that
    /// need a merge must [`FailureDumper::load`] first.
    pub fn dump(&self, path: &Path) -> Result<(), DumperError> {
        let json = serde_json::to_vec_pretty(&self.data)
            .map_err(|e| DumperError::Parse { path: path.to_path_buf(), source: e })?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| DumperError::Write { path: tmp_path.clone(), source: e })?;
        std::fs::rename(&tmp_path, path).map_err(|e| DumperError::Write { path: path.to_path_buf(), source: e })?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.seen.clear();
        self.count = 0;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Push a [`FailedItem`] produced by the downloader pool.
    pub fn push_failed(&mut self, failed: FailedItem) {
        self.push(failed.account_entity_id, [failed.post]);
    }

    /// Resolve every bucket against the account-entity table, building
    /// `(post, entity)` pairs for a retry pass through the downloader pool.
    pub async fn total(&self, db: &Db) -> Result<Vec<(MediaPost, Entity)>, DumperError> {
        let mut results = Vec::with_capacity(self.count);
        for (entity_id, posts) in &self.data {
            let Some(row) = db.get_account_entity(*entity_id).await? else { continue };
            let entity = Entity {
                kind: EntityKind::Account,
                id: Some(row.id),
                subject_id: row.account_id,
                parent_dir: row.parent_dir,
                name: row.name,
            };
            for post in posts {
                results.push((post.clone(), entity.clone()));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tempfile::tempdir;

    fn post(id: u64) -> MediaPost {
        MediaPost { id, created_at: NaiveDateTime::default(), text: String::new(), media_urls: vec![] }
    }

    #[test]
    fn push_dedups_by_post_id_within_entity() {
        let mut dumper = FailureDumper::new();
        assert_eq!(dumper.push(1, [post(10), post(11)]), 2);
        assert_eq!(dumper.push(1, [post(10), post(12)]), 1);
        assert_eq!(dumper.count(), 3);
    }

    #[test]
    fn same_post_id_in_different_entities_both_count() {
        let mut dumper = FailureDumper::new();
        dumper.push(1, [post(10)]);
        dumper.push(2, [post(10)]);
        assert_eq!(dumper.count(), 2);
    }

    #[test]
    fn load_is_noop_on_missing_file() {
        let mut dumper = FailureDumper::new();
        let dir = tempdir().unwrap();
        dumper.load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(dumper.count(), 0);
    }

    #[test]
    fn dump_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failures.json");

        let mut dumper = FailureDumper::new();
        dumper.push(7, [post(1), post(2)]);
        dumper.dump(&path).unwrap();

        let mut reloaded = FailureDumper::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.count(), 2);
    }

    #[test]
    fn clear_resets_everything() {
        let mut dumper = FailureDumper::new();
        dumper.push(1, [post(1)]);
        dumper.clear();
        assert_eq!(dumper.count(), 0);
        assert_eq!(dumper.push(1, [post(1)]), 1);
    }

    #[test]
    fn dump_does_not_merge_with_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failures.json");

        let mut first = FailureDumper::new();
        first.push(1, [post(1)]);
        first.dump(&path).unwrap();

        let mut second = FailureDumper::new();
        second.push(2, [post(2)]);
        second.dump(&path).unwrap();

        let mut reloaded = FailureDumper::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.count(), 1);
    }
}
