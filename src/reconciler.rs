//! Keeps a filesystem directory and a database row in sync with a remote
//! display name, and manages the lifetime of list-membership symlinks.

use crate::db::Db;
use crate::model::{Entity, EntityKind};
use crate::sanitize::sanitize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("filesystem error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

fn io_err(path: &Path, source: std::io::Error) -> ReconcileError {
    ReconcileError::Io { path: path.to_path_buf(), source }
}

/// An account's on-disk title: display name with its handle in parens,
/// e.g. `Cool Name(handle)`, sanitized the same way as any other entity name.
pub fn account_title(display_name: &str, handle: &str) -> String {
    sanitize(&format!("{display_name}({handle})"))
}

/// Reconcile an account under `parent_dir` against its `display_name` and
/// `handle`, creating or renaming the row and directory as needed. The
/// expected on-disk name is `display_name(handle)`.
pub async fn reconcile_account(
    db: &Db,
    account_id: i64,
    parent_dir: &Path,
    display_name: &str,
    handle: &str,
) -> Result<Entity, ReconcileError> {
    let expected = account_title(display_name, handle);
    match db.locate_account_entity(account_id, parent_dir).await? {
        None => {
            let dir = parent_dir.join(&expected);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            let id = db.create_account_entity(account_id, &expected, parent_dir).await?;
            Ok(Entity {
                kind: EntityKind::Account,
                id: Some(id),
                subject_id: account_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
        Some(row) if row.name == expected => {
            let dir = parent_dir.join(&expected);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            Ok(Entity {
                kind: EntityKind::Account,
                id: Some(row.id),
                subject_id: account_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
        Some(row) => {
            rename_or_create(parent_dir, &row.name, &expected)?;
            db.rename_account_entity(row.id, &expected).await?;
            Ok(Entity {
                kind: EntityKind::Account,
                id: Some(row.id),
                subject_id: account_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
    }
}

/// Reconcile a list under `parent_dir` against its `name`, mirroring
/// [`reconcile_account`]'s protocol for the `lst_entities` table.
pub async fn reconcile_list(
    db: &Db,
    list_id: i64,
    parent_dir: &Path,
    remote_name: &str,
) -> Result<Entity, ReconcileError> {
    let expected = sanitize(remote_name);
    match db.locate_list_entity(list_id, parent_dir).await? {
        None => {
            let dir = parent_dir.join(&expected);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            let id = db.create_list_entity(list_id, &expected, parent_dir).await?;
            Ok(Entity {
                kind: EntityKind::List,
                id: Some(id),
                subject_id: list_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
        Some(row) if row.name == expected => {
            let dir = parent_dir.join(&expected);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            Ok(Entity {
                kind: EntityKind::List,
                id: Some(row.id),
                subject_id: list_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
        Some(row) => {
            rename_or_create(parent_dir, &row.name, &expected)?;
            db.rename_list_entity(row.id, &expected).await?;
            Ok(Entity {
                kind: EntityKind::List,
                id: Some(row.id),
                subject_id: list_id,
                parent_dir: parent_dir.to_path_buf(),
                name: expected,
            })
        }
    }
}

/// `rename(parent/old, parent/new)`, falling back to `mkdir parent/new` if
/// the source no longer exists.
fn rename_or_create(parent_dir: &Path, old_name: &str, new_name: &str) -> Result<(), ReconcileError> {
    let old_path = parent_dir.join(old_name);
    let new_path = parent_dir.join(new_name);
    match std::fs::rename(&old_path, &new_path) {
        Ok(()) => Ok(()),
        Err(_) => std::fs::create_dir_all(&new_path).map_err(|e| io_err(&new_path, e)),
    }
}

/// Establish or update the symlink backing an (account, list-entity)
/// membership.
pub async fn reconcile_link(
    db: &Db,
    account_id: i64,
    parent_list_entity_id: i64,
    list_entity_dir: &Path,
    account_dir_name: &str,
) -> Result<(), ReconcileError> {
    match db.locate_link(account_id, parent_list_entity_id).await? {
        None => {
            create_symlink(list_entity_dir, account_dir_name, account_dir_name)?;
            db.create_link(account_id, parent_list_entity_id, account_dir_name).await?;
        }
        Some(row) if row.name == account_dir_name => {
            create_symlink(list_entity_dir, account_dir_name, &row.name)?;
        }
        Some(row) => {
            let old_link = list_entity_dir.join(&row.name);
            let _ = std::fs::remove_file(&old_link);
            create_symlink(list_entity_dir, account_dir_name, account_dir_name)?;
            db.update_link_name(row.id, account_dir_name).await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(list_entity_dir: &Path, target_name: &str, link_name: &str) -> Result<(), ReconcileError> {
    let target = Path::new("..").join(target_name);
    let link = list_entity_dir.join(link_name);
    match std::os::unix::fs::symlink(&target, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(io_err(&link, e)),
    }
}

#[cfg(not(unix))]
fn create_symlink(_list_entity_dir: &Path, _target_name: &str, _link_name: &str) -> Result<(), ReconcileError> {
    Ok(())
}

/// Remove a link row and best-effort unlink its backing symlink. A link's
/// lifetime is tied to the existence of its row.
pub async fn remove_link(
    db: &Db,
    link_id: i64,
    list_entity_dir: &Path,
    link_name: &str,
) -> Result<(), ReconcileError> {
    db.delete_link(link_id).await?;
    let _ = std::fs::remove_file(list_entity_dir.join(link_name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Account;
    use tempfile::tempdir;

    async fn seed_account(db: &Db, id: i64) {
        db.upsert_account(&Account {
            id,
            handle: "h".into(),
            display_name: "Display".into(),
            protected: false,
            friends_count: 0,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn new_account_creates_row_and_directory() {
        let db = Db::connect_in_memory().await.unwrap();
        seed_account(&db, 1).await;
        let parent = tempdir().unwrap();

        let entity = reconcile_account(&db, 1, parent.path(), "Cool Name", "handle").await.unwrap();
        assert_eq!(entity.name, "Cool Name(handle)");
        assert!(parent.path().join("Cool Name(handle)").is_dir());
    }

    #[tokio::test]
    async fn unchanged_name_is_idempotent() {
        let db = Db::connect_in_memory().await.unwrap();
        seed_account(&db, 1).await;
        let parent = tempdir().unwrap();

        let first = reconcile_account(&db, 1, parent.path(), "Name", "h").await.unwrap();
        let second = reconcile_account(&db, 1, parent.path(), "Name", "h").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(parent.path().join("Name(h)").is_dir());
    }

    #[tokio::test]
    async fn changed_name_renames_directory_and_row() {
        let db = Db::connect_in_memory().await.unwrap();
        seed_account(&db, 1).await;
        let parent = tempdir().unwrap();

        reconcile_account(&db, 1, parent.path(), "Old Name", "h").await.unwrap();
        let renamed = reconcile_account(&db, 1, parent.path(), "New Name", "h").await.unwrap();

        assert_eq!(renamed.name, "New Name(h)");
        assert!(parent.path().join("New Name(h)").is_dir());
        assert!(!parent.path().join("Old Name(h)").exists());
    }

    #[tokio::test]
    async fn rename_falls_back_to_mkdir_when_source_missing() {
        let db = Db::connect_in_memory().await.unwrap();
        seed_account(&db, 1).await;
        let parent = tempdir().unwrap();

        reconcile_account(&db, 1, parent.path(), "Old Name", "h").await.unwrap();
        std::fs::remove_dir(parent.path().join("Old Name(h)")).unwrap();

        let renamed = reconcile_account(&db, 1, parent.path(), "New Name", "h").await.unwrap();
        assert!(parent.path().join("New Name(h)").is_dir());
        assert_eq!(renamed.name, "New Name(h)");
    }
}
