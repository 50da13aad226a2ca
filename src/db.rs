//! Persistence layer.
//!
//! A single `sqlx::SqlitePool` with WAL journaling and an unbounded busy
//! timeout, so many concurrent writers queue instead of failing outright.
//! The schema is created idempotently at connect time; there is no external
//! migration framework since the schema is small and stable.

use crate::model::{Account, AccountEntity, HandleHistory, Link, List, ListEntity};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER NOT NULL,
    screen_name VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    protected BOOLEAN NOT NULL,
    friends_count INTEGER NOT NULL,
    PRIMARY KEY (id),
    UNIQUE (screen_name)
);

CREATE TABLE IF NOT EXISTS user_previous_names (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid INTEGER NOT NULL,
    screen_name VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    record_date DATE NOT NULL,
    FOREIGN KEY(uid) REFERENCES users (id)
);

CREATE TABLE IF NOT EXISTS lsts (
    id INTEGER NOT NULL,
    name VARCHAR NOT NULL,
    owner_uid INTEGER NOT NULL,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS lst_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lst_id INTEGER NOT NULL,
    name VARCHAR NOT NULL,
    parent_dir VARCHAR NOT NULL COLLATE NOCASE,
    UNIQUE (lst_id, parent_dir),
    FOREIGN KEY(lst_id) REFERENCES lsts (id)
);

CREATE TABLE IF NOT EXISTS user_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name VARCHAR NOT NULL,
    latest_release_time DATETIME,
    parent_dir VARCHAR COLLATE NOCASE,
    media_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (user_id, parent_dir),
    FOREIGN KEY(user_id) REFERENCES users (id)
);

CREATE TABLE IF NOT EXISTS user_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name VARCHAR NOT NULL,
    parent_lst_entity_id INTEGER NOT NULL,
    UNIQUE (user_id, parent_lst_entity_id),
    FOREIGN KEY(user_id) REFERENCES users (id),
    FOREIGN KEY(parent_lst_entity_id) REFERENCES lst_entities (id)
);
"#;

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if absent) the sqlite store at `path`, enabling WAL
    /// journaling and an unbounded busy timeout.
    pub async fn connect(path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Io(e))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(u32::MAX as u64));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the underlying pool so every subsequent query fails. Used by
    /// tests that need to exercise the "critical write fails" path without a
    /// real disk/lock error.
    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- accounts ---------------------------------------------------------

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query("SELECT id, screen_name, name, protected, friends_count FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_account))
    }

    pub async fn get_account_by_handle(&self, handle: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, screen_name, name, protected, friends_count FROM users WHERE screen_name = ?",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_account))
    }

    /// Insert a new account row or update an existing one, recording a
    /// `user_previous_names` row when the handle or display name changed.
    pub async fn upsert_account(&self, account: &Account) -> Result<(), sqlx::Error> {
        let existing = self.get_account(account.id).await?;
        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO users(id, screen_name, name, protected, friends_count) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(account.id)
                .bind(&account.handle)
                .bind(&account.display_name)
                .bind(account.protected)
                .bind(account.friends_count)
                .execute(&self.pool)
                .await?;
            }
            Some(prior) => {
                if prior.handle != account.handle || prior.display_name != account.display_name {
                    self.insert_handle_history(account.id, &prior.handle, &prior.display_name, today())
                        .await?;
                }
                sqlx::query(
                    "UPDATE users SET screen_name = ?, name = ?, protected = ?, friends_count = ? WHERE id = ?",
                )
                .bind(&account.handle)
                .bind(&account.display_name)
                .bind(account.protected)
                .bind(account.friends_count)
                .bind(account.id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn insert_handle_history(
        &self,
        account_id: i64,
        prior_handle: &str,
        prior_name: &str,
        recorded_on: NaiveDate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_previous_names(uid, screen_name, name, record_date) VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(prior_handle)
        .bind(prior_name)
        .bind(recorded_on)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn handle_history_for(&self, account_id: i64) -> Result<Vec<HandleHistory>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, uid, screen_name, name, record_date FROM user_previous_names WHERE uid = ? ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| HandleHistory {
                id: r.get("id"),
                account_id: r.get("uid"),
                prior_handle: r.get("screen_name"),
                prior_name: r.get("name"),
                recorded_on: r.get("record_date"),
            })
            .collect())
    }

    // --- lists --------------------------------------------------------------

    pub async fn upsert_list(&self, list: &List) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO lsts(id, name, owner_uid) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, owner_uid = excluded.owner_uid",
        )
        .bind(list.id)
        .bind(&list.name)
        .bind(list.owner_account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- account entities -----------------------------------------------------

    pub async fn locate_account_entity(
        &self,
        account_id: i64,
        parent_dir: &Path,
    ) -> Result<Option<AccountEntity>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, user_id, name, latest_release_time, parent_dir, media_count
             FROM user_entities WHERE user_id = ? AND parent_dir = ?",
        )
        .bind(account_id)
        .bind(parent_dir.to_string_lossy().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_account_entity))
    }

    pub async fn get_account_entity(&self, id: i64) -> Result<Option<AccountEntity>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, user_id, name, latest_release_time, parent_dir, media_count
             FROM user_entities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_account_entity))
    }

    pub async fn create_account_entity(
        &self,
        account_id: i64,
        name: &str,
        parent_dir: &Path,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO user_entities(user_id, name, parent_dir, media_count) VALUES (?, ?, ?, 0)",
        )
        .bind(account_id)
        .bind(name)
        .bind(parent_dir.to_string_lossy().to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn rename_account_entity(&self, id: i64, new_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_entities SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update `latest_release_time`/`media_count` after a producer finishes an
    /// account. This is a critical write: callers must treat a database
    /// error here as fatal rather than silently dropping the progress update.
    pub async fn update_account_entity_progress(
        &self,
        id: i64,
        latest_media_timestamp: NaiveDateTime,
        media_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_entities SET latest_release_time = ?, media_count = ? WHERE id = ?")
            .bind(latest_media_timestamp)
            .bind(media_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_account_entity(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_entities WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    // --- list entities ----------------------------------------------------

    pub async fn locate_list_entity(
        &self,
        list_id: i64,
        parent_dir: &Path,
    ) -> Result<Option<ListEntity>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, lst_id, name, parent_dir FROM lst_entities WHERE lst_id = ? AND parent_dir = ?",
        )
        .bind(list_id)
        .bind(parent_dir.to_string_lossy().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_list_entity))
    }

    pub async fn create_list_entity(
        &self,
        list_id: i64,
        name: &str,
        parent_dir: &Path,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO lst_entities(lst_id, name, parent_dir) VALUES (?, ?, ?)")
            .bind(list_id)
            .bind(name)
            .bind(parent_dir.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn rename_list_entity(&self, id: i64, new_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE lst_entities SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- links --------------------------------------------------------------

    pub async fn locate_link(
        &self,
        account_id: i64,
        parent_list_entity_id: i64,
    ) -> Result<Option<Link>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, user_id, name, parent_lst_entity_id FROM user_links
             WHERE user_id = ? AND parent_lst_entity_id = ?",
        )
        .bind(account_id)
        .bind(parent_list_entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_link))
    }

    pub async fn create_link(
        &self,
        account_id: i64,
        parent_list_entity_id: i64,
        name: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO user_links(user_id, parent_lst_entity_id, name) VALUES (?, ?, ?)",
        )
        .bind(account_id)
        .bind(parent_list_entity_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_link_name(&self, id: i64, new_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_links SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_link(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_links WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Account {
    Account {
        id: row.get("id"),
        handle: row.get("screen_name"),
        display_name: row.get("name"),
        protected: row.get("protected"),
        friends_count: row.get("friends_count"),
    }
}

fn row_to_account_entity(row: sqlx::sqlite::SqliteRow) -> AccountEntity {
    let parent_dir: String = row.get("parent_dir");
    let latest: Option<NaiveDateTime> = row.try_get("latest_release_time").ok();
    AccountEntity {
        id: row.get("id"),
        account_id: row.get("user_id"),
        name: row.get("name"),
        parent_dir: PathBuf::from(parent_dir),
        latest_media_timestamp: latest.map(|t| t.and_utc().timestamp()).unwrap_or(0),
        media_count: row.get("media_count"),
    }
}

fn row_to_list_entity(row: sqlx::sqlite::SqliteRow) -> ListEntity {
    let parent_dir: String = row.get("parent_dir");
    ListEntity {
        id: row.get("id"),
        list_id: row.get("lst_id"),
        name: row.get("name"),
        parent_dir: PathBuf::from(parent_dir),
    }
}

fn row_to_link(row: sqlx::sqlite::SqliteRow) -> Link {
    Link {
        id: row.get("id"),
        account_id: row.get("user_id"),
        parent_list_entity_id: row.get("parent_lst_entity_id"),
        name: row.get("name"),
    }
}
