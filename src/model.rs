//! Entity and timeline-item types.

use chrono::{NaiveDate, NaiveDateTime};
use std::path::PathBuf;

/// A remote account, mirrored locally. Handle uniqueness is a database invariant,
/// not enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub handle: String,
    pub display_name: String,
    pub protected: bool,
    pub friends_count: i64,
}

/// A remote curated list whose members become accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct List {
    pub id: i64,
    pub name: String,
    pub owner_account_id: i64,
}

/// Materialization of an [`Account`] under a specific parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEntity {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub parent_dir: PathBuf,
    pub latest_media_timestamp: i64,
    pub media_count: i64,
}

/// Materialization of a [`List`] under a parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntity {
    pub id: i64,
    pub list_id: i64,
    pub name: String,
    pub parent_dir: PathBuf,
}

/// A symlink record: exactly one per (account, parent list-entity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub id: i64,
    pub account_id: i64,
    pub parent_list_entity_id: i64,
    pub name: String,
}

/// Append-only record of a prior handle/display-name for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleHistory {
    pub id: i64,
    pub account_id: i64,
    pub prior_handle: String,
    pub prior_name: String,
    pub recorded_on: NaiveDate,
}

/// A (account-entity-id, media-post) pair, as tracked by the [`crate::dumper`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub account_entity_id: i64,
    pub post: MediaPost,
}

/// One media-bearing post returned by the timeline pager.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MediaPost {
    pub id: u64,
    pub created_at: NaiveDateTime,
    pub text: String,
    pub media_urls: Vec<String>,
}

/// A member-account item returned by the timeline pager when expanding a list
/// or a following-list.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberAccount {
    pub id: i64,
    pub handle: String,
    pub display_name: String,
    pub protected: bool,
    pub friends_count: i64,
    pub media_count: i64,
}

/// A single-object account profile lookup (distinct from the paged
/// [`MemberAccount`] shape returned inside a timeline page): carries the
/// remote media count used by the depth scheduler and the caller's
/// follow-relationship to the subject, used for the scheduler's protected/
/// followed priority tiebreak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProfile {
    pub account: Account,
    pub media_count: i64,
    pub followed_by_caller: bool,
}

/// The kind of thing an [`Entity`] materializes: an account or a list,
/// reconciled uniformly by a single function rather than a pair of
/// parallel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Account,
    List,
}

/// Either an [`AccountEntity`] or a [`ListEntity`], reconciled uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub kind: EntityKind,
    /// The row id, or `None` if not yet recorded.
    pub id: Option<i64>,
    /// The account id or list id this entity materializes.
    pub subject_id: i64,
    pub parent_dir: PathBuf,
    pub name: String,
}

impl Entity {
    pub fn is_recorded(&self) -> bool {
        self.id.is_some()
    }

    pub fn path(&self) -> PathBuf {
        self.parent_dir.join(&self.name)
    }
}
