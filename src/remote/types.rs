//! Timeline response shapes. The remote service's JSON graph is an opaque,
//! documented-fields-only surface; these types model only the fields the
//! pager actually reads.

use crate::model::{Account, List, MediaPost, MemberAccount, RemoteProfile};
use chrono::NaiveDateTime;
use serde_json::Value;

/// One parsed timeline item. `Ad` covers the promoted/ad entry shape present
/// in real traffic and silently discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Post(MediaPost),
    Member(MemberAccount),
    Ad,
}

/// Rate-limit facts parsed from response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch: i64,
}

pub fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimitHeaders> {
    let get = |name: &str| headers.get(name)?.to_str().ok()?.parse::<i64>().ok();
    let limit = get("x-rate-limit-limit")?;
    let remaining = get("x-rate-limit-remaining")?;
    let reset_epoch = get("x-rate-limit-reset")?;
    Some(RateLimitHeaders { limit: limit.max(0) as u64, remaining: remaining.max(0) as u64, reset_epoch })
}

/// Walk `instructions[]` and flatten `TimelineAddEntries` + `TimelineAddToModule`
/// item content into the page's content list, alongside the bottom cursor.
/// Both entry shapes (`TimelineTimelineItem`, `TimelineTimelineModule`) are
/// handled uniformly.
pub fn flatten_page(instructions: &Value) -> (Vec<Value>, Option<String>) {
    let mut item_contents = Vec::new();
    let mut cursor = None;

    let instructions = instructions.as_array().cloned().unwrap_or_default();
    for instruction in &instructions {
        match instruction.get("type").and_then(Value::as_str) {
            Some("TimelineAddEntries") => {
                if let Some(entries) = instruction.get("entries").and_then(Value::as_array) {
                    for entry in entries {
                        let entry_type =
                            entry.pointer("/content/entryType").and_then(Value::as_str).unwrap_or("");
                        if entry_type == "TimelineTimelineCursor" {
                            if entry.pointer("/content/cursorType").and_then(Value::as_str) == Some("Bottom")
                            {
                                cursor = entry
                                    .pointer("/content/value")
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                            }
                            continue;
                        }
                        item_contents.extend(item_contents_from_entry(entry));
                    }
                }
            }
            Some("TimelineAddToModule") => {
                if let Some(items) = instruction.get("moduleItems").and_then(Value::as_array) {
                    for module_item in items {
                        if let Some(ic) = module_item.pointer("/item/itemContent") {
                            item_contents.push(ic.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    (item_contents, cursor)
}

fn item_contents_from_entry(entry: &Value) -> Vec<Value> {
    match entry.pointer("/content/entryType").and_then(Value::as_str) {
        Some("TimelineTimelineModule") => entry
            .pointer("/content/items")
            .and_then(Value::as_array)
            .map(|items| {
                items.iter().filter_map(|i| i.pointer("/item/itemContent").cloned()).collect()
            })
            .unwrap_or_default(),
        Some("TimelineTimelineItem") => {
            entry.pointer("/content/itemContent").cloned().into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Classify one flattened item-content value into a [`TimelineItem`].
/// Unrecognized shapes (ads/promotions) are `Ad` and discarded by the pager.
pub fn classify_item(item_content: &Value) -> TimelineItem {
    if let Some(tweet) = item_content.get("tweet_results").and_then(parse_tweet_result) {
        return TimelineItem::Post(tweet);
    }
    if let Some(user) = item_content.get("user_results").and_then(parse_user_result) {
        return TimelineItem::Member(user);
    }
    TimelineItem::Ad
}

fn parse_tweet_result(value: &Value) -> Option<MediaPost> {
    let result = value.get("result")?;
    let id: u64 = result.get("rest_id")?.as_str()?.parse().ok()?;
    let legacy = result.get("legacy")?;
    let created_at = legacy
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(parse_twitter_timestamp)
        .unwrap_or_default();
    let text = legacy.get("full_text").and_then(Value::as_str).unwrap_or_default().to_string();
    let media_urls = legacy
        .pointer("/entities/media")
        .and_then(Value::as_array)
        .map(|media| {
            media
                .iter()
                .filter_map(|m| m.get("media_url_https").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(MediaPost { id, created_at, text, media_urls })
}

fn parse_user_result(value: &Value) -> Option<MemberAccount> {
    let result = value.get("result")?;
    let id: i64 = result.get("rest_id")?.as_str()?.parse().ok()?;
    let legacy = result.get("legacy")?;
    Some(MemberAccount {
        id,
        handle: legacy.get("screen_name").and_then(Value::as_str).unwrap_or_default().to_string(),
        display_name: legacy.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        protected: legacy.get("protected").and_then(Value::as_bool).unwrap_or(false),
        friends_count: legacy.get("friends_count").and_then(Value::as_i64).unwrap_or(0),
        media_count: legacy.get("media_count").and_then(Value::as_i64).unwrap_or(0),
    })
}

/// Parse a list lookup response (`data.list`): id, name, and creator (owner)
/// account id.
pub fn parse_list(body: &str) -> Option<List> {
    let value: Value = serde_json::from_str(body).ok()?;
    let list = value.pointer("/data/list")?;
    let id: i64 = list.get("id_str")?.as_str()?.parse().ok()?;
    let name = list.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let owner_account_id: i64 =
        list.pointer("/user_results/result/rest_id")?.as_str()?.parse().ok()?;
    Some(List { id, name, owner_account_id })
}

/// Parse a single-object account profile lookup response (`data.user.result`),
/// used for the depth scheduler's remote media count and the protected/
/// followed priority tiebreak.
pub fn parse_profile(body: &str) -> Option<RemoteProfile> {
    let value: Value = serde_json::from_str(body).ok()?;
    let result = value.pointer("/data/user/result")?;
    if result.get("__typename").and_then(Value::as_str) == Some("UserUnavailable") {
        return None;
    }
    let id: i64 = result.get("rest_id")?.as_str()?.parse().ok()?;
    let legacy = result.get("legacy")?;
    let account = Account {
        id,
        handle: legacy.get("screen_name").and_then(Value::as_str).unwrap_or_default().to_string(),
        display_name: legacy.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        protected: legacy.get("protected").and_then(Value::as_bool).unwrap_or(false),
        friends_count: legacy.get("friends_count").and_then(Value::as_i64).unwrap_or(0),
    };
    let media_count = legacy.get("media_count").and_then(Value::as_i64).unwrap_or(0);
    let followed_by_caller = legacy.get("following").and_then(Value::as_bool).unwrap_or(false);
    Some(RemoteProfile { account, media_count, followed_by_caller })
}

fn parse_twitter_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%a %b %d %H:%M:%S %z %Y").ok()
}
