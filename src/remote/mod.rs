//! Remote timeline service client: authenticated HTTP pool and
//! cursor-paginated page walker.

pub mod client;
pub mod pager;
pub mod types;

pub use client::{ClientIdentity, ClientPool, RequestCounters, SelectionError};
pub use pager::{PageBounds, TimelinePager};
pub use types::{parse_list, parse_profile, RateLimitHeaders, TimelineItem};
