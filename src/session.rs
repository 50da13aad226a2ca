//! Run-scoped [`Session`]: an explicit object whose lifetime is exactly one
//! run, carried through the pipeline alongside handles to the DB pool,
//! client pool, and arbiter.

use crate::arbiter::RateArbiter;
use crate::db::Db;
use crate::remote::ClientPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Tracks which (account, list) pairs have already been synced this run, so
/// repeat encounters (an account appearing in two lists, or a list appearing
/// twice in `--list`) skip redundant reconciliation work.
#[derive(Debug, Default)]
struct SyncedSets {
    accounts: HashSet<i64>,
    list_members: HashSet<(i64, i64)>,
}

/// Run-scoped shared state: the "synced" bookkeeping plus every shared
/// handle the pipeline stages need.
pub struct Session {
    pub db: Db,
    pub clients: Arc<ClientPool>,
    pub arbiter: Arc<RateArbiter>,
    synced: Mutex<SyncedSets>,
}

impl Session {
    pub fn new(db: Db, clients: Arc<ClientPool>, arbiter: Arc<RateArbiter>) -> Self {
        Self { db, clients, arbiter, synced: Mutex::new(SyncedSets::default()) }
    }

    /// Mark `account_id` as synced for this run. Returns `true` if this is
    /// the first time (the caller should do the sync work), `false` if
    /// another caller already claimed it (LoadOrStore semantics).
    pub fn claim_account(&self, account_id: i64) -> bool {
        self.synced.lock().unwrap_or_else(|p| p.into_inner()).accounts.insert(account_id)
    }

    /// Mark (`account_id`, `list_id`) membership as synced for this run,
    /// with the same LoadOrStore semantics as [`Session::claim_account`].
    pub fn claim_list_membership(&self, account_id: i64, list_id: i64) -> bool {
        self.synced
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .list_members
            .insert((account_id, list_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    async fn session() -> Session {
        let db = Db::connect_in_memory().await.unwrap();
        let arbiter = Arc::new(RateArbiter::new(Arc::new(MonotonicClock::default())));
        let clients = Arc::new(ClientPool::new(Vec::new(), arbiter.clone()));
        Session::new(db, clients, arbiter)
    }

    #[tokio::test]
    async fn claim_account_is_first_writer_wins() {
        let s = session().await;
        assert!(s.claim_account(1));
        assert!(!s.claim_account(1));
        assert!(s.claim_account(2));
    }

    #[tokio::test]
    async fn claim_list_membership_is_per_pair() {
        let s = session().await;
        assert!(s.claim_list_membership(1, 100));
        assert!(!s.claim_list_membership(1, 100));
        assert!(s.claim_list_membership(1, 200));
    }
}
