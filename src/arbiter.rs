//! Rate Arbiter: a per-(client, url-path) token-bucket with cold-start
//! serialization, sleep-on-exhaustion, and a non-blocking probe.
//!
//! The slot table is a plain `std::sync::Mutex`-guarded `HashMap`, the same
//! shape used by this crate's other ordinal-keyed registries, keyed on
//! `(ClientId, path)` rather than a client pointer, trading the source's
//! pointer-identity map keys for an ordinal assigned at login.

use crate::clock::Clock;
use crate::remote::types::RateLimitHeaders;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Ordinal identity of a client within the pool, replacing pointer identity
/// from the source implementation.
pub type ClientId = u64;

/// Grace period added to `reset_at` before a sleeping caller retries.
pub const RESET_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("rate arbiter would block")]
    WouldBlock,
    #[error("run cancelled while waiting on rate arbiter")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    /// A pioneer request is in flight; no rate-limit facts yet.
    Unready,
    /// Rate-limit facts known; admit while `remaining > floor`.
    Ready { limit: u64, remaining: u64, reset_at: i64 },
    /// The endpoint reported no rate-limit headers; admit unconditionally.
    NoLimit,
}

struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
}

/// Per-(client, path) token-bucket arbiter.
pub struct RateArbiter {
    table: Mutex<HashMap<(ClientId, String), Arc<Slot>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateArbiter").finish_non_exhaustive()
    }
}

fn floor(limit: u64) -> u64 {
    ((2 * limit) / 100).max(1)
}

impl RateArbiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { table: Mutex::new(HashMap::new()), clock }
    }

    fn slot_for(&self, client: ClientId, path: &str) -> Option<Arc<Slot>> {
        self.table.lock().unwrap_or_else(|p| p.into_inner()).get(&(client, path.to_string())).cloned()
    }

    /// Admit the caller, possibly waiting until `reset_at + RESET_GRACE`. In
    /// `non_blocking` mode, returns `WouldBlock` instead of ever sleeping or
    /// waiting on another caller's pioneer request.
    pub async fn check(
        &self,
        cancel: &CancellationToken,
        client: ClientId,
        path: &str,
        non_blocking: bool,
    ) -> Result<(), ArbiterError> {
        loop {
            let key = (client, path.to_string());
            let slot = {
                let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
                match table.get(&key).cloned() {
                    Some(slot) => slot,
                    None => {
                        // Absent: this caller becomes the pioneer.
                        let slot = Arc::new(Slot { state: Mutex::new(SlotState::Unready), notify: Notify::new() });
                        table.insert(key.clone(), slot.clone());
                        return Ok(());
                    }
                }
            };

            let decision = {
                let mut state = slot.state.lock().unwrap_or_else(|p| p.into_inner());
                match *state {
                    SlotState::Unready => Decision::WaitUnready,
                    SlotState::NoLimit => Decision::Admit,
                    SlotState::Ready { limit, remaining, reset_at } => {
                        let now = self.clock.now_unix_secs();
                        if now >= reset_at {
                            *state = SlotState::Unready;
                            Decision::AdmitAsNewPioneer
                        } else if remaining > floor(limit) {
                            *state = SlotState::Ready { limit, remaining: remaining - 1, reset_at };
                            Decision::Admit
                        } else {
                            Decision::SleepUntil(reset_at)
                        }
                    }
                }
            };

            match decision {
                Decision::Admit | Decision::AdmitAsNewPioneer => return Ok(()),
                Decision::WaitUnready => {
                    if non_blocking {
                        return Err(ArbiterError::WouldBlock);
                    }
                    tokio::select! {
                        _ = slot.notify.notified() => continue,
                        _ = cancel.cancelled() => return Err(ArbiterError::Cancelled),
                    }
                }
                Decision::SleepUntil(reset_at) => {
                    if non_blocking {
                        return Err(ArbiterError::WouldBlock);
                    }
                    let now_secs = self.clock.now_unix_secs();
                    let sleep_for = (reset_at - now_secs).max(0) as u64;
                    let deadline = Duration::from_secs(sleep_for) + RESET_GRACE;
                    tokio::select! {
                        _ = tokio::time::sleep(deadline) => continue,
                        _ = cancel.cancelled() => return Err(ArbiterError::Cancelled),
                    }
                }
            }
        }
    }

    /// Record the outcome of a request that reached this slot. If the slot
    /// was unready, transition it to `Ready`/`NoLimit` and broadcast to every
    /// waiter; already-settled slots are left untouched.
    pub fn settle(&self, client: ClientId, path: &str, headers: Option<RateLimitHeaders>) {
        let Some(slot) = self.slot_for(client, path) else { return };
        let mut state = slot.state.lock().unwrap_or_else(|p| p.into_inner());
        if !matches!(*state, SlotState::Unready) {
            return;
        }
        *state = match headers {
            Some(h) => SlotState::Ready { limit: h.limit, remaining: h.remaining, reset_at: h.reset_epoch },
            None => SlotState::NoLimit,
        };
        drop(state);
        slot.notify.notify_waiters();
    }

    /// Record a transport failure with no usable response. If the slot was
    /// unready, delete it entirely so the next caller becomes the pioneer
    /// again, waking exactly one waiter.
    pub fn reset(&self, client: ClientId, path: &str) {
        let key = (client, path.to_string());
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = table.get(&key) {
            let is_unready = matches!(*slot.state.lock().unwrap_or_else(|p| p.into_inner()), SlotState::Unready);
            if is_unready {
                let slot = table.remove(&key).expect("just looked up");
                drop(table);
                slot.notify.notify_one();
            }
        }
    }

    /// Non-blocking probe: would `check` admit this caller right now without
    /// waiting? Used by the client-pool selection policy.
    pub async fn would_admit(&self, client: ClientId, path: &str) -> bool {
        let cancel = CancellationToken::new();
        self.check(&cancel, client, path, true).await.is_ok()
    }
}

enum Decision {
    Admit,
    AdmitAsNewPioneer,
    WaitUnready,
    SleepUntil(i64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    fn arbiter() -> RateArbiter {
        RateArbiter::new(Arc::new(MonotonicClock::default()))
    }

    #[tokio::test]
    async fn first_caller_becomes_pioneer_and_is_admitted() {
        let arb = arbiter();
        let cancel = CancellationToken::new();
        let result = arb.check(&cancel, 1, "/timeline", false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_blocking_probe_would_block_while_unready() {
        let arb = arbiter();
        let cancel = CancellationToken::new();
        // pioneer
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();
        // second caller, non-blocking: slot is unready, should WouldBlock
        let result = arb.check(&cancel, 1, "/timeline", true).await;
        assert_eq!(result, Err(ArbiterError::WouldBlock));
    }

    #[tokio::test]
    async fn settle_admits_waiters_after_pioneer_resolves() {
        let arb = Arc::new(arbiter());
        let cancel = CancellationToken::new();
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();

        let waiter_arb = arb.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_arb.check(&waiter_cancel, 1, "/timeline", false).await
        });

        tokio::task::yield_now().await;
        arb.settle(
            1,
            "/timeline",
            Some(RateLimitHeaders { limit: 500, remaining: 100, reset_epoch: i64::MAX }),
        );

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn reset_deletes_unready_slot_and_wakes_one_waiter() {
        let arb = Arc::new(arbiter());
        let cancel = CancellationToken::new();
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();

        let waiter_arb = arb.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_arb.check(&waiter_cancel, 1, "/timeline", false).await
        });

        tokio::task::yield_now().await;
        arb.reset(1, "/timeline");

        // the woken waiter re-evaluates: slot absent, so it becomes pioneer and is admitted.
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ready_slot_blocks_once_remaining_hits_floor() {
        let arb = arbiter();
        let cancel = CancellationToken::new();
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();
        // floor(500) = 10; settle with remaining exactly at floor + 1 so exactly one more admit succeeds.
        arb.settle(1, "/timeline", Some(RateLimitHeaders { limit: 500, remaining: 11, reset_epoch: i64::MAX }));

        assert!(arb.check(&cancel, 1, "/timeline", true).await.is_ok());
        // remaining is now 10 == floor, should WouldBlock in non-blocking mode.
        assert_eq!(arb.check(&cancel, 1, "/timeline", true).await, Err(ArbiterError::WouldBlock));
    }

    #[tokio::test]
    async fn no_limit_slot_admits_unconditionally() {
        let arb = arbiter();
        let cancel = CancellationToken::new();
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();
        arb.settle(1, "/timeline", None);
        for _ in 0..5 {
            assert!(arb.check(&cancel, 1, "/timeline", true).await.is_ok());
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting() {
        let arb = arbiter();
        let cancel = CancellationToken::new();
        arb.check(&cancel, 1, "/timeline", false).await.unwrap();

        let child_arb = &arb;
        let child_cancel = cancel.clone();
        cancel.cancel();
        let result = child_arb.check(&child_cancel, 1, "/timeline", false).await;
        assert_eq!(result, Err(ArbiterError::Cancelled));
    }
}
