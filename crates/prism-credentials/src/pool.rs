//! Account-pool selection and sticky conversation routing.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;
use uuid::Uuid;

use crate::descriptor::PoolMembers;

/// Bounded sticky table size; beyond this the least recently used
/// conversation loses its pinned account.
const STICKY_CAPACITY: usize = 10_000;
/// A sticky mapping older than this is treated as absent.
const STICKY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Rate-limit exhausted: every account in pool {pool_id} is over budget")]
    Exhausted { pool_id: String },
}

/// `(conversation_id, branch_id) → account_id`, TTL-bounded, LRU-evicted.
pub struct StickyMap {
    inner: Mutex<LruCache<(Uuid, String), StickyEntry>>,
    ttl: Duration,
}

struct StickyEntry {
    account_id: String,
    pinned_at: Instant,
}

impl StickyMap {
    pub fn new() -> Self {
        Self::with_limits(STICKY_CAPACITY, STICKY_TTL)
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity must be nonzero"),
            )),
            ttl,
        }
    }

    pub fn get(&self, conversation_id: Uuid, branch_id: &str) -> Option<String> {
        let mut map = self.inner.lock().unwrap();
        let key = (conversation_id, branch_id.to_string());
        match map.get(&key) {
            Some(entry) if entry.pinned_at.elapsed() < self.ttl => {
                Some(entry.account_id.clone())
            }
            Some(_) => {
                map.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn pin(&self, conversation_id: Uuid, branch_id: &str, account_id: &str) {
        let mut map = self.inner.lock().unwrap();
        map.put(
            (conversation_id, branch_id.to_string()),
            StickyEntry {
                account_id: account_id.to_string(),
                pinned_at: Instant::now(),
            },
        );
    }
}

impl Default for StickyMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Headroom kept below the configured budget: an account is usable while its
/// rolling usage is under 95% of the budget, leaving room for the response
/// that is about to be generated.
const BUDGET_HEADROOM_PCT: u64 = 5;

fn usable_budget(budget: u64) -> u64 {
    budget.saturating_sub(budget * BUDGET_HEADROOM_PCT / 100)
}

/// Pick a member account for one request.
///
/// A sticky account wins while it has budget left. Otherwise the member with
/// the lowest rolling output-token usage below the usable budget is chosen,
/// ties broken by ascending account id. `usage` reads the rolling window
/// counter.
pub fn select_account(
    pool: &PoolMembers,
    sticky: Option<&str>,
    budget: u64,
    usage: impl Fn(&str) -> u64,
) -> Result<String, PoolError> {
    let usable = usable_budget(budget);

    if let Some(account_id) = sticky {
        if pool.account_ids.iter().any(|id| id == account_id) && usage(account_id) < usable {
            return Ok(account_id.to_string());
        }
    }

    pool.account_ids
        .iter()
        .map(|id| (usage(id), id))
        .filter(|(used, _)| *used < usable)
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, id)| id.clone())
        .ok_or_else(|| PoolError::Exhausted {
            pool_id: pool.pool_id.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(ids: &[&str]) -> PoolMembers {
        PoolMembers {
            pool_id: "p1".to_string(),
            account_ids: ids.iter().map(|s| s.to_string()).collect(),
            strategy: "least_used".to_string(),
        }
    }

    fn usage_of(table: &[(&str, u64)]) -> HashMap<String, u64> {
        table.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn sticky_in_budget_wins() {
        let usage = usage_of(&[("acc1", 90), ("acc2", 10)]);
        let picked = select_account(&pool(&["acc1", "acc2"]), Some("acc1"), 100, |id| {
            usage[id]
        })
        .unwrap();
        assert_eq!(picked, "acc1");
    }

    #[test]
    fn sticky_over_budget_falls_back_to_least_used() {
        let usage = usage_of(&[("acc1", 100), ("acc2", 10)]);
        let picked = select_account(&pool(&["acc1", "acc2"]), Some("acc1"), 100, |id| {
            usage[id]
        })
        .unwrap();
        assert_eq!(picked, "acc2");
    }

    #[test]
    fn ties_break_by_ascending_account_id() {
        let usage = usage_of(&[("b", 5), ("a", 5), ("c", 5)]);
        let picked =
            select_account(&pool(&["b", "a", "c"]), None, 100, |id| usage[id]).unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn exhausted_pool_errors_until_usage_decays() {
        // budget 100 → usable 95; both accounts sit at or above it
        let usage = usage_of(&[("acc1", 95), ("acc2", 96)]);
        let err = select_account(&pool(&["acc1", "acc2"]), None, 100, |id| usage[id])
            .unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted {
                pool_id: "p1".to_string()
            }
        );

        // once the rolling window has passed, usage reads zero again
        let picked = select_account(&pool(&["acc1", "acc2"]), None, 100, |_| 0).unwrap();
        assert_eq!(picked, "acc1");
    }

    #[test]
    fn sticky_map_expires_entries() {
        let map = StickyMap::with_limits(4, Duration::from_millis(0));
        let conv = Uuid::new_v4();
        map.pin(conv, "main", "acc1");
        // zero TTL: immediately expired
        assert_eq!(map.get(conv, "main"), None);

        let map = StickyMap::with_limits(4, Duration::from_secs(60));
        map.pin(conv, "main", "acc1");
        assert_eq!(map.get(conv, "main").as_deref(), Some("acc1"));
        assert_eq!(map.get(conv, "other"), None);
    }

    #[test]
    fn sticky_map_evicts_least_recently_used() {
        let map = StickyMap::with_limits(2, Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        map.pin(a, "main", "acc-a");
        map.pin(b, "main", "acc-b");
        map.pin(c, "main", "acc-c");
        assert_eq!(map.get(a, "main"), None);
        assert_eq!(map.get(c, "main").as_deref(), Some("acc-c"));
    }
}
