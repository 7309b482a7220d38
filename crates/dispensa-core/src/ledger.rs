//! Per-owner recovery token ledger

use dispensa_util::OwnerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Outcome of a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub granted: bool,
    /// Tokens left after this request
    pub remaining: u32,
}

/// Scarce recovery tokens, `max_tokens` per owner, never refunded.
///
/// Each owner's consumption is a single atomic counter, so concurrent
/// requests racing for the last token resolve to exactly one grant.
#[derive(Debug)]
pub struct RecoveryLedger {
    max_tokens: u32,
    consumed: RwLock<HashMap<OwnerId, Arc<AtomicU32>>>,
}

impl RecoveryLedger {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            consumed: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn counter(&self, owner: &OwnerId) -> Arc<AtomicU32> {
        if let Some(counter) = self
            .consumed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
        {
            return Arc::clone(counter);
        }

        let mut map = self.consumed.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(owner.clone()).or_default())
    }

    /// Consume one token if any are left
    pub fn try_consume(&self, owner: &OwnerId) -> Grant {
        let max = self.max_tokens;
        let counter = self.counter(owner);

        match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            (used < max).then_some(used + 1)
        }) {
            Ok(previous) => {
                let remaining = max - previous - 1;
                debug!(owner_id = %owner, remaining, "Recovery token granted");
                Grant {
                    granted: true,
                    remaining,
                }
            }
            Err(used) => {
                debug!(owner_id = %owner, "Recovery token denied");
                Grant {
                    granted: false,
                    remaining: max.saturating_sub(used),
                }
            }
        }
    }

    /// Tokens consumed so far by `owner`
    pub fn consumed(&self, owner: &OwnerId) -> u32 {
        self.consumed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn remaining(&self, owner: &OwnerId) -> u32 {
        self.max_tokens.saturating_sub(self.consumed(owner))
    }

    /// Load persisted consumption. Counters only move up.
    pub fn hydrate(&self, entries: impl IntoIterator<Item = (OwnerId, u32)>) {
        for (owner, used) in entries {
            let clamped = used.min(self.max_tokens);
            if clamped < used {
                warn!(
                    owner_id = %owner,
                    consumed = used,
                    max_tokens = self.max_tokens,
                    "Persisted consumption exceeds the configured maximum"
                );
            }
            self.counter(&owner).fetch_max(clamped, Ordering::AcqRel);
        }
    }

    /// Number of owners with a counter
    pub fn owner_count(&self) -> usize {
        self.consumed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_consume_until_exhausted() {
        let ledger = RecoveryLedger::new(2);
        let owner = OwnerId::new("student-1");

        assert_eq!(ledger.remaining(&owner), 2);
        assert_eq!(ledger.try_consume(&owner), Grant { granted: true, remaining: 1 });
        assert_eq!(ledger.try_consume(&owner), Grant { granted: true, remaining: 0 });
        assert_eq!(ledger.try_consume(&owner), Grant { granted: false, remaining: 0 });
        assert_eq!(ledger.consumed(&owner), 2);
    }

    #[test]
    fn test_owners_are_independent() {
        let ledger = RecoveryLedger::new(1);
        assert!(ledger.try_consume(&OwnerId::new("a")).granted);
        assert!(ledger.try_consume(&OwnerId::new("b")).granted);
        assert!(!ledger.try_consume(&OwnerId::new("a")).granted);
    }

    #[test]
    fn test_zero_budget_never_grants() {
        let ledger = RecoveryLedger::new(0);
        let grant = ledger.try_consume(&OwnerId::new("a"));
        assert!(!grant.granted);
        assert_eq!(grant.remaining, 0);
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        const THREADS: usize = 16;
        let ledger = Arc::new(RecoveryLedger::new(5));
        let owner = OwnerId::new("student-1");
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let owner = owner.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.try_consume(&owner).granted
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();

        assert_eq!(granted, 5);
        assert_eq!(ledger.consumed(&owner), 5);
        assert_eq!(ledger.remaining(&owner), 0);
    }

    #[test]
    fn test_hydrate_only_raises() {
        let ledger = RecoveryLedger::new(3);
        let owner = OwnerId::new("student-1");

        ledger.try_consume(&owner);
        ledger.try_consume(&owner);
        ledger.hydrate([(owner.clone(), 1)]);
        assert_eq!(ledger.consumed(&owner), 2);

        ledger.hydrate([(owner.clone(), 10)]);
        assert_eq!(ledger.consumed(&owner), 3);
        assert_eq!(ledger.owner_count(), 1);
    }
}
