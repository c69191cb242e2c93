use std::collections::{HashMap, VecDeque};

use tracing::debug;

/// Budget id meaning "not shared"; claims against it always succeed.
pub const NO_BUDGET: u64 = 0;

#[derive(Debug, Default)]
struct Budget {
    available: u64,
    watchers: VecDeque<u64>,
}

/// Shared credit pools keyed by budget id.
///
/// Streams that share a budget id debit the same pool. A claim that cannot be
/// satisfied registers the claiming stream as a watcher; watchers become
/// flushable once credit is added back and the owning engine re-invokes them.
#[derive(Debug, Default)]
pub struct Budgets {
    budgets: HashMap<u64, Budget>,
    flushable: VecDeque<u64>,
}

impl Budgets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credit to a pool, creating it on first use.
    pub fn credit(&mut self, budget_id: u64, amount: u64) {
        if budget_id == NO_BUDGET {
            return;
        }
        let budget = self.budgets.entry(budget_id).or_default();
        budget.available = budget.available.saturating_add(amount);
        while let Some(watcher) = budget.watchers.pop_front() {
            if !self.flushable.contains(&watcher) {
                self.flushable.push_back(watcher);
            }
        }
    }

    pub fn available(&self, budget_id: u64) -> Option<u64> {
        self.budgets.get(&budget_id).map(|b| b.available)
    }

    /// Claim between `min` and `max` bytes.
    ///
    /// Returns the claimed amount, or `0` when less than `min` is available,
    /// in which case `watcher` is notified through [`Budgets::take_flushable`]
    /// after the next credit. Unknown budget ids are not shared and grant `max`.
    pub fn claim(&mut self, budget_id: u64, watcher: u64, min: usize, max: usize) -> usize {
        if budget_id == NO_BUDGET {
            return max;
        }
        let Some(budget) = self.budgets.get_mut(&budget_id) else {
            return max;
        };
        let available = usize::try_from(budget.available).unwrap_or(usize::MAX);
        if available < min || available == 0 && max > 0 {
            if !budget.watchers.contains(&watcher) {
                budget.watchers.push_back(watcher);
            }
            debug!(budget_id, watcher, min, available, "budget claim deferred");
            return 0;
        }
        let claimed = available.min(max);
        budget.available -= claimed as u64;
        claimed
    }

    /// Drop `watcher` from every pool, on stream cleanup.
    pub fn release(&mut self, watcher: u64) {
        for budget in self.budgets.values_mut() {
            budget.watchers.retain(|w| *w != watcher);
        }
        self.flushable.retain(|w| *w != watcher);
    }

    /// Watchers whose deferred claims may now succeed.
    pub fn take_flushable(&mut self) -> Vec<u64> {
        self.flushable.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unshared_budget_always_grants() {
        let mut budgets = Budgets::new();
        assert_eq!(budgets.claim(NO_BUDGET, 1, 10, 10), 10);
        assert_eq!(budgets.claim(99, 1, 10, 10), 10);
    }

    #[test]
    fn whole_claim_defers_until_credit() {
        let mut budgets = Budgets::new();
        budgets.credit(7, 8);
        assert_eq!(budgets.claim(7, 1, 10, 10), 0);
        assert!(budgets.take_flushable().is_empty());

        budgets.credit(7, 4);
        assert_eq!(budgets.take_flushable(), vec![1]);
        assert_eq!(budgets.claim(7, 1, 10, 10), 10);
        assert_eq!(budgets.available(7), Some(2));
    }

    #[test]
    fn partial_claim_takes_what_is_available() {
        let mut budgets = Budgets::new();
        budgets.credit(7, 6);
        assert_eq!(budgets.claim(7, 1, 1, 10), 6);
        assert_eq!(budgets.available(7), Some(0));
        assert_eq!(budgets.claim(7, 1, 1, 10), 0);
    }

    #[test]
    fn release_forgets_watcher() {
        let mut budgets = Budgets::new();
        budgets.credit(7, 1);
        assert_eq!(budgets.claim(7, 3, 5, 5), 0);
        budgets.release(3);
        budgets.credit(7, 10);
        assert!(budgets.take_flushable().is_empty());
    }
}
