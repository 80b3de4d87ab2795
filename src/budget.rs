//! Shared iteration budget for fixed-profile runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// A global pool of iterations that virtual users claim one at a time.
///
/// Claims use a compare-exchange loop with a floor at zero, so two users can
/// never both take the last unit and the counter never wraps.
#[derive(Debug)]
pub struct IterationBudget {
    total: u64,
    remaining: AtomicU64,
}

impl IterationBudget {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            remaining: AtomicU64::new(total),
        }
    }

    /// Claims one iteration. Returns the zero-based global iteration index,
    /// or None once the budget is exhausted.
    pub fn try_claim(&self) -> Option<u64> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .ok()
            .map(|previous| self.total - previous)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn claimed(&self) -> u64 {
        self.total - self.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn claims_until_exhausted() {
        let budget = IterationBudget::new(3);
        assert_eq!(budget.try_claim(), Some(0));
        assert_eq!(budget.try_claim(), Some(1));
        assert_eq!(budget.try_claim(), Some(2));
        assert_eq!(budget.try_claim(), None);
        assert_eq!(budget.try_claim(), None);
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.claimed(), 3);
    }

    #[test]
    fn zero_budget_is_immediately_exhausted() {
        let budget = IterationBudget::new(0);
        assert_eq!(budget.try_claim(), None);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn concurrent_claims_are_unique() {
        let budget = Arc::new(IterationBudget::new(10_000));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(index) = budget.try_claim() {
                        mine.push(index);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "iteration {} claimed twice", index);
            }
        }
        assert_eq!(seen.len(), 10_000);
        assert_eq!(budget.remaining(), 0);
    }
}
