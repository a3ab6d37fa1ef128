//! Retry budgets: sliding caps on the retry-to-request ratio.
//!
//! A budget tracks total requests and retries over a sliding window. A
//! retry is admitted iff `retries / (requests + 1) <= ratio` or the
//! per-second minimum quota has headroom. Budget pools are shared by name
//! across routes; pool state is process-wide.

use crate::models::policy::RetryBudgetPolicy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BudgetWindow {
    /// (timestamp, was_retry) events inside the window.
    events: VecDeque<(Instant, bool)>,
}

/// One named retry budget.
#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryBudgetPolicy,
    window: Mutex<BudgetWindow>,
}

impl RetryBudget {
    pub fn new(policy: RetryBudgetPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            window: Mutex::new(BudgetWindow {
                events: VecDeque::new(),
            }),
        })
    }

    fn prune(events: &mut VecDeque<(Instant, bool)>, horizon: Duration, now: Instant) {
        while let Some((ts, _)) = events.front() {
            if now.duration_since(*ts) > horizon {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records one initial (non-retry) attempt.
    pub fn record_request(&self) {
        let mut window = self.window.lock().expect("budget lock poisoned");
        let now = Instant::now();
        Self::prune(
            &mut window.events,
            Duration::from_millis(self.policy.window_ms),
            now,
        );
        window.events.push_back((now, false));
    }

    /// Asks whether one more retry fits the budget, recording it if so.
    pub fn try_acquire_retry(&self) -> bool {
        let mut window = self.window.lock().expect("budget lock poisoned");
        let now = Instant::now();
        Self::prune(
            &mut window.events,
            Duration::from_millis(self.policy.window_ms),
            now,
        );

        let requests = window.events.iter().filter(|(_, retry)| !retry).count() as f64;
        let retries = window.events.iter().filter(|(_, retry)| *retry).count() as f64;

        // Minimum quota: retries within the last second, regardless of ratio.
        let recent_retries = window
            .events
            .iter()
            .rev()
            .take_while(|(ts, _)| now.duration_since(*ts) <= Duration::from_secs(1))
            .filter(|(_, retry)| *retry)
            .count() as u64;

        let ratio_ok = (retries + 1.0) / (requests + 1.0) <= self.policy.ratio;
        let quota_ok = recent_retries < self.policy.min_retries_per_sec;

        if ratio_ok || quota_ok {
            window.events.push_back((now, true));
            true
        } else {
            false
        }
    }
}

/// Process-wide budget pools keyed by name. Created at first publish,
/// passed to the dispatcher by reference.
#[derive(Debug, Default)]
pub struct BudgetRegistry {
    pools: RwLock<HashMap<String, Arc<RetryBudget>>>,
}

impl BudgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named pool, creating it with the given policy on first
    /// use. Later callers naming the same pool share its state even with
    /// differing parameters; the first policy wins.
    pub fn get(&self, policy: &RetryBudgetPolicy) -> Arc<RetryBudget> {
        if let Some(pool) = self
            .pools
            .read()
            .expect("budget registry lock poisoned")
            .get(&policy.name)
        {
            return pool.clone();
        }
        let mut pools = self.pools.write().expect("budget registry lock poisoned");
        pools
            .entry(policy.name.clone())
            .or_insert_with(|| RetryBudget::new(policy.clone()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ratio: f64, min_per_sec: u64) -> RetryBudgetPolicy {
        RetryBudgetPolicy {
            name: "test".to_string(),
            ratio,
            window_ms: 10_000,
            min_retries_per_sec: min_per_sec,
        }
    }

    #[test]
    fn ratio_caps_retries() {
        let budget = RetryBudget::new(policy(0.2, 0));
        for _ in 0..10 {
            budget.record_request();
        }
        // (retries + 1) / (10 + 1) <= 0.2 admits the first retry only:
        // 1/11 ok, 2/11 ok, 3/11 > 0.2.
        let mut admitted = 0;
        for _ in 0..5 {
            if budget.try_acquire_retry() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn minimum_quota_admits_despite_ratio() {
        let budget = RetryBudget::new(policy(0.0, 1));
        budget.record_request();
        // Ratio of 0 admits nothing, but the per-second minimum allows one.
        assert!(budget.try_acquire_retry());
        assert!(!budget.try_acquire_retry());
    }

    #[test]
    fn pools_are_shared_by_name() {
        let registry = BudgetRegistry::new();
        let a = registry.get(&policy(0.5, 0));
        let b = registry.get(&policy(0.5, 0));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
