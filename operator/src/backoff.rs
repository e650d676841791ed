use std::{collections::HashMap, hash::Hash, time::Duration};

/// Per item exponential failure backoff.
///
/// Each call to [`when`](Self::when) for an item returns `base * 2^failures`
/// capped at `max`, then counts one more failure. [`forget`](Self::forget)
/// starts the item over at `base`.
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            base,
            max: max.max(base),
            failures: HashMap::new(),
        }
    }

    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // 2^31 already overflows any sane base, stop growing before the shift does.
        if exp >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    pub fn base(&self) -> Duration {
        self.base
    }
}

impl<T: Eq + Hash + Clone> Default for ExponentialBackoff<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}
