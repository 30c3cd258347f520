use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{core::crypto::MsSinceEpoch, ext::serde::duration_secs};

/// Circuit breaker over the recent failures of a pool.
///
/// A pool is restrained while at least `threshold` of its user services went
/// into `ERROR` inside the trailing `window`. A zero window or a zero
/// threshold turns the policy off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestraintPolicy {
    #[serde(with = "duration_secs")]
    pub window: Duration,
    pub threshold: usize,
}

impl Default for RestraintPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            threshold: 3,
        }
    }
}

impl RestraintPolicy {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self { window, threshold }
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero() && self.threshold > 0
    }

    /// The error dates still inside the window, oldest first.
    fn qualifying(&self, errors: impl IntoIterator<Item = MsSinceEpoch>, now: MsSinceEpoch) -> Vec<MsSinceEpoch> {
        let since = now.before(self.window);
        let mut recent: Vec<_> = errors.into_iter().filter(|e| *e > since && *e <= now).collect();
        recent.sort();
        recent
    }

    pub fn is_restrained(&self, errors: impl IntoIterator<Item = MsSinceEpoch>, now: MsSinceEpoch) -> bool {
        self.is_enabled() && self.qualifying(errors, now).len() >= self.threshold
    }

    /// Time until the pool stops being restrained, zero if it is not.
    ///
    /// The restraint lifts once only `threshold - 1` errors remain in the
    /// window, so the error that matters is the one `threshold` places from
    /// the newest.
    pub fn remaining(&self, errors: impl IntoIterator<Item = MsSinceEpoch>, now: MsSinceEpoch) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let recent = self.qualifying(errors, now);
        if recent.len() < self.threshold {
            return Duration::ZERO;
        }
        let pivot = recent[recent.len() - self.threshold];
        now.until(pivot.after(self.window))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::core::crypto::MsSinceEpoch;

    use super::RestraintPolicy;

    fn at(seconds: i64) -> MsSinceEpoch {
        MsSinceEpoch::from_seconds(seconds)
    }

    #[test]
    pub fn test_three_errors_in_window() {
        let policy = RestraintPolicy::new(Duration::from_secs(1200), 3);
        let errors = [at(100), at(200), at(300)];

        assert!(!policy.is_restrained(errors[..2].to_vec(), at(300)));
        assert!(policy.is_restrained(errors, at(300)));
        assert_eq!(policy.remaining(errors, at(300)), Duration::from_secs(1000));

        // Oldest error ages out at 1300.
        assert!(policy.is_restrained(errors, at(1299)));
        assert!(!policy.is_restrained(errors, at(1300)));
        assert_eq!(policy.remaining(errors, at(1300)), Duration::ZERO);
    }

    #[test]
    pub fn test_remaining_decreases_monotonically() {
        let policy = RestraintPolicy::new(Duration::from_secs(1200), 3);
        let errors = [at(0), at(50), at(400), at(500)];
        let mut last = policy.remaining(errors, at(500));
        assert!(last > Duration::ZERO);
        for t in (510..2000).step_by(10) {
            let now = policy.remaining(errors, at(t));
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, Duration::ZERO);
    }

    #[test]
    pub fn test_zero_disables() {
        let errors = [at(1), at(2), at(3), at(4)];
        assert!(!RestraintPolicy::new(Duration::ZERO, 3).is_restrained(errors, at(5)));
        assert!(!RestraintPolicy::new(Duration::from_secs(60), 0).is_restrained(errors, at(5)));
        assert_eq!(RestraintPolicy::new(Duration::from_secs(60), 0).remaining(errors, at(5)), Duration::ZERO);
    }

    #[test]
    pub fn test_arbitrary_error_sets() {
        use arbitrary::Arbitrary;
        arbtest::arbtest(|u| {
            let threshold = usize::from(u8::arbitrary(u)? % 6);
            let window = Duration::from_secs(u64::from(u16::arbitrary(u)?));
            let policy = RestraintPolicy::new(window, threshold);
            let errors: Vec<MsSinceEpoch> = Vec::<u16>::arbitrary(u)?
                .into_iter()
                .map(|s| at(i64::from(s)))
                .collect();
            let now = at(70_000 + i64::from(u16::arbitrary(u)?));

            let restrained = policy.is_restrained(errors.clone(), now);
            let remaining = policy.remaining(errors.clone(), now);
            assert_eq!(restrained, !remaining.is_zero());
            if restrained {
                assert!(!policy.is_restrained(errors, now.after(remaining)));
            }
            Ok(())
        })
        .budget(crate::testutil::ARBTEST_DURATION);
    }
}
