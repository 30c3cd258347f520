use std::{
    ops::{Add, AddAssign, Sub, SubAssign},
    time::Duration,
};

#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Eq, Ord, Hash, Default)]
pub struct MsSinceEpoch(pub i64);

impl MsSinceEpoch {
    pub const NEVER: Self = Self(0);

    pub fn from_seconds(seconds: i64) -> Self {
        Self(seconds * 1000)
    }
    pub fn seconds(&self) -> i64 {
        self.0.div_euclid(1000)
    }
    pub fn now() -> Self {
        chrono::Utc::now().into()
    }
    /// Returns this instant shifted forwards by the duration.
    pub fn after(self, duration: Duration) -> Self {
        self + Self::from(duration)
    }
    /// Returns this instant shifted backwards by the duration.
    pub fn before(self, duration: Duration) -> Self {
        self - Self::from(duration)
    }
    /// How long until `deadline`, saturating at zero.
    pub fn until(self, deadline: Self) -> Duration {
        Duration::from_millis((deadline.0 - self.0).max(0) as u64)
    }
}

impl From<Duration> for MsSinceEpoch {
    fn from(value: Duration) -> Self {
        Self(i64::try_from(value.as_millis()).unwrap_or(i64::MAX))
    }
}

impl Sub<Self> for MsSinceEpoch {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign<Self> for MsSinceEpoch {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Add<Self> for MsSinceEpoch {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Self> for MsSinceEpoch {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}
