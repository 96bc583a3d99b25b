/*! Time structures.

The engine never reads a clock by itself. Every entry point is handed the current [Instant] by
its caller, which keeps the protocol logic deterministic under test and lets a host drive it
from whatever tick source it has.

 - [Instant] is an absolute point in time, in milliseconds.
 - [Duration] is relative time, re-exported from `core`.
 - [Expiration] is a deadline that may be absent.

[Instant]: struct.Instant.html
[Duration]: https://doc.rust-lang.org/core/time/struct.Duration.html
[Expiration]: enum.Expiration.html
*/
use core::{cmp, fmt, ops};
pub use core::time::Duration;

/// A representation of an absolute time value.
///
/// The `Instant` type is a wrapper around a `i64` value that represents a number of milliseconds
/// since an arbitrary starting tick, such as the creation of the first endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    pub millis: i64,
}

/// An expiration time, inversion of `Option`.
///
/// Orders `Never` after every `When`, so the earliest of several deadlines is their minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiration {
    When(Instant),
    Never,
}

use Expiration::{When, Never};

impl Instant {
    /// Create a new `Instant` from a number of milliseconds.
    pub fn from_millis<T: Into<i64>>(millis: T) -> Instant {
        Instant { millis: millis.into() }
    }

    /// Create a new `Instant` from a number of seconds.
    pub fn from_secs<T: Into<i64>>(secs: T) -> Instant {
        Instant { millis: secs.into() * 1000 }
    }

    /// The current wall clock, for hosts that do not bring their own tick source.
    #[cfg(feature = "std")]
    pub fn now() -> Instant {
        let since = ::std::time::SystemTime::now()
            .duration_since(::std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Instant::from_millis(since.as_millis() as i64)
    }

    /// The number of whole seconds that have passed since the starting tick.
    pub fn secs(&self) -> i64 {
        self.millis / 1000
    }

    /// The total number of milliseconds that have passed since the starting tick.
    pub fn total_millis(&self) -> i64 {
        self.millis
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub fn saturating_since(self, earlier: Instant) -> Duration {
        if self.millis <= earlier.millis {
            Duration::from_millis(0)
        } else {
            Duration::from_millis((self.millis - earlier.millis) as u64)
        }
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis.rem_euclid(1000))
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.as_millis() as i64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.as_millis() as i64;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis - rhs.as_millis() as i64)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_millis((self.millis - rhs.millis).abs() as u64)
    }
}

impl Expiration {
    /// Check if the deadline has passed at `now`.
    pub fn is_expired(self, now: Instant) -> bool {
        match self {
            When(at) => at <= now,
            Never => false,
        }
    }

    /// The deadline, if there is one.
    pub fn when(self) -> Option<Instant> {
        match self {
            When(at) => Some(at),
            Never => None,
        }
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Never
    }
}

impl From<Option<Instant>> for Expiration {
    fn from(deadline: Option<Instant>) -> Self {
        deadline.map(When).unwrap_or(Never)
    }
}

impl cmp::PartialOrd for Expiration {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for Expiration {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (self, other) {
            (Never, Never) => cmp::Ordering::Equal,
            (Never, When(_)) => cmp::Ordering::Greater,
            (When(_), Never) => cmp::Ordering::Less,
            (When(a), When(b)) => a.cmp(b),
        }
    }
}
