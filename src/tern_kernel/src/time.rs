//! System time and timeouts
use core::fmt;

/// A point of system time or an interval, measured in ticks.
///
/// System time wraps around on overflow. Compare two points of time only via
/// their wrapping difference.
pub type Ticks = u32;

/// A timeout for a blocking operation.
///
/// Besides finite intervals there are two special values. [`Timeout::IMMEDIATE`]
/// makes the operation fail with [`WaitError::Timeout`] instead of blocking,
/// and [`Timeout::INFINITE`] lets it block until it completes or is reset.
///
/// [`WaitError::Timeout`]: crate::WaitError::Timeout
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout(u32);

impl Timeout {
    /// Do not block.
    pub const IMMEDIATE: Self = Self(0);

    /// Block without a time limit.
    pub const INFINITE: Self = Self(u32::MAX);

    /// Construct a `Timeout` of `ticks` ticks. `0` is equivalent to
    /// [`Self::IMMEDIATE`], and `u32::MAX` to [`Self::INFINITE`].
    #[inline]
    pub const fn ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn is_immediate(self) -> bool {
        self.0 == Self::IMMEDIATE.0
    }

    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == Self::INFINITE.0
    }

    /// Get the interval in ticks. Returns `None` if `self` is infinite.
    #[inline]
    pub const fn as_ticks(self) -> Option<Ticks> {
        if self.is_infinite() {
            None
        } else {
            Some(self.0)
        }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::IMMEDIATE => f.write_str("IMMEDIATE"),
            Self::INFINITE => f.write_str("INFINITE"),
            Self(ticks) => write!(f, "{ticks} ticks"),
        }
    }
}

/// A time budget shared by the steps of a multi-step operation, such as a
/// bulk queue transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Ticks,
    timeout: Timeout,
}

impl Deadline {
    #[inline]
    pub(crate) fn new(now: Ticks, timeout: Timeout) -> Self {
        Self {
            start: now,
            timeout,
        }
    }

    /// Get the timeout for the next step. [`Timeout::INFINITE`] and
    /// [`Timeout::IMMEDIATE`] are passed through unchanged. An exhausted
    /// budget yields [`Timeout::IMMEDIATE`], so the step still succeeds if it
    /// doesn't have to block.
    pub(crate) fn remaining(self, now: Ticks) -> Timeout {
        match self.timeout.as_ticks() {
            None => self.timeout,
            Some(total) => total
                .checked_sub(now.wrapping_sub(self.start))
                .map_or(Timeout::IMMEDIATE, Timeout::ticks),
        }
    }
}

/// Check whether `time` falls in the half-open window `start..end`, taking
/// wrap-around into account.
#[inline]
pub const fn is_time_within(time: Ticks, start: Ticks, end: Ticks) -> bool {
    time.wrapping_sub(start) < end.wrapping_sub(start)
}
