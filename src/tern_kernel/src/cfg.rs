//! Kernel configuration
use crate::{priority, Priority, Ticks};

/// Kernel configuration, supplied to [`Kernel::new`](crate::Kernel::new).
///
/// ```
/// use tern_kernel::{priority, KernelCfg};
///
/// const CFG: KernelCfg = KernelCfg::new()
///     .time_quantum(20)
///     .main_priority(priority::NORMAL + 1);
/// # assert_eq!(CFG.time_quantum, 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCfg {
    /// The number of ticks a thread may run before yielding to a ready thread
    /// of the same priority. `0` disables round-robin scheduling.
    pub time_quantum: Ticks,

    /// The minimum distance (in ticks) between the current time and a
    /// programmed alarm. Shorter delays are rounded up so that the alarm is
    /// never set to a point the hardware timer has already passed.
    pub min_alarm_delta: Ticks,

    /// The priority of the main thread.
    pub main_priority: Priority,
}

impl KernelCfg {
    pub const fn new() -> Self {
        Self {
            time_quantum: 0,
            min_alarm_delta: 2,
            main_priority: priority::NORMAL,
        }
    }

    pub const fn time_quantum(self, time_quantum: Ticks) -> Self {
        Self {
            time_quantum,
            ..self
        }
    }

    pub const fn min_alarm_delta(self, min_alarm_delta: Ticks) -> Self {
        assert!(min_alarm_delta > 0, "`min_alarm_delta` must be non-zero");
        Self {
            min_alarm_delta,
            ..self
        }
    }

    pub const fn main_priority(self, main_priority: Priority) -> Self {
        assert!(
            main_priority > priority::IDLE,
            "the main thread can't run at the idle priority"
        );
        Self {
            main_priority,
            ..self
        }
    }
}

impl Default for KernelCfg {
    fn default() -> Self {
        Self::new()
    }
}
