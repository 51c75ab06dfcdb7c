//! Virtual timers
//!
//! Armed timers are kept in a *delta list*: each entry stores the number of
//! ticks between its predecessor's deadline (or, for the first entry, the
//! list's time base) and its own. A single one-shot hardware alarm is
//! programmed for the first entry.
//!
//! Every thread owns a timer that implements its blocking timeouts. Those are
//! managed internally; the [`Timer`] API only accepts timers created by
//! [`Kernel::create_timer`].
use core::fmt;

use crate::{
    klock::CpuLockGuard,
    state::State,
    utils::{
        intrusive_list::{Link, ListHead},
        pool::Linked,
    },
    Kernel, Port, ThreadId, Ticks,
};

define_id! {
    /// Identifies a virtual timer within a [`Kernel`].
    pub struct TimerId;
}

/// A timer callback. It runs in the alarm interrupt handler with the kernel
/// lock held, so it may only call I-class (`_from_isr`) operations.
pub type CallbackFn<P> = fn(&Kernel<P>, &mut CpuLockGuard<'_, P>, usize);

/// What happens when a timer fires.
pub(crate) enum TimerAction<P: Port> {
    /// Never set
    Idle,
    /// Time out a blocked thread
    Timeout(ThreadId),
    Callback(CallbackFn<P>, usize),
}

impl<P: Port> Clone for TimerAction<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for TimerAction<P> {}

impl<P: Port> fmt::Debug for TimerAction<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Timeout(thread) => f.debug_tuple("Timeout").field(thread).finish(),
            Self::Callback(_, arg) => f.debug_tuple("Callback").field(arg).finish(),
        }
    }
}

/// *Timer control block*
#[derive(Debug)]
pub(crate) struct TimerCb<P: Port> {
    /// The link in [`DeltaList`]. `Some(_)` iff the timer is armed.
    pub(crate) link: Option<Link<TimerId>>,

    /// Ticks since the previous entry's deadline. Only meaningful while armed.
    pub(crate) delta: Ticks,

    /// The period of a continuous timer, or `0` for a one-shot timer.
    pub(crate) reload: Ticks,

    pub(crate) action: TimerAction<P>,
}

impl<P: Port> TimerCb<P> {
    pub(crate) fn new(action: TimerAction<P>) -> Self {
        Self {
            link: None,
            delta: 0,
            reload: 0,
            action,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.link.is_some()
    }
}

impl<P: Port> Linked<TimerId> for TimerCb<P> {
    fn link(&self) -> &Option<Link<TimerId>> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Option<Link<TimerId>> {
        &mut self.link
    }
}

#[doc = svgbobdoc::transform!(
/// The list of armed timers, sorted by deadline.
///
/// Example: three timers due at `base + 5`, `base + 5`, and `base + 12`. `B`
/// was armed after `A`, so it fires after `A`.
///
/// ```svgbob
///   base          +5                    +12
///    |            |                      |
///    o------------+----------------------+----> time
///
///          .------------.   .------------.   .------------.
///  head -->| A  delta 5 |-->| B  delta 0 |-->| C  delta 7 |
///          '------------'   '------------'   '------------'
/// ```
)]
#[derive(Debug)]
pub(crate) struct DeltaList {
    head: ListHead<TimerId>,
    /// The point of time the first entry's `delta` is relative to.
    base: Ticks,
}

impl DeltaList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ListHead::new(),
            base: 0,
        }
    }
}

impl<P: Port> State<P> {
    /// Arm `timer` to fire `delay` ticks from now.
    pub(crate) fn vt_enqueue(&mut self, port: &P, timer: TimerId, delay: Ticks) {
        debug_assert!(!self.timers[timer].is_armed());

        let delay = delay.max(self.cfg.min_alarm_delta);
        let now = port.now();

        let Some(first) = self.vt.head.front() else {
            self.vt.base = now;
            self.timers[timer].delta = delay;
            self.vt.head.push_back(&mut self.timers, timer);
            port.arm_alarm(now.wrapping_add(delay));
            return;
        };

        let nowdelta = now.wrapping_sub(self.vt.base);
        let delta = nowdelta.saturating_add(delay);

        if delta < self.timers[first].delta {
            port.arm_alarm(now.wrapping_add(delay));
        }

        self.vt_insert(timer, delta);
    }

    /// Insert `timer` `delta` ticks after the time base. Doesn't touch the
    /// alarm.
    fn vt_insert(&mut self, timer: TimerId, mut delta: Ticks) {
        let mut at = self.vt.head.front();
        while let Some(p) = at {
            let p_delta = self.timers[p].delta;
            // `<=` keeps timers with equal deadlines in arming order
            if p_delta > delta {
                break;
            }
            delta -= p_delta;
            at = self.vt.head.next(&self.timers, p);
        }

        self.timers[timer].delta = delta;
        self.vt.head.insert(&mut self.timers, timer, at);
        if let Some(p) = at {
            self.timers[p].delta -= delta;
        }
    }

    /// Disarm `timer`.
    pub(crate) fn vt_dequeue(&mut self, port: &P, timer: TimerId) {
        let was_first = self.vt.head.front() == Some(timer);
        let next = self.vt.head.next(&self.timers, timer);
        let delta = self.timers[timer].delta;

        self.vt.head.remove(&mut self.timers, timer);

        let Some(next) = next else {
            if self.vt.head.is_empty() {
                port.disarm_alarm();
            }
            return;
        };

        let next_delta = self.timers[next].delta.saturating_add(delta);
        self.timers[next].delta = next_delta;

        if was_first {
            let now = port.now();
            let nowdelta = now.wrapping_sub(self.vt.base);
            // An overdue head is taken care of by the alarm that's already
            // programmed for an earlier point
            if nowdelta < next_delta {
                let remaining = (next_delta - nowdelta).max(self.cfg.min_alarm_delta);
                port.arm_alarm(now.wrapping_add(remaining));
            }
        }
    }

    /// Get the ticks left until `timer` fires.
    pub(crate) fn vt_remaining(&self, port: &P, timer: TimerId) -> Option<Ticks> {
        if !self.timers[timer].is_armed() {
            return None;
        }
        let mut deadline: Ticks = 0;
        for t in self.vt.head.iter(&self.timers) {
            deadline = deadline.saturating_add(self.timers[t].delta);
            if t == timer {
                break;
            }
        }
        let nowdelta = port.now().wrapping_sub(self.vt.base);
        Some(deadline.saturating_sub(nowdelta))
    }
}

impl<P: Port> Kernel<P> {
    /// The alarm interrupt handler. Fires every timer that is due and
    /// reprograms the alarm for the rest.
    ///
    /// The port calls this when the alarm set by [`Port::arm_alarm`] fires,
    /// and [`Self::interrupt_epilogue`] after releasing the lock.
    pub fn alarm_handler_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        loop {
            let (timer, action) = {
                let st = self.state(lock);
                let Some(first) = st.vt.head.front() else {
                    self.port.disarm_alarm();
                    return;
                };

                let now = self.port.now();
                let nowdelta = now.wrapping_sub(st.vt.base);
                let delta = st.timers[first].delta;

                if nowdelta < delta {
                    // Rebase onto the current time
                    let remaining = delta - nowdelta;
                    st.timers[first].delta = remaining;
                    st.vt.base = now;
                    self.port
                        .arm_alarm(now.wrapping_add(remaining.max(st.cfg.min_alarm_delta)));
                    return;
                }

                st.vt.head.pop_front(&mut st.timers);
                st.vt.base = st.vt.base.wrapping_add(delta);
                if st.vt.head.is_empty() {
                    self.port.disarm_alarm();
                }

                (first, st.timers[first].action)
            };

            match action {
                TimerAction::Idle => {}
                TimerAction::Timeout(thread) => {
                    log::trace!("{thread:?} timed out");
                    self.state(lock).timeout_expired(thread);
                }
                TimerAction::Callback(f, arg) => {
                    log::trace!("firing {timer:?}");
                    f(self, lock, arg);

                    // The callback may have re-armed or deleted the timer
                    let st = self.state(lock);
                    if let Some(cb) = st.timers.get(timer) {
                        if cb.reload > 0 && !cb.is_armed() {
                            // Relative to the deadline just passed, which is
                            // the current time base
                            let reload = cb.reload;
                            st.vt_insert(timer, reload);
                        }
                    }
                }
            }
        }
    }

    /// Create an unarmed timer.
    pub fn create_timer(&self) -> TimerId {
        let mut lock = self.lock();
        self.state(&mut lock)
            .timers
            .insert(TimerCb::new(TimerAction::Idle))
    }

    /// Delete a timer, disarming it first if necessary.
    pub fn delete_timer(&self, timer: TimerId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        expect_user_timer(st, timer);
        if st.timers[timer].is_armed() {
            st.vt_dequeue(&self.port, timer);
        }
        st.timers.remove(timer);
    }

    /// Get a handle to operate on a timer created by [`Self::create_timer`].
    pub fn timer(&self, id: TimerId) -> Timer<'_, P> {
        Timer { kernel: self, id }
    }
}

#[track_caller]
fn expect_user_timer<P: Port>(st: &State<P>, timer: TimerId) {
    assert!(
        !matches!(st.timers[timer].action, TimerAction::Timeout(_)),
        "{timer:?} is a thread timeout timer"
    );
}

/// A handle to a virtual timer.
pub struct Timer<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: TimerId,
}

impl<P: Port> fmt::Debug for Timer<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Timer").field(&self.id).finish()
    }
}

impl<'k, P: Port> Timer<'k, P> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Arm the timer to call `f(kernel, lock, arg)` once, `delay` ticks from
    /// now. An armed timer is re-armed.
    pub fn set(&self, delay: Ticks, f: CallbackFn<P>, arg: usize) {
        let mut lock = self.kernel.lock();
        self.set_from_isr(&mut lock, delay, f, arg);
    }

    /// Arm the timer to call `f(kernel, lock, arg)` every `period` ticks. The
    /// first call happens `period` ticks from now.
    pub fn set_continuous(&self, period: Ticks, f: CallbackFn<P>, arg: usize) {
        let mut lock = self.kernel.lock();
        self.set_continuous_from_isr(&mut lock, period, f, arg);
    }

    /// Disarm the timer. Does nothing if it's not armed.
    pub fn reset(&self) {
        let mut lock = self.kernel.lock();
        self.reset_from_isr(&mut lock);
    }

    pub fn is_armed(&self) -> bool {
        let mut lock = self.kernel.lock();
        self.kernel.state(&mut lock).timers[self.id].is_armed()
    }

    /// Get the number of ticks until the timer fires, or `None` if it's not
    /// armed.
    pub fn remaining(&self) -> Option<Ticks> {
        let mut lock = self.kernel.lock();
        self.kernel
            .state(&mut lock)
            .vt_remaining(&self.kernel.port, self.id)
    }

    pub fn set_from_isr(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        delay: Ticks,
        f: CallbackFn<P>,
        arg: usize,
    ) {
        self.arm(lock, delay, 0, f, arg);
    }

    pub fn set_continuous_from_isr(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        period: Ticks,
        f: CallbackFn<P>,
        arg: usize,
    ) {
        assert!(period > 0, "a continuous timer needs a non-zero period");
        self.arm(lock, period, period, f, arg);
    }

    pub fn reset_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.kernel.state(lock);
        expect_user_timer(st, self.id);
        let cb = &mut st.timers[self.id];
        cb.reload = 0;
        if cb.is_armed() {
            st.vt_dequeue(&self.kernel.port, self.id);
        }
    }

    fn arm(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        delay: Ticks,
        reload: Ticks,
        f: CallbackFn<P>,
        arg: usize,
    ) {
        let st = self.kernel.state(lock);
        expect_user_timer(st, self.id);
        if st.timers[self.id].is_armed() {
            st.vt_dequeue(&self.kernel.port, self.id);
        }
        let cb = &mut st.timers[self.id];
        cb.reload = reload;
        cb.action = TimerAction::Callback(f, arg);
        st.vt_enqueue(&self.kernel.port, self.id, delay);
    }
}
