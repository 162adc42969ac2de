//! The timer wheel (C3): a single sorted list of pending expirations
//! driving both scheduled wakeups and periodic/absolute event delivery.
//!
//! Grounded on `r3_kernel::timeout`, which keeps one global sorted
//! intrusive list and reinserts periodic entries at `deadline + period`
//! on expiry; this module keeps the same shape but as a plain sorted
//! `Vec<Id>` over a `Pool<Timer>`, since timer counts in a microkernel
//! workload are small and spec §8 only requires the list stay
//! non-decreasing by expiration, not any particular data structure.
use alloc::vec::Vec;

use nimbus_hal::{Hal, Id, KernelError, Result};

use crate::clock::WallClock;
use crate::task::TaskState;
use crate::wait::WakeReason;
use crate::{KState, Kernel, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Periodic,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Wakeup(Id),
    SendEvents(Id, u32),
}

pub(crate) struct Timer {
    pub kind: TimerKind,
    pub action: TimerAction,
    pub expire: u64,
    pub period: Option<u64>,
}

/// Kept sorted ascending by `expire` (spec §8 invariant 6).
pub(crate) struct TimerList(Vec<Id>);

impl TimerList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, timers: &crate::pool::Pool<Timer>, id: Id) {
        let expire = timers.get(id).unwrap().expire;
        let pos = self
            .0
            .partition_point(|&t| timers.get(t).unwrap().expire <= expire);
        self.0.insert(pos, id);
    }

    pub fn remove(&mut self, id: Id) {
        if let Some(pos) = self.0.iter().position(|&t| t == id) {
            self.0.remove(pos);
        }
    }

    pub fn peek(&self) -> Option<Id> {
        self.0.first().copied()
    }

    pub fn pop_front(&mut self) -> Option<Id> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm a one-shot `Wakeup` timer for `task` at `deadline`, returning its
/// id, or `None` if the timer pool is exhausted (in which case the
/// blocking call proceeds without an enforced timeout rather than
/// failing outright — a documented degradation, not spec-mandated
/// behavior for an edge case the spec doesn't otherwise cover).
pub(crate) fn arm_timeout<H: Hal>(st: &mut KState<H>, task: Id, deadline: u64) -> Option<Id> {
    let timer = Timer {
        kind: TimerKind::OneShot,
        action: TimerAction::Wakeup(task),
        expire: deadline,
        period: None,
    };
    let id = st.timers.insert(timer)?;
    st.timer_list.insert(&st.timers, id);
    Some(id)
}

pub(crate) fn cancel_timer<H: Hal>(st: &mut KState<H>, id: Id) {
    st.timer_list.remove(id);
    st.timers.remove(id);
}

impl<H: Hal> Kernel<H> {
    fn arm_alarm_for_head(&self, st: &KState<H>) {
        match st.timer_list.peek() {
            Some(id) => self.hal.alarm_set(st.timers.get(id).unwrap().expire),
            None => self.hal.alarm_clear(),
        }
    }

    /// Advance the clock by one tick, fire every timer now due, and run
    /// the time-slice check. This is the function wired up to
    /// `Hal::tick_source_start` in [`Kernel::start`], and is also the
    /// implementation behind the public `tm_tick` syscall for backends
    /// (or tests) that want to drive the clock manually rather than via a
    /// real tick source.
    pub fn tm_tick(&self) {
        self.hal.critical_enter();
        let st = self.state_mut();
        st.clock.advance(1);
        let now = st.clock.now_ticks();
        let mut woke_any = false;
        loop {
            let Some(id) = st.timer_list.peek() else { break };
            let due = st.timers.get(id).unwrap().expire <= now;
            if !due {
                break;
            }
            st.timer_list.pop_front();
            let timer = st.timers.remove(id).unwrap();
            match timer.action {
                TimerAction::Wakeup(task) => {
                    if matches!(st.tasks.get(task).map(|t| t.state), Some(TaskState::Blocked)) {
                        crate::task::wake_task(st, task, WakeReason::TimedOut);
                        woke_any = true;
                    }
                }
                TimerAction::SendEvents(task, mask) => {
                    crate::event::deliver_events(st, task, mask);
                    woke_any = true;
                }
            }
            if let Some(period) = timer.period {
                let mut next = timer.expire + period;
                if next <= now {
                    // we fell behind by at least one full period; resync
                    // rather than fire a burst of catch-up expirations
                    next = now + period;
                }
                let new_id = st
                    .timers
                    .insert(Timer {
                        kind: timer.kind,
                        action: timer.action,
                        expire: next,
                        period: timer.period,
                    })
                    .expect("reinserting a just-removed timer cannot exceed capacity");
                st.timer_list.insert(&st.timers, new_id);
            }
        }
        self.tick_time_slice(st);
        if woke_any {
            self.reschedule_if_needed(st);
        }
        self.arm_alarm_for_head(st);
        self.hal.critical_exit();
    }

    pub fn tm_get(&self) -> WallClock {
        self.hal.critical_enter();
        let w = self.state_mut().clock.get();
        self.hal.critical_exit();
        w
    }

    pub fn tm_set(&self, wall: WallClock) -> Result<()> {
        self.run(move |_k, st| {
            st.clock.set(wall);
            Step::Done(Ok(()))
        })
    }

    /// Caller-suspending sleep. `ticks == 0` is rejected (`IllTicks`): the
    /// "0 means infinite" quirk applies only to the `*_receive`/`sm_p`
    /// family, not to an explicit sleep, which would otherwise never wake.
    pub fn tm_wkafter(&self, ticks: u32) -> Result<()> {
        if ticks == 0 {
            return Err(KernelError::IllTicks);
        }
        self.run(move |k, st| {
            crate::task::block_current(k, st, crate::wait::WaitingOn::Timer, ticks as u64, |_st, reason| {
                // A bare sleep has no object to be granted by or have
                // deleted out from under it — the timer firing *is* the
                // successful outcome, not a timeout error.
                match reason {
                    WakeReason::TimedOut | WakeReason::Granted => Ok(()),
                    WakeReason::ObjectDeleted => Err(KernelError::ObjDeleted),
                }
            })
        })
    }

    pub fn tm_wkwhen(&self, target: WallClock) -> Result<()> {
        self.run(move |k, st| {
            let deadline = st.clock.abs_tick_for(target).unwrap_or(st.clock.now_ticks());
            let now = st.clock.now_ticks();
            if deadline <= now {
                return Step::Done(Ok(()));
            }
            crate::task::block_current(
                k,
                st,
                crate::wait::WaitingOn::Timer,
                deadline - now,
                |_st, reason| match reason {
                    WakeReason::TimedOut | WakeReason::Granted => Ok(()),
                    WakeReason::ObjectDeleted => Err(KernelError::ObjDeleted),
                },
            )
        })
    }

    pub fn tm_evafter(&self, ticks: u32, mask: u32) -> Result<Id> {
        if ticks == 0 {
            return Err(KernelError::IllTicks);
        }
        self.run(move |_k, st| {
            let running = st.running.unwrap();
            let deadline = st.clock.now_ticks() + ticks as u64;
            let timer = Timer {
                kind: TimerKind::OneShot,
                action: TimerAction::SendEvents(running, mask),
                expire: deadline,
                period: None,
            };
            match st.timers.insert(timer) {
                Some(id) => {
                    st.timer_list.insert(&st.timers, id);
                    Step::Done(Ok(id))
                }
                None => Step::Done(Err(KernelError::BadTimerId)),
            }
        })
    }

    pub fn tm_evevery(&self, ticks: u32, mask: u32) -> Result<Id> {
        if ticks == 0 {
            return Err(KernelError::IllTicks);
        }
        self.run(move |_k, st| {
            let running = st.running.unwrap();
            let deadline = st.clock.now_ticks() + ticks as u64;
            let timer = Timer {
                kind: TimerKind::Periodic,
                action: TimerAction::SendEvents(running, mask),
                expire: deadline,
                period: Some(ticks as u64),
            };
            match st.timers.insert(timer) {
                Some(id) => {
                    st.timer_list.insert(&st.timers, id);
                    Step::Done(Ok(id))
                }
                None => Step::Done(Err(KernelError::BadTimerId)),
            }
        })
    }

    pub fn tm_evwhen(&self, target: WallClock, mask: u32) -> Result<Id> {
        self.run(move |_k, st| {
            let running = st.running.unwrap();
            let deadline = st.clock.abs_tick_for(target).unwrap_or(st.clock.now_ticks());
            let timer = Timer {
                kind: TimerKind::Absolute,
                action: TimerAction::SendEvents(running, mask),
                expire: deadline,
                period: None,
            };
            match st.timers.insert(timer) {
                Some(id) => {
                    st.timer_list.insert(&st.timers, id);
                    Step::Done(Ok(id))
                }
                None => Step::Done(Err(KernelError::BadTimerId)),
            }
        })
    }

    /// Cancel a timer by id. For a `Wakeup` timer whose task is still
    /// blocked, this leaves the task blocked (spec §4.3: "leaves the task
    /// blocked so a subsequent signal or timeout can deliver") — it's only
    /// meaningful to cancel a wakeup timer that something else raced to
    /// remove already, so no special-casing is needed: the task's own
    /// `timeout_timer` link and this list entry are both just dropped.
    pub fn tm_cancel(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            if st.timers.get(id).is_none() {
                return Step::Done(Err(KernelError::BadTimerId));
            }
            if let TimerAction::Wakeup(task) = st.timers.get(id).unwrap().action {
                if let Some(t) = st.tasks.get_mut(task) {
                    if t.timeout_timer == Some(id) {
                        t.timeout_timer = None;
                    }
                }
            }
            cancel_timer(st, id);
            Step::Done(Ok(()))
        })
    }
}
