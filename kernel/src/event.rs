//! Per-task event flags (C6): a 32-bit sticky pending mask and an
//! ALL/ANY wait condition, one slot per task rather than a standalone
//! object pool.
//!
//! Grounded on `r3_kernel`'s event-group-less design note that per-task
//! signaling doesn't need its own object pool at all — unlike
//! semaphores and queues, an event slot is just two more fields on the
//! TCB, so this module holds only the wake-condition logic, not a
//! container.
use bitflags::bitflags;

use nimbus_hal::{Hal, Id, KernelError, Result};

use crate::task::TaskState;
use crate::wait::WakeReason;
use crate::{KState, Step};

/// The mask type shared by `ev_send`'s `mask` and `ev_receive`'s `mask`
/// and `out` — plain bits, not a bitflags type, since the meaning of
/// each bit is entirely application-defined.
pub type EventFlags = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    All,
    Any,
}

bitflags! {
    /// `ev_receive`'s flag word. `WAIT`/`ALL` are both the zero bit, per
    /// the original header, so they're expressed as zero-valued
    /// constants rather than flags that can be tested with `contains`.
    pub struct EvRecvFlags: u32 {
        const WAIT = 0;
        const NOWAIT = 0x01;
        const ALL = 0;
        const ANY = 0x02;
    }
}

impl EvRecvFlags {
    pub fn condition(self) -> WaitCondition {
        if self.contains(EvRecvFlags::ANY) {
            WaitCondition::Any
        } else {
            WaitCondition::All
        }
    }

    pub fn no_wait(self) -> bool {
        self.contains(EvRecvFlags::NOWAIT)
    }
}

fn satisfied(pending: EventFlags, waiting: EventFlags, condition: WaitCondition) -> bool {
    match condition {
        WaitCondition::All => pending & waiting == waiting,
        WaitCondition::Any => pending & waiting != 0,
    }
}

/// Merge `mask` into `task`'s pending events and, if it is currently
/// blocked waiting on events whose condition is now satisfied, wake it.
/// Shared by the public `ev_send` syscall and by timer-driven
/// `tm_ev*` delivery, which bypasses `ev_send`'s task-id validation
/// (the timer already holds a live task id).
pub(crate) fn deliver_events<H: Hal>(st: &mut KState<H>, task: Id, mask: EventFlags) {
    let Some(t) = st.tasks.get_mut(task) else { return };
    t.pending_events |= mask;
    if t.state != TaskState::Blocked || t.waiting_on != Some(crate::wait::WaitingOn::Event) {
        return;
    }
    if !satisfied(t.pending_events, t.waiting_events, t.wait_condition) {
        return;
    }
    let received = t.pending_events & t.waiting_events;
    t.pending_events &= !received;
    t.last_received_events = received;
    crate::task::wake_task(st, task, WakeReason::Granted);
}

impl<H: Hal> crate::Kernel<H> {
    /// Set bits in `tid`'s pending event mask, waking it if its current
    /// wait (if any) is now satisfied. Never blocks the caller.
    pub fn ev_send(&self, tid: Id, mask: EventFlags) -> Result<()> {
        self.run(move |_k, st| {
            if st.tasks.get(tid).is_none() {
                return Step::Done(Err(KernelError::ObjId));
            }
            deliver_events(st, tid, mask);
            st.preempt_pending = true;
            Step::Done(Ok(()))
        })
    }

    /// Wait for `mask`'s bits to satisfy `flags`'s condition against the
    /// calling task's pending events, returning the bits that satisfied
    /// it. `mask == 0` is rejected as ill-formed (spec §8 boundary
    /// behavior).
    pub fn ev_receive(&self, mask: EventFlags, flags: EvRecvFlags, timeout: u32) -> Result<EventFlags> {
        if mask == 0 {
            return Err(KernelError::NoEvents);
        }
        let condition = flags.condition();
        self.run(move |k, st| {
            let running = st.running.unwrap();
            let task = st.tasks.get_mut(running).unwrap();
            if satisfied(task.pending_events, mask, condition) {
                let received = task.pending_events & mask;
                task.pending_events &= !received;
                return Step::Done(Ok(received));
            }
            if flags.no_wait() {
                return Step::Done(Err(KernelError::NoEvents));
            }
            {
                let task = st.tasks.get_mut(running).unwrap();
                task.waiting_events = mask;
                task.wait_condition = condition;
            }
            crate::task::block_current(
                k,
                st,
                crate::wait::WaitingOn::Event,
                timeout as u64,
                move |st, reason| match reason {
                    WakeReason::Granted => {
                        let task = st.tasks.get_mut(running).unwrap();
                        Ok(core::mem::take(&mut task.last_received_events))
                    }
                    WakeReason::TimedOut => Err(KernelError::Timeout),
                    WakeReason::ObjectDeleted => Err(KernelError::ObjDeleted),
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_condition_requires_every_bit() {
        assert!(!satisfied(0x03, 0x0F, WaitCondition::All));
        assert!(satisfied(0x0F, 0x0F, WaitCondition::All));
    }

    #[test]
    fn any_condition_requires_one_bit() {
        assert!(satisfied(0x03, 0x0F, WaitCondition::Any));
        assert!(!satisfied(0x00, 0x0F, WaitCondition::Any));
    }
}
