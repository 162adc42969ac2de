//! Counting semaphores (C4): ceiling-bounded count plus a FIFO-or-priority
//! wait list of blocked `sm_p` callers.
//!
//! Grounded on `r3_kernel::semaphore`, generalized from its const-generic
//! `System<Traits>` object table to a runtime [`crate::pool::Pool`] entry
//! addressed by [`Id`], per the spec's Design Notes on dynamic object
//! arenas.
use bitflags::bitflags;

use nimbus_hal::{Hal, Id, KernelError, Result};

use crate::wait::{WaitOrder, WaitQueue, WakeReason};
use crate::{KState, Step};

bitflags! {
    /// Shared namespace between `sm_create`'s ordering bit and `sm_p`'s
    /// wait bit, matching the original header's flag reuse.
    pub struct SemFlags: u32 {
        const FIFO = 0;
        const PRIOR = 0x02;
        const NOWAIT = 0x01;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemOrder {
    Fifo,
    Priority,
}

impl SemFlags {
    pub fn order(self) -> SemOrder {
        if self.contains(SemFlags::PRIOR) {
            SemOrder::Priority
        } else {
            SemOrder::Fifo
        }
    }

    pub fn no_wait(self) -> bool {
        self.contains(SemFlags::NOWAIT)
    }
}

pub(crate) struct Semaphore {
    pub name: [u8; 4],
    pub count: u32,
    pub ceiling: u32,
    pub waiters: WaitQueue,
}

/// Drop `task` from `sem`'s wait list without waking it, used when a
/// blocked task is deleted or reset out from under its wait.
pub(crate) fn remove_waiter<H: Hal>(st: &mut KState<H>, sem: Id, task: Id) {
    if let Some(s) = st.semaphores.get_mut(sem) {
        s.waiters.remove(&mut st.tasks, task);
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn sm_create(&self, name: [u8; 4], initial_count: u32, ceiling: Option<u32>, flags: SemFlags) -> Result<Id> {
        self.run(move |_k, st| {
            let ceiling = ceiling.unwrap_or(st.cfg.default_semaphore_ceiling);
            let sem = Semaphore {
                name,
                count: initial_count.min(ceiling),
                ceiling,
                waiters: WaitQueue::new(match flags.order() {
                    SemOrder::Fifo => WaitOrder::Fifo,
                    SemOrder::Priority => WaitOrder::Priority,
                }),
            };
            match st.semaphores.insert(sem) {
                Some(id) => Step::Done(Ok(id)),
                None => Step::Done(Err(KernelError::NoScb)),
            }
        })
    }

    pub fn sm_delete(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let Some(sem) = st.semaphores.get_mut(id) else {
                return Step::Done(Err(KernelError::ObjId));
            };
            let waiters = sem.waiters.drain(&mut st.tasks);
            st.semaphores.remove(id);
            for w in waiters {
                crate::task::wake_task(st, w, WakeReason::ObjectDeleted);
            }
            st.preempt_pending = true;
            Step::Done(Ok(()))
        })
    }

    pub fn sm_ident(&self, name: [u8; 4]) -> Result<Id> {
        self.run(move |_k, st| {
            for (id, sem) in st.semaphores.iter() {
                if sem.name == name {
                    return Step::Done(Ok(id));
                }
            }
            Step::Done(Err(KernelError::ObjNotFound))
        })
    }

    pub fn sm_p(&self, id: Id, flags: SemFlags, timeout: u32) -> Result<()> {
        self.run(move |k, st| {
            let Some(sem) = st.semaphores.get_mut(id) else {
                return Step::Done(Err(KernelError::ObjId));
            };
            if sem.count > 0 {
                sem.count -= 1;
                return Step::Done(Ok(()));
            }
            if flags.no_wait() {
                return Step::Done(Err(KernelError::NoSem));
            }
            let running = st.running.unwrap();
            let priority = st.tasks.get(running).unwrap().priority;
            let sem = st.semaphores.get_mut(id).unwrap();
            sem.waiters.enqueue(&mut st.tasks, running, priority);
            crate::task::block_current(
                k,
                st,
                crate::wait::WaitingOn::Semaphore(id),
                timeout as u64,
                // A semaphore deletion out from under a blocked waiter is
                // `SemDeleted`, not the generic `ObjDeleted` every other
                // wait path reports (spec §4.4).
                |_st, reason| match reason {
                    WakeReason::Granted => Ok(()),
                    WakeReason::TimedOut => Err(KernelError::Timeout),
                    WakeReason::ObjectDeleted => Err(KernelError::SemDeleted),
                },
            )
        })
    }

    /// If a waiter is queued, dequeues and wakes it, transferring
    /// ownership without touching `count` at all (spec §4.4: "the count
    /// remains unchanged"). Otherwise increments `count` up to the
    /// ceiling. Never blocks.
    pub fn sm_v(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let Some(sem) = st.semaphores.get_mut(id) else {
                return Step::Done(Err(KernelError::ObjId));
            };
            if let Some(waiter) = sem.waiters.pop_front(&mut st.tasks) {
                crate::task::wake_task(st, waiter, WakeReason::Granted);
            } else {
                sem.count = (sem.count + 1).min(sem.ceiling);
            }
            st.preempt_pending = true;
            Step::Done(Ok(()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_bit_selects_priority_queue() {
        assert_eq!(SemFlags::PRIOR.order(), SemOrder::Priority);
        assert_eq!(SemFlags::FIFO.order(), SemOrder::Fifo);
    }

    #[test]
    fn nowait_bit_is_independent_of_order_bit() {
        let f = SemFlags::PRIOR | SemFlags::NOWAIT;
        assert!(f.no_wait());
        assert_eq!(f.order(), SemOrder::Priority);
    }
}
