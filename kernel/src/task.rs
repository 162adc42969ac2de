//! Tasks (C2): the TCB pool, the priority scheduler, and the blocking
//! protocol shared by every IPC object.
//!
//! Grounded on `r3_kernel::task`, which splits the same way into "the
//! public syscalls" (`impl<Traits> System<Traits>`) and "the scheduler
//! internals" (bare functions taking an already-acquired CPU-Lock guard).
use alloc::boxed::Box;
use bitflags::bitflags;

use nimbus_hal::{EntryArgs, Hal, Id, KernelError, Result, TaskEntry};

use crate::event::WaitCondition;
use crate::links::IntrusiveLinks;
use crate::pool::Pool;
use crate::wait::{WaitingOn, WakeReason};
use crate::{KState, Kernel, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    Created,
    Ready,
    Running,
    Suspended,
    Blocked,
    Deleted,
}

bitflags! {
    /// Per-task mode bits, shared between `t_create`'s initial flags and
    /// `t_mode`'s live mask/new-bits update.
    pub struct ModeFlags: u32 {
        const NO_PREEMPT = 0x01;
        const TIME_SLICE = 0x02;
        const NO_ASR = 0x04;
        const NO_ISR = 0x100;
    }
}

/// Flags accepted by `t_create`. Distinct type from [`ModeFlags`] even
/// though the bit layout matches: the original header documents `T_FPU =
/// 0x02` as aliasing `T_TSLICE` in the create-time namespace specifically,
/// a historical quirk this kernel doesn't give any behavior to (no FPU
/// context exists to lazily save).
pub type TaskCreateFlags = ModeFlags;

bitflags! {
    pub struct FatalFlags: u32 {
        const NONE = 0;
    }
}

pub(crate) struct Task<H: Hal> {
    pub name: [u8; 4],
    pub priority: u8,
    pub state: TaskState,
    /// Set between `t_suspend` and a matching `t_resume`. Orthogonal to
    /// `state`: a task can be explicitly suspended while it is also
    /// blocked on an IPC object, in which case `state` stays `Blocked`
    /// until the wait resolves (spec §4.2: resume "returns to Ready if
    /// not also waiting on an object").
    pub explicit_suspend: bool,
    pub mode: ModeFlags,
    pub regs: [u32; 7],
    pub pending_events: u32,
    pub waiting_events: u32,
    pub wait_condition: WaitCondition,
    /// Bits delivered by the `ev_send`/timer path that woke this task,
    /// consumed by `ev_receive`'s `finish` closure on the way out.
    pub last_received_events: u32,
    /// Set by `q_broadcast` for a task it wakes directly (bypassing the
    /// ring buffer entirely), consumed by `q_receive`'s `finish` closure
    /// in place of the usual retry-dequeue.
    pub broadcast_msg: Option<crate::queue::Message>,
    pub waiting_on: Option<WaitingOn>,
    pub timeout_timer: Option<Id>,
    pub wake_reason: Option<WakeReason>,
    pub ctx: H::Context,
    pub started: bool,
    pub entry: Option<(TaskEntry, EntryArgs)>,
    pub stack_size: usize,
    pub link_next: Option<Id>,
    pub link_prev: Option<Id>,
    pub slice_budget: u32,
    pub slice_remaining: u32,
}

impl<H: Hal> Task<H> {
    pub fn new_idle(hal: &H, entry: TaskEntry) -> Self {
        let ctx = hal.context_create(4096, entry, [0; 4]);
        Self {
            name: *b"idle",
            priority: 255,
            state: TaskState::Running,
            explicit_suspend: false,
            mode: ModeFlags::empty(),
            regs: [0; 7],
            pending_events: 0,
            waiting_events: 0,
            wait_condition: WaitCondition::Any,
            last_received_events: 0,
            broadcast_msg: None,
            waiting_on: None,
            timeout_timer: None,
            wake_reason: None,
            ctx,
            started: true,
            entry: Some((entry, [0; 4])),
            stack_size: 4096,
            link_next: None,
            link_prev: None,
            slice_budget: 0,
            slice_remaining: 0,
        }
    }

    pub fn is_ready_for_dispatch(&self) -> bool {
        self.state == TaskState::Ready && !self.explicit_suspend
    }
}

impl<H: Hal> IntrusiveLinks for Pool<Task<H>> {
    fn links_mut(&mut self, id: Id) -> (&mut Option<Id>, &mut Option<Id>) {
        let t = self.get_mut(id).expect("intrusive link on freed task");
        (&mut t.link_next, &mut t.link_prev)
    }
    fn links(&self, id: Id) -> (Option<Id>, Option<Id>) {
        let t = self.get(id).expect("intrusive link on freed task");
        (t.link_next, t.link_prev)
    }
    fn priority(&self, id: Id) -> u8 {
        self.get(id).expect("intrusive link on freed task").priority
    }
}

/// Block the running task, recording `waiting_on` and (if `timeout_ticks`
/// is `Some`) arming a deadline in the timer wheel. Returns the [`Step`]
/// the calling syscall should return: either done immediately (never, for
/// this helper — it always blocks) is not applicable here, so this always
/// yields `Step::Block`.
///
/// The caller is responsible for having already linked the task into the
/// object's wait queue *before* calling this; `block_current` only
/// updates scheduler-visible state (readiness, timer, context switch).
pub(crate) fn block_current<H: Hal, T: 'static>(
    kernel: &Kernel<H>,
    st: &mut KState<H>,
    waiting_on: WaitingOn,
    timeout_ticks: u64,
    finish: impl FnOnce(&mut KState<H>, WakeReason) -> Result<T> + 'static,
) -> Step<H, T> {
    let running = st.running.expect("block_current called outside task context");
    {
        let task = st.tasks.get_mut(running).unwrap();
        task.state = TaskState::Blocked;
        task.waiting_on = Some(waiting_on);
        task.wake_reason = None;
    }
    if timeout_ticks != 0 {
        let deadline = st.clock.now_ticks() + timeout_ticks;
        let timer_id = crate::timer::arm_timeout(st, running, deadline);
        st.tasks.get_mut(running).unwrap().timeout_timer = timer_id;
    }

    let next = dispatch_next(st);
    let prev_ctx = st.tasks.get(running).unwrap().ctx.clone();
    let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
    st.running = Some(next);
    st.tasks.get_mut(next).unwrap().state = TaskState::Running;

    Step::Block {
        prev_ctx: Some(prev_ctx),
        next_ctx,
        finish: Box::new(move |st| {
            let reason = st
                .tasks
                .get_mut(running)
                .unwrap()
                .wake_reason
                .take()
                .expect("task resumed without a wake reason");
            finish(st, reason)
        }),
    }
}

/// Pop the highest-priority ready task, falling back to the idle task if
/// the ready queue is empty (spec §4.2: the idle task "never blocks", so
/// this can never return `None`).
pub(crate) fn dispatch_next<H: Hal>(st: &mut KState<H>) -> Id {
    match st.ready.pop_highest(&mut st.tasks) {
        Some((_, id)) => id,
        None => st.idle_task,
    }
}

/// Wake `id` with `reason`, removing it from whatever wait/timer
/// bookkeeping it was in. If the task is explicitly suspended, it becomes
/// `Suspended` (holding `reason` for delivery once resumed) rather than
/// `Ready`. Returns `true` if the task was made `Ready` and should cause a
/// preemption check.
pub(crate) fn wake_task<H: Hal>(st: &mut KState<H>, id: Id, reason: WakeReason) -> bool {
    let (explicit_suspend, timer) = {
        let task = st.tasks.get_mut(id).unwrap();
        task.waiting_on = None;
        task.wake_reason = Some(reason);
        (task.explicit_suspend, task.timeout_timer.take())
    };
    if let Some(t) = timer {
        crate::timer::cancel_timer(st, t);
    }
    if explicit_suspend {
        st.tasks.get_mut(id).unwrap().state = TaskState::Suspended;
        false
    } else {
        let prio = {
            let task = st.tasks.get_mut(id).unwrap();
            task.state = TaskState::Ready;
            task.priority
        };
        st.ready.push_back(&mut st.tasks, prio, id);
        st.preempt_pending = true;
        true
    }
}

impl<H: Hal> Kernel<H> {
    pub fn t_create(
        &self,
        name: [u8; 4],
        priority: u8,
        sys_stack: usize,
        usr_stack: usize,
        flags: TaskCreateFlags,
    ) -> Result<Id> {
        self.run(move |_k, st| {
            if priority == 0 {
                return Step::Done(Err(KernelError::Priority));
            }
            let total = sys_stack.saturating_add(usr_stack);
            if total < st.cfg.min_stack_bytes {
                return Step::Done(Err(KernelError::TinyStack));
            }
            if total == 0 {
                return Step::Done(Err(KernelError::NoStack));
            }
            let ctx = self.hal.context_create(total, noop_entry, [0; 4]);
            let quantum = st.cfg.time_slice_ticks;
            let mut task = Task {
                name,
                priority,
                state: TaskState::Created,
                explicit_suspend: false,
                mode: flags,
                regs: [0; 7],
                pending_events: 0,
                waiting_events: 0,
                wait_condition: WaitCondition::Any,
                last_received_events: 0,
                broadcast_msg: None,
                waiting_on: None,
                timeout_timer: None,
                wake_reason: None,
                ctx,
                started: false,
                entry: None,
                stack_size: total,
                link_next: None,
                link_prev: None,
                slice_budget: 0,
                slice_remaining: 0,
            };
            sync_slice_budget(&mut task, quantum);
            match st.tasks.insert(task) {
                Some(id) => Step::Done(Ok(id)),
                None => Step::Done(Err(KernelError::NoTcb)),
            }
        })
    }

    pub fn t_start(&self, id: Id, mode: ModeFlags, entry: TaskEntry, args: EntryArgs) -> Result<()> {
        self.run(move |_k, st| {
            let quantum = st.cfg.time_slice_ticks;
            let task = match st.tasks.get_mut(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => t,
                Some(_) => return Step::Done(Err(KernelError::ObjDeleted)),
                None => return Step::Done(Err(KernelError::ObjId)),
            };
            if task.started && task.state != TaskState::Created {
                return Step::Done(Err(KernelError::Active));
            }
            task.mode = mode;
            task.entry = Some((entry, args));
            task.started = true;
            let prio = task.priority;
            task.ctx = self.hal.context_create(task.stack_size, entry, args);
            task.state = TaskState::Ready;
            sync_slice_budget(task, quantum);
            st.ready.push_back(&mut st.tasks, prio, id);
            st.preempt_pending = true;
            Step::Done(Ok(()))
        })
    }

    pub fn t_delete(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let task = match st.tasks.get(id) {
                Some(t) => t,
                None => return Step::Done(Err(KernelError::ObjId)),
            };
            if task.state == TaskState::Free || task.state == TaskState::Deleted {
                return Step::Done(Err(KernelError::ObjDeleted));
            }
            match task.state {
                TaskState::Ready => {
                    let prio = task.priority;
                    st.ready.remove(&mut st.tasks, prio, id);
                }
                TaskState::Blocked => {
                    crate::wait::remove_from_object_wait(st, id);
                }
                _ => {}
            }
            let deleting_self = st.running == Some(id);
            let ctx = st.tasks.remove(id).unwrap().ctx;
            if deleting_self {
                st.running = None;
                let next = dispatch_next(st);
                st.tasks.get_mut(next).unwrap().state = TaskState::Running;
                st.running = Some(next);
                let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
                // `ctx` is deliberately never passed to `context_destroy`
                // here: it's this very thread's own backing context, and a
                // thread can't join itself. Passing it as `prev_ctx`
                // instead parks this thread inside `context_switch`
                // forever, which is the correct terminal state for a
                // self-deleted task on every backend.
                return Step::Block {
                    prev_ctx: Some(ctx),
                    next_ctx,
                    finish: Box::new(|_st| Ok(())),
                };
            }
            self.hal.context_destroy(ctx);
            Step::Done(Ok(()))
        })
    }

    pub fn t_suspend(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let task = match st.tasks.get_mut(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => t,
                Some(_) => return Step::Done(Err(KernelError::ObjDeleted)),
                None => return Step::Done(Err(KernelError::ObjId)),
            };
            if task.explicit_suspend {
                return Step::Done(Err(KernelError::Suspended));
            }
            task.explicit_suspend = true;
            match task.state {
                TaskState::Ready => {
                    let prio = task.priority;
                    task.state = TaskState::Suspended;
                    st.ready.remove(&mut st.tasks, prio, id);
                    Step::Done(Ok(()))
                }
                TaskState::Running => {
                    task.state = TaskState::Suspended;
                    let prev_ctx = task.ctx.clone();
                    st.running = None;
                    let next = dispatch_next(st);
                    st.tasks.get_mut(next).unwrap().state = TaskState::Running;
                    st.running = Some(next);
                    let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
                    Step::Block {
                        prev_ctx: Some(prev_ctx),
                        next_ctx,
                        finish: Box::new(|_st| Ok(())),
                    }
                }
                _ => Step::Done(Ok(())), // Blocked/Created: flag alone suffices
            }
        })
    }

    pub fn t_resume(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let task = match st.tasks.get_mut(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => t,
                Some(_) => return Step::Done(Err(KernelError::ObjDeleted)),
                None => return Step::Done(Err(KernelError::ObjId)),
            };
            if !task.explicit_suspend {
                return Step::Done(Err(KernelError::NotSuspended));
            }
            task.explicit_suspend = false;
            if task.state == TaskState::Suspended {
                let prio = task.priority;
                task.state = TaskState::Ready;
                st.ready.push_back(&mut st.tasks, prio, id);
                st.preempt_pending = true;
            }
            Step::Done(Ok(()))
        })
    }

    pub fn t_setpri(&self, id: Id, new_priority: u8) -> Result<u8> {
        self.run(move |_k, st| {
            if new_priority == 0 {
                return Step::Done(Err(KernelError::SetPri));
            }
            let task = match st.tasks.get_mut(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => t,
                Some(_) => return Step::Done(Err(KernelError::ObjDeleted)),
                None => return Step::Done(Err(KernelError::ObjId)),
            };
            let old = task.priority;
            let was_ready = task.state == TaskState::Ready;
            if was_ready {
                st.ready.remove(&mut st.tasks, old, id);
            }
            st.tasks.get_mut(id).unwrap().priority = new_priority;
            if was_ready {
                st.ready.push_back(&mut st.tasks, new_priority, id);
            }
            st.preempt_pending = true;
            Step::Done(Ok(old))
        })
    }

    /// Update the calling task's mode bits: `(mode & !mask) | (new & mask)`
    /// — only the bits named in `mask` are touched (spec §9 Open
    /// Questions: the mask+new-bits form is the correct pSOS semantics,
    /// not the set-only `|=` form an older source path used).
    pub fn t_mode(&self, mask: ModeFlags, new: ModeFlags) -> Result<ModeFlags> {
        self.run(move |_k, st| {
            let quantum = st.cfg.time_slice_ticks;
            let running = st.running.unwrap();
            let task = st.tasks.get_mut(running).unwrap();
            let old = task.mode;
            task.mode = (old & !mask) | (new & mask);
            sync_slice_budget(task, quantum);
            st.preempt_pending = true;
            Step::Done(Ok(old))
        })
    }

    pub fn t_restart(&self, id: Id, args: EntryArgs) -> Result<()> {
        self.run(move |_k, st| {
            let (entry, stack_size) = {
                let task = match st.tasks.get_mut(id) {
                    Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => t,
                    Some(_) => return Step::Done(Err(KernelError::ObjDeleted)),
                    None => return Step::Done(Err(KernelError::ObjId)),
                };
                match task.entry {
                    Some((entry, _)) => (entry, task.stack_size),
                    None => return Step::Done(Err(KernelError::NotActive)),
                }
            };
            let restarting_self = st.running == Some(id);
            let new_ctx = self.hal.context_create(stack_size, entry, args);
            let (old_ctx, was_ready_or_running, was_blocked) = {
                let task = st.tasks.get_mut(id).unwrap();
                let old_ctx = core::mem::replace(&mut task.ctx, new_ctx);
                task.entry = Some((entry, args));
                task.pending_events = 0;
                task.waiting_events = 0;
                task.waiting_on = None;
                task.explicit_suspend = false;
                let was_ready_or_running = matches!(task.state, TaskState::Ready | TaskState::Running);
                let was_blocked = task.state == TaskState::Blocked;
                (old_ctx, was_ready_or_running, was_blocked)
            };
            if was_blocked {
                crate::wait::remove_from_object_wait(st, id);
            }
            if restarting_self {
                let prio = st.tasks.get(id).unwrap().priority;
                st.tasks.get_mut(id).unwrap().state = TaskState::Ready;
                st.ready.push_back(&mut st.tasks, prio, id);
                st.running = None;
                let next = dispatch_next(st);
                st.tasks.get_mut(next).unwrap().state = TaskState::Running;
                st.running = Some(next);
                let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
                // Same reasoning as `t_delete`'s self path: `old_ctx` is
                // this thread's own context and can't be destroyed from
                // within itself, so it's handed to `context_switch` as
                // `prev_ctx` instead and never reclaimed.
                return Step::Block {
                    prev_ctx: Some(old_ctx),
                    next_ctx,
                    finish: Box::new(|_st| Ok(())),
                };
            }
            self.hal.context_destroy(old_ctx);
            if !was_ready_or_running {
                let prio = st.tasks.get(id).unwrap().priority;
                st.tasks.get_mut(id).unwrap().state = TaskState::Ready;
                st.ready.push_back(&mut st.tasks, prio, id);
                st.preempt_pending = true;
            }
            Step::Done(Ok(()))
        })
    }

    pub fn t_getreg(&self, id_or_self: u8, reg_num: u8) -> Result<u32> {
        self.run(move |_k, st| {
            let id = if id_or_self == nimbus_hal::Id::SELF {
                st.running.unwrap()
            } else {
                match nimbus_hal::Id::new(id_or_self) {
                    Some(i) => i,
                    None => return Step::Done(Err(KernelError::ObjId)),
                }
            };
            if reg_num > 6 {
                return Step::Done(Err(KernelError::RegNum));
            }
            match st.tasks.get(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => {
                    Step::Done(Ok(t.regs[reg_num as usize]))
                }
                Some(_) => Step::Done(Err(KernelError::ObjDeleted)),
                None => Step::Done(Err(KernelError::ObjId)),
            }
        })
    }

    pub fn t_setreg(&self, id_or_self: u8, reg_num: u8, value: u32) -> Result<()> {
        self.run(move |_k, st| {
            let id = if id_or_self == nimbus_hal::Id::SELF {
                st.running.unwrap()
            } else {
                match nimbus_hal::Id::new(id_or_self) {
                    Some(i) => i,
                    None => return Step::Done(Err(KernelError::ObjId)),
                }
            };
            if reg_num > 6 {
                return Step::Done(Err(KernelError::RegNum));
            }
            match st.tasks.get_mut(id) {
                Some(t) if t.state != TaskState::Free && t.state != TaskState::Deleted => {
                    t.regs[reg_num as usize] = value;
                    Step::Done(Ok(()))
                }
                Some(_) => Step::Done(Err(KernelError::ObjDeleted)),
                None => Step::Done(Err(KernelError::ObjId)),
            }
        })
    }

    pub fn t_ident(&self, name: Option<[u8; 4]>) -> Result<Id> {
        self.run(move |_k, st| match name {
            None => Step::Done(Ok(st.running.unwrap())),
            Some(name) => {
                for (id, task) in st.tasks.iter() {
                    if task.name == name
                        && task.state != TaskState::Free
                        && task.state != TaskState::Deleted
                    {
                        return Step::Done(Ok(id));
                    }
                }
                Step::Done(Err(KernelError::ObjNotFound))
            }
        })
    }

    /// Decrement the running task's time-slice budget (if `TIME_SLICE` is
    /// set) and, on expiry, move it to the tail of its priority level.
    /// Called once per tick from [`Kernel::tm_tick`], never re-entrantly
    /// with any other syscall.
    pub(crate) fn tick_time_slice(&self, st: &mut KState<H>) {
        let Some(running) = st.running else { return };
        if running == st.idle_task {
            return;
        }
        let task = st.tasks.get_mut(running).unwrap();
        if !task.mode.contains(ModeFlags::TIME_SLICE) {
            return;
        }
        if task.slice_remaining == 0 {
            return;
        }
        task.slice_remaining -= 1;
        if task.slice_remaining == 0 {
            let prio = task.priority;
            task.slice_remaining = task.slice_budget.max(1);
            task.state = TaskState::Ready;
            st.ready.push_back(&mut st.tasks, prio, running);
            st.running = None;
            let next = dispatch_next(st);
            st.tasks.get_mut(next).unwrap().state = TaskState::Running;
            st.running = Some(next);
            st.preempt_pending = false; // we already just switched
            let prev_ctx = st.tasks.get(running).unwrap().ctx.clone();
            let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
            self.hal.context_switch(Some(&prev_ctx), &next_ctx);
        }
    }
}

fn noop_entry(_args: EntryArgs) {}

/// Arm or disarm a task's time-slice quantum to match its current mode
/// bits. Called anywhere `task.mode` is assigned (`t_create`, `t_start`,
/// `t_mode`) so `tick_time_slice` always has a real budget to count down
/// whenever `ModeFlags::TIME_SLICE` is set, rather than the permanently
/// zero budget it's created with.
fn sync_slice_budget<H: Hal>(task: &mut Task<H>, quantum_ticks: u32) {
    if task.mode.contains(ModeFlags::TIME_SLICE) {
        task.slice_budget = quantum_ticks.max(1);
        task.slice_remaining = task.slice_budget;
    } else {
        task.slice_budget = 0;
        task.slice_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_update_only_touches_masked_bits() {
        let old = ModeFlags::NO_PREEMPT | ModeFlags::NO_ASR;
        let mask = ModeFlags::NO_PREEMPT;
        let new = ModeFlags::empty();
        let updated = (old & !mask) | (new & mask);
        assert!(updated.contains(ModeFlags::NO_ASR));
        assert!(!updated.contains(ModeFlags::NO_PREEMPT));
    }
}
