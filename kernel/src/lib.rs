//! Generic pSOS-style microkernel core.
//!
//! [`Kernel`] is generic over [`Hal`] and implements every syscall in the
//! public surface: tasks (C2, `task` module), the timer wheel (C3, `timer`
//! module), semaphores (C4, `semaphore`), message queues (C5, `queue`) and
//! per-task events (C6, `event`). It owns no threads and no interrupt
//! vectors itself — those belong entirely to the `Hal` implementation
//! (`nimbus-host` or `nimbus-cortexm`) it's instantiated with.
//!
//! # Locking model
//!
//! Grounded on `r3_kernel`'s `klock` module: all kernel state lives behind
//! a single critical section, entered/exited via [`Hal::critical_enter`]/
//! [`Hal::critical_exit`]. The teacher enforces "no access to kernel state
//! without holding the section" with a compile-time token
//! (`tokenlock::UnsyncTokenLock`). This kernel is dynamic rather than
//! const-generic (ids are pool indices resolved at runtime, per the spec's
//! Design Notes), so instead it keeps kernel state behind a plain
//! [`core::cell::UnsafeCell`] and accesses it only through short-lived
//! `&mut` borrows taken fresh inside each critical section — in
//! particular, never across a call to [`Hal::context_switch`], which is
//! the one point where control (and, on the host backend, the underlying
//! OS mutex) genuinely passes to another thread. See `state_mut`'s safety
//! comment.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cfg;
mod clock;
mod event;
mod links;
mod pool;
mod prio;
mod queue;
mod semaphore;
mod task;
mod timer;
mod wait;

pub use nimbus_hal::{Id, KernelError, Result};

pub use event::{EventFlags, EvRecvFlags, WaitCondition};
pub use queue::{Message, QueueFlags};
pub use semaphore::{SemFlags, SemOrder};
pub use task::{ModeFlags, TaskCreateFlags, TaskState};
pub use timer::{TimerAction, TimerKind};

use alloc::sync::Arc;
use core::cell::UnsafeCell;

use nimbus_hal::Hal;

use cfg::KernelConfig;
use clock::Clock;
use pool::Pool;
use prio::ReadyQueue;
use queue::{MsgArena, Queue};
use semaphore::Semaphore;
use task::Task;
use timer::{Timer, TimerList};

/// All kernel state protected by the critical section. Every field here is
/// private to the crate; syscalls access it exclusively through
/// [`Kernel::state_mut`].
pub(crate) struct KState<H: Hal> {
    pub tasks: Pool<Task<H>>,
    pub ready: ReadyQueue,
    pub running: Option<Id>,
    pub idle_task: Id,
    pub semaphores: Pool<Semaphore>,
    pub queues: Pool<Queue>,
    pub msg_arena: MsgArena,
    pub timers: Pool<Timer>,
    pub timer_list: TimerList,
    pub clock: Clock,
    pub cfg: KernelConfig,
    /// Set by a syscall when it has changed the readiness of some task and
    /// the running task's priority no longer has exclusive claim on the
    /// CPU. Consumed (and acted on) at the end of every syscall and every
    /// tick.
    pub preempt_pending: bool,
}

/// The result of one step of kernel-state mutation: either the syscall is
/// already done, or the calling task must block and a context switch is
/// required before the result can be computed.
pub(crate) enum Step<H: Hal, T> {
    Done(Result<T>),
    Block {
        prev_ctx: Option<H::Context>,
        next_ctx: H::Context,
        finish: alloc::boxed::Box<dyn FnOnce(&mut KState<H>) -> Result<T>>,
    },
}

/// The kernel singleton. Construct with [`Kernel::new`], then call
/// [`Kernel::start`] exactly once to boot the idle task and the tick
/// source.
pub struct Kernel<H: Hal> {
    hal: H,
    state: UnsafeCell<KState<H>>,
}

// Safety: all access to `state` goes through `state_mut`, which is only
// ever called while `hal`'s critical section is held, and the resulting
// borrow is never held across a call that could let another thread
// observe or mutate the same `Kernel` (notably `Hal::context_switch`).
// This gives the single-writer guarantee `UnsafeCell` needs without
// requiring `H::Context` or the pools to be `Sync` themselves.
unsafe impl<H: Hal> Sync for Kernel<H> {}

impl<H: Hal> Kernel<H> {
    /// Construct a new kernel with the given configuration, without
    /// starting it. `idle_entry` is the entry point for the mandatory
    /// priority-255 idle task (spec §4.2: "an idle task of priority 255 is
    /// created at kernel init and never blocks").
    pub fn new(hal: H, cfg: KernelConfig, idle_entry: nimbus_hal::TaskEntry) -> Arc<Self> {
        let mut tasks = Pool::new(cfg.max_tasks + 1);
        let idle = Task::new_idle(&hal, idle_entry);
        let idle_task = tasks
            .insert(idle)
            .expect("idle task is the first allocation into a non-empty pool");

        let state = KState {
            tasks,
            ready: ReadyQueue::new(),
            running: None,
            idle_task,
            semaphores: Pool::new(cfg.max_semaphores),
            queues: Pool::new(cfg.max_queues),
            msg_arena: MsgArena::new(cfg.max_message_slots),
            timers: Pool::new(cfg.max_timers),
            timer_list: TimerList::new(),
            clock: Clock::new(cfg.tick_rate_hz),
            cfg,
            preempt_pending: false,
        };

        Arc::new(Self {
            hal,
            state: UnsafeCell::new(state),
        })
    }

    /// Start the tick source and dispatch the first task. Any task
    /// created and started (`t_create`/`t_start`) before this call is
    /// already sitting on the ready queue, so the dispatched task is
    /// whichever of those has the highest priority; the idle task (spec
    /// §4.2, priority 255) only runs once nothing else is ready. After
    /// this returns, the calling thread has handed off the CPU entirely
    /// on the host backend (the dispatched task now owns it) or the
    /// scheduler is live and will dispatch on the next interrupt
    /// (embedded).
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.hal.tick_source_start(
            self.state_ref().cfg.tick_rate_hz,
            Arc::new(move || {
                if let Some(k) = weak.upgrade() {
                    k.tm_tick();
                }
            }),
        );

        self.hal.critical_enter();
        let st = self.state_mut();
        let first = match st.ready.pop_highest(&mut st.tasks) {
            Some((_, id)) => id,
            None => st.idle_task,
        };
        st.tasks.get_mut(first).unwrap().state = TaskState::Running;
        let first_ctx = st.tasks.get(first).unwrap().ctx.clone();
        st.running = Some(first);
        self.hal.context_switch(None, &first_ctx);
        self.hal.critical_exit();
    }

    /// # Safety (not actually unsafe, but see the module doc)
    ///
    /// Must only be called while `hal.critical_enter()` is in effect, and
    /// the returned borrow must not be held across a call to
    /// `hal.context_switch`.
    #[inline]
    pub(crate) fn state_mut(&self) -> &mut KState<H> {
        unsafe { &mut *self.state.get() }
    }

    #[inline]
    pub(crate) fn state_ref(&self) -> &KState<H> {
        unsafe { &*self.state.get() }
    }

    /// Run one syscall: enter the critical section, execute `f`, and
    /// either return its result directly or perform the context switch it
    /// requested and finish the call afterward. Every public syscall
    /// method bottoms out in this function exactly once; no syscall calls
    /// another syscall method re-entrantly.
    pub(crate) fn run<T>(&self, f: impl FnOnce(&Self, &mut KState<H>) -> Step<H, T>) -> Result<T> {
        self.hal.critical_enter();
        let step = f(self, self.state_mut());
        let result = match step {
            Step::Done(r) => r,
            Step::Block {
                prev_ctx,
                next_ctx,
                finish,
            } => {
                self.hal.context_switch(prev_ctx.as_ref(), &next_ctx);
                finish(self.state_mut())
            }
        };
        let st = self.state_mut();
        if st.preempt_pending {
            st.preempt_pending = false;
            self.reschedule_if_needed(st);
        }
        self.hal.critical_exit();
        result
    }

    /// If a higher-priority task than whoever's currently marked running
    /// has become ready, switch to it. Called at the end of every syscall
    /// that might have readied a task, and from the tick handler.
    pub(crate) fn reschedule_if_needed(&self, st: &mut KState<H>) {
        let running = match st.running {
            Some(r) => r,
            None => return,
        };
        if running == st.idle_task {
            // the idle task always yields to anything else that's ready
        } else {
            let running_prio = st.tasks.get(running).unwrap().priority;
            if st
                .tasks
                .get(running)
                .unwrap()
                .mode
                .contains(ModeFlags::NO_PREEMPT)
            {
                return;
            }
            match st.ready.highest_prio() {
                Some(p) if p < running_prio => {}
                _ => return,
            }
        }
        let Some((_, next)) = st.ready.pop_highest(&mut st.tasks) else {
            return;
        };
        let prev_ctx = st.tasks.get(running).unwrap().ctx.clone();
        let next_ctx = st.tasks.get(next).unwrap().ctx.clone();
        if running != st.idle_task {
            let prio = {
                let prev_task = st.tasks.get_mut(running).unwrap();
                prev_task.state = TaskState::Ready;
                prev_task.priority
            };
            st.ready.push_back(&mut st.tasks, prio, running);
        }
        st.tasks.get_mut(next).unwrap().state = TaskState::Running;
        st.running = Some(next);
        // Safety: called from within `run`'s critical section with no
        // live borrow of `st` surviving the call (we drop back to the
        // caller immediately, which only holds a fresh `&mut` taken after
        // this returns).
        self.hal.context_switch(Some(&prev_ctx), &next_ctx);
    }

    /// Halt the kernel after logging a fatal, unrecoverable error. Never
    /// returns.
    pub fn k_fatal(&self, code: KernelError, flags: task::FatalFlags) -> ! {
        log::error!("k_fatal: code={code:?} ({:#04x}) flags={flags:?}", code.code());
        loop {
            core::hint::spin_loop();
        }
    }
}
