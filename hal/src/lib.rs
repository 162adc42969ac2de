//! Hardware-abstraction boundary (C1) for the nimbus kernel.
//!
//! This crate defines the small, fixed capability set the kernel core
//! (`nimbus-kernel`) needs from whatever is actually running the CPU. Two
//! implementations exist: `nimbus-host` (one OS thread per task, gated by a
//! mutex and per-task condvars) and `nimbus-cortexm` (PendSV-based context
//! switch with PSP task stacks on real hardware). The kernel core is
//! generic over [`Hal`] and never assumes which backend it's linked
//! against.
#![no_std]

extern crate alloc;

mod error;
mod id;

pub use error::{KernelError, Result};
pub use id::Id;

use alloc::sync::Arc;

/// Register arguments passed to a newly created task's entry point,
/// mirroring the four general-purpose argument registers (R0..R3) used by
/// the embedded calling convention.
pub type EntryArgs = [u32; 4];

/// A task's entry point: an ordinary function taking its four argument
/// words.
pub type TaskEntry = fn(EntryArgs);

/// The hardware-abstraction interface consumed by the kernel core.
///
/// All methods are invoked only while the calling task (or ISR, on
/// embedded) holds the kernel's critical section, except
/// [`Hal::critical_enter`]/[`Hal::critical_exit`] themselves, which are the
/// primitive the rest of the kernel uses to establish that section.
pub trait Hal: Send + Sync + 'static {
    /// Opaque per-task execution context (host: thread handle + condvar;
    /// embedded: saved stack pointer). Required to be cheaply `Clone` so
    /// the kernel core can copy a context handle out of the task pool
    /// before calling [`Hal::context_switch`], rather than holding a
    /// borrow of the pool across the switch.
    type Context: Send + Clone + 'static;

    /// Enter the kernel's critical section. Nestable: a second call before
    /// the matching [`Hal::critical_exit`] is a no-op at the hardware
    /// level but must still be balanced by a corresponding exit.
    ///
    /// On embedded this raises PRIMASK (disables interrupts); on host this
    /// acquires (recursively) the global kernel lock.
    fn critical_enter(&self);

    /// Leave one level of the critical section entered by
    /// [`Hal::critical_enter`].
    fn critical_exit(&self);

    /// Arrange for `on_tick` to be invoked at `rate_hz`. Called exactly
    /// once, during kernel startup.
    ///
    /// On embedded this configures and starts SysTick; on host this spawns
    /// a dedicated timer thread (or registers a periodic signal).
    fn tick_source_start(&self, rate_hz: u32, on_tick: Arc<dyn Fn() + Send + Sync>);

    /// Arrange for a one-shot wakeup when the tick counter reaches
    /// `abs_tick`, so the timer wheel (C3) doesn't need to scan on every
    /// tick while a long sleep dominates. A new call supersedes any
    /// previously armed alarm.
    fn alarm_set(&self, abs_tick: u64);

    /// Disarm the alarm set by [`Hal::alarm_set`], if any.
    fn alarm_clear(&self);

    /// Build a new, not-yet-scheduled execution context.
    ///
    /// On embedded this lays out an exception frame on `stack` with
    /// PSR=Thumb, PC=`entry`, R0..R3=`args`. On host this spawns a thread
    /// parked on its own condvar until the scheduler first dispatches it.
    fn context_create(&self, stack_size: usize, entry: TaskEntry, args: EntryArgs)
        -> Self::Context;

    /// Save `prev`'s callee-saved state (if any — `None` only at the very
    /// first dispatch out of the idle bootstrap) and resume `next`.
    ///
    /// Must be called with the critical section held; it is released (and
    /// possibly re-entered, depending on the backend) as part of the
    /// switch. On embedded this pends the context-switch exception; on
    /// host this signals `next`'s condvar and waits on `prev`'s.
    fn context_switch(&self, prev: Option<&Self::Context>, next: &Self::Context);

    /// Reclaim whatever HAL resources `ctx` holds (joins the host thread;
    /// frees the embedded stack frame bookkeeping). Guaranteed to be
    /// called exactly once per context, on every deletion/restart path.
    fn context_destroy(&self, ctx: Self::Context);
}
