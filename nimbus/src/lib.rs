//! Public facade over the pSOS-style microkernel: wires [`nimbus_kernel::Kernel`]
//! to a concrete [`nimbus_hal::Hal`] backend and re-exports the full syscall
//! surface (C2-C6) a caller needs without reaching into the individual
//! crates directly.
//!
//! Two backends are available, matching the spec's dual targets:
//!
//! - `host` (default): [`nimbus_host::StdHal`], one OS thread per task —
//!   for development and the test suite.
//! - `embedded`: [`nimbus_cortexm::CortexMHal`], PendSV/SysTick on real
//!   Cortex-M hardware.
//!
//! This crate only builds `no_std` when `host` is off, since the host
//! backend itself links `std` for its threads and condvars.
#![cfg_attr(not(feature = "host"), no_std)]

extern crate alloc;

pub use nimbus_hal::{EntryArgs, Id, KernelError, Result, TaskEntry};
pub use nimbus_kernel::cfg::KernelConfig;
pub use nimbus_kernel::{
    EvRecvFlags, EventFlags, Kernel, Message, ModeFlags, QueueFlags, SemFlags, SemOrder,
    TaskCreateFlags, TaskState, TimerAction, TimerKind, WaitCondition,
};

#[cfg(feature = "host")]
pub use nimbus_host::StdHal;
#[cfg(feature = "host")]
pub type HostKernel = Kernel<StdHal>;

#[cfg(feature = "embedded")]
pub use nimbus_cortexm::CortexMHal;
#[cfg(feature = "embedded")]
pub type EmbeddedKernel = Kernel<CortexMHal>;

/// Construct a [`HostKernel`], ready to accept `t_create`/`t_start` calls
/// from the calling thread. Those calls are always safe before
/// [`Kernel::start`] — the scheduler only begins dispatching once it's
/// called — after which the calling thread returns immediately rather
/// than becoming any task's execution context; the dispatched task runs
/// on its own OS thread from that point on.
#[cfg(feature = "host")]
pub fn host_kernel(cfg: KernelConfig, idle_entry: TaskEntry) -> alloc::sync::Arc<HostKernel> {
    Kernel::new(StdHal::new(), cfg, idle_entry)
}
