//! Cortex-M `Hal`: PendSV-driven context switches between tasks running on
//! their own PSP stack, SysTick as the tick source, and PRIMASK as the
//! critical section.
//!
//! Grounded on the teacher's `r3_port_arm_m` split between "the registers
//! this port needs" (stack frame layout, naked PendSV/SysTick handlers) and
//! "the kernel-facing trait impl"; this port trades `r3_port_arm_m`'s
//! compile-time, const-generic task table for the dynamic [`nimbus_hal::Id`]
//! pools the rest of this workspace uses, so there's no `use_port!` macro
//! here — just one ordinary `Hal` impl.
//!
//! Like the rest of the embedded-targeting side of this workspace,
//! `cortex-m`/`cortex-m-rt` are `cfg(target_os = "none")`-gated
//! dependencies so `cargo test --workspace` keeps working on a dev host;
//! on a hosted target this crate is an inert, empty shell.
#![no_std]

extern crate alloc;

#[cfg(target_os = "none")]
mod imp;

#[cfg(target_os = "none")]
pub use imp::CortexMHal;
