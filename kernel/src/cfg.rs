//! Kernel configuration, resolved once at [`crate::Kernel::new`] time.
//!
//! The teacher's `cfg.rs` builds a static configuration at compile time via
//! a macro-driven builder consumed by `#[r3::app]`. Per the spec's Design
//! Notes ("keep stable small integer ids as the public interface, but
//! model objects as entries in an arena owned by the kernel singleton"),
//! this kernel resolves the equivalent configuration at runtime instead,
//! so `KernelConfig` is an ordinary struct rather than a macro surface.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Maximum number of user tasks created via `t_create`. Hard ceiling:
    /// 64 (spec §8 boundary behavior: the 65th concurrent `t_create` must
    /// return `NoTcb`). The idle task is not counted against this limit —
    /// [`crate::Kernel::new`] sizes the underlying task pool at
    /// `max_tasks + 1` to reserve its slot separately.
    pub max_tasks: usize,
    pub max_semaphores: usize,
    pub max_queues: usize,
    pub max_timers: usize,
    /// Total 16-byte message slots shared by every queue's ring buffer.
    /// Hard ceiling: 2048.
    pub max_message_slots: usize,
    /// Default semaphore count ceiling when not overridden at creation.
    pub default_semaphore_ceiling: u32,
    /// Tick source frequency. The original API documents 10 ms ticks
    /// (100 Hz); this is also the unit `tm_wkafter`'s `ticks` argument is
    /// expressed in.
    pub tick_rate_hz: u32,
    /// Minimum combined system+user stack size accepted by `t_create`.
    pub min_stack_bytes: usize,
    /// Total stack bytes the kernel is willing to commit across all tasks
    /// (a crude stand-in for the embedded target's fixed RAM budget; the
    /// host backend doesn't actually carve memory from this pool, but
    /// still enforces the limit so the two backends behave identically).
    pub max_total_stack_bytes: usize,
    /// Ticks granted per quantum to a task started with `ModeFlags::TIME_SLICE`.
    /// Applied whenever a task's mode gains that bit (`t_create`, `t_start`,
    /// `t_mode`); a task without the bit is never charged against it.
    pub time_slice_ticks: u32,
}

pub const MAX_TASK_POOL: usize = 64;
pub const MAX_MESSAGE_ARENA: usize = 2048;

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: MAX_TASK_POOL,
            max_semaphores: 64,
            max_queues: 64,
            max_timers: 64,
            max_message_slots: MAX_MESSAGE_ARENA,
            default_semaphore_ceiling: 8,
            tick_rate_hz: 100,
            min_stack_bytes: 256,
            max_total_stack_bytes: 16 * 1024 * 1024,
            time_slice_ticks: 10,
        }
    }
}

impl KernelConfig {
    /// Duration in milliseconds of a single tick, per the original API's
    /// "10 ms per tick" documentation at the default 100 Hz rate.
    pub fn tick_ms(&self) -> u64 {
        1000 / self.tick_rate_hz as u64
    }
}
