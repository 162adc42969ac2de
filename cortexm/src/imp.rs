//! PendSV/SysTick implementation. Grounded on the classic Cortex-M
//! context-switch sequence (manually push/pop the callee-saved registers
//! the hardware doesn't auto-stack, triggered via `SCB::set_pendsv`):
//! `r4`-`r11` and `lr` are pushed by software on top of the hardware's own
//! `r0`-`r3`, `r12`, `lr`, `pc`, `xpsr` frame, giving a uniform 17-word
//! layout that task creation can also fabricate without ever having run.
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::ptr::write_volatile;
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::peripheral::{scb, syst::SystClkSource, SCB};

use nimbus_hal::{EntryArgs, Hal, TaskEntry};

/// A task's saved stack pointer plus the backing allocation, so
/// `context_destroy` frees it exactly once. Boxed and shared via `Arc`
/// because [`Hal::Context`] must be cheaply `Clone`: the kernel core
/// copies a context handle out of the task pool before every
/// `context_switch` rather than holding the pool borrow across it.
struct Inner {
    sp: Cell<*mut u32>,
    stack: UnsafeCell<Option<Box<[u32]>>>,
}

// Safety: every access happens with PRIMASK raised (the kernel's critical
// section); there is exactly one core and no real concurrency to race.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

#[derive(Clone)]
pub struct CortexContext(Arc<Inner>);

// 8 hardware-autostacked words (r0-r3, r12, lr, pc, xpsr) plus the 9 this
// port pushes by hand (r4-r11, r14) in `PendSV`.
const FRAME_WORDS: usize = 17;

fn build_frame(stack: &mut [u32], entry: TaskEntry, args: EntryArgs) -> *mut u32 {
    let mut sp = unsafe { stack.as_mut_ptr().add(stack.len()) };
    sp = ((sp as usize) & !0x7) as *mut u32;
    // `EntryArgs` is a 16-byte, 4-word-aligned aggregate of `u32`s, so
    // AAPCS passes it in r0-r3 rather than behind a hidden pointer.
    let frame: [u32; FRAME_WORDS] = [
        0x0100_0000,                    // xPSR: Thumb bit set
        entry as usize as u32,          // PC
        task_exit as usize as u32,      // LR (used if a task entry ever returns)
        0,                              // R12
        args[3],                        // R3
        args[2],                        // R2
        args[1],                        // R1
        args[0],                        // R0
        0xFFFF_FFFD,                    // software-tracked EXC_RETURN (no FPU)
        0,                              // R11
        0,                              // R10
        0,                              // R9
        0,                              // R8
        0,                              // R7
        0,                              // R6
        0,                              // R5
        0,                              // R4
    ];
    for word in frame {
        unsafe {
            sp = sp.sub(1);
            write_volatile(sp, word);
        }
    }
    sp
}

fn task_exit() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Statics the naked PendSV handler reads to learn which stack pointer to
/// save into and which to load; set immediately before `SCB::set_pendsv()`
/// and read back by `save_and_load_sp`, which runs on the exception stack
/// PendSV itself established.
static PREV_SP_SLOT: AtomicPtr<Cell<*mut u32>> = AtomicPtr::new(core::ptr::null_mut());
static NEXT_SP: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
static ON_TICK: AtomicPtr<Arc<dyn Fn() + Send + Sync>> = AtomicPtr::new(core::ptr::null_mut());

pub struct CortexMHal {
    crit_depth: Cell<u32>,
    crit_was_enabled: Cell<bool>,
}

// Safety: single core, and every field is only touched with interrupts
// masked via `critical_enter`/`critical_exit`.
unsafe impl Sync for CortexMHal {}

impl CortexMHal {
    pub fn new() -> Self {
        Self {
            crit_depth: Cell::new(0),
            crit_was_enabled: Cell::new(false),
        }
    }
}

impl Default for CortexMHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for CortexMHal {
    type Context = CortexContext;

    fn critical_enter(&self) {
        let depth = self.crit_depth.get();
        if depth == 0 {
            self.crit_was_enabled.set(cortex_m::register::primask::read().is_active());
            cortex_m::interrupt::disable();
        }
        self.crit_depth.set(depth + 1);
    }

    fn critical_exit(&self) {
        let depth = self.crit_depth.get();
        debug_assert!(depth > 0, "critical_exit without a matching critical_enter");
        self.crit_depth.set(depth - 1);
        if depth == 1 && self.crit_was_enabled.get() {
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    fn tick_source_start(&self, rate_hz: u32, on_tick: Arc<dyn Fn() + Send + Sync>) {
        ON_TICK.store(Box::into_raw(Box::new(on_tick)), Ordering::SeqCst);
        let mut cp = unsafe { cortex_m::Peripherals::steal() };
        let clock_hz: u32 = 64_000_000; // board-specific; wired up by the application in a full port
        cp.SYST.set_reload(clock_hz / rate_hz - 1);
        cp.SYST.clear_current();
        cp.SYST.set_clock_source(SystClkSource::Core);
        cp.SYST.enable_interrupt();
        cp.SYST.enable_counter();
        unsafe { cp.SCB.set_priority(scb::SystemHandler::PendSV, 0xFF) };
    }

    /// Tickful: every tick scans the timer list, so there's no one-shot
    /// hardware alarm to program here. A tickless port would reprogram
    /// SysTick's reload value instead; left as a follow-up since this
    /// backend isn't on the critical path for any tested scenario.
    fn alarm_set(&self, _abs_tick: u64) {}

    fn alarm_clear(&self) {}

    fn context_create(&self, stack_size: usize, entry: TaskEntry, args: EntryArgs) -> Self::Context {
        let words = stack_size / core::mem::size_of::<u32>();
        let mut stack: Box<[u32]> = alloc::vec![0u32; words].into_boxed_slice();
        let sp = build_frame(&mut stack, entry, args);
        CortexContext(Arc::new(Inner {
            sp: Cell::new(sp),
            stack: UnsafeCell::new(Some(stack)),
        }))
    }

    fn context_switch(&self, prev: Option<&Self::Context>, next: &Self::Context) {
        let Some(prev) = prev else {
            // The very first dispatch, out of `Kernel::start`'s call on the
            // reset stack (MSP): there's no PSP-based frame to save, so
            // jump straight into `next` instead of going through PendSV,
            // which would save over whatever garbage PSP currently holds.
            // Never returns.
            unsafe { dispatch_first(next.0.sp.get()) };
        };
        PREV_SP_SLOT.store(&prev.0.sp as *const Cell<*mut u32> as *mut Cell<*mut u32>, Ordering::SeqCst);
        NEXT_SP.store(next.0.sp.get(), Ordering::SeqCst);
        SCB::set_pendsv();
        cortex_m::asm::isb();
        // `save_and_load_sp`, invoked from the naked `PendSV` handler,
        // writes `prev`'s saved SP into `*PREV_SP_SLOT` before this
        // context is ever resumed, so by the time control genuinely
        // returns to this call (when something later switches back to
        // `prev`), the round trip is complete.
    }

    fn context_destroy(&self, ctx: Self::Context) {
        unsafe { *ctx.0.stack.get() = None };
    }
}

/// Called from the naked `PendSV` handler with `r0` = the just-saved
/// stack pointer of the context being switched away from. Returns the
/// stack pointer to resume.
#[no_mangle]
extern "C" fn save_and_load_sp(prev_sp: *mut u32) -> *mut u32 {
    let slot = PREV_SP_SLOT.swap(core::ptr::null_mut(), Ordering::SeqCst);
    if !slot.is_null() {
        unsafe { (*slot).set(prev_sp) };
    }
    NEXT_SP.load(Ordering::SeqCst)
}

#[no_mangle]
extern "C" fn systick_tick() {
    let ptr = ON_TICK.load(Ordering::SeqCst);
    if !ptr.is_null() {
        let f = unsafe { &*ptr };
        f();
    }
}

#[cortex_m_rt::exception]
fn SysTick() {
    systick_tick();
}

#[naked]
#[no_mangle]
unsafe extern "C" fn PendSV() {
    core::arch::asm!(
        "mrs     r0, psp",
        "stmdb   r0!, {{r4-r11, r14}}",
        "bl      save_and_load_sp",
        "ldmia   r0!, {{r4-r11, r14}}",
        "msr     psp, r0",
        "bx      lr",
        options(noreturn),
    )
}

/// Jump directly into the first task ever dispatched, switching to PSP
/// along the way. Called once, from [`CortexMHal::context_switch`]'s
/// `prev = None` case at kernel start; never returns.
unsafe fn dispatch_first(sp: *mut u32) -> ! {
    unsafe {
        core::arch::asm!(
            "msr    psp, {sp}",
            "mrs    r1, control",
            "orr    r1, r1, #2", // SPSEL = 1: use PSP in thread mode
            "msr    control, r1",
            "isb",
            "ldmia  sp!, {{r4-r11, r14}}",
            "ldmia  sp!, {{r0-r3}}",
            "ldmia  sp!, {{r12, r14}}",
            "ldmia  sp!, {{r1, r2}}", // pop PC (r1) and discard xPSR (r2)
            "bx     r1",
            sp = in(reg) sp,
            options(noreturn),
        )
    }
}
