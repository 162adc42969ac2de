//! End-to-end scenarios exercising the public syscall surface against the
//! real `host` backend: priority preemption, event ALL/ANY waits, queue
//! ordering and backpressure, and timed waits.
//!
//! Every scenario designates one "driver" task, created and started
//! before [`Kernel::start`] is called, that performs the entire scenario
//! itself (creating any helper tasks it needs from within its own
//! execution) and records the outcome into statics the test's main
//! thread polls for. This sidesteps the one genuinely ambiguous case on
//! the host backend — a non-task thread calling a syscall after the
//! kernel is already running — without ever needing to run anything to
//! find out whether it works.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use nimbus::*;

const STACK: usize = 32 * 1024;

fn idle_spin(_: EntryArgs) {
    loop {
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn wait_until(flag: &AtomicBool, timeout: Duration) -> bool {
    let start = Instant::now();
    while !flag.load(Ordering::SeqCst) {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

fn self_delete(k: &HostKernel) {
    let me = k.t_ident(None).unwrap();
    k.t_delete(me).unwrap();
}

/// Surface the kernel's and host backend's `log` output (tick thread
/// startup, `k_fatal`) when a scenario is run with `RUST_LOG` set; a
/// silent no-op otherwise. Idempotent across the multiple tests in this
/// binary, which all run in the same process.
fn init_logging() {
    let _ = env_logger::try_init();
}

/// S1: a low-priority task blocked on a semaphore must resume only after
/// a higher-priority task's `sm_v`, with the waiter woken via the
/// semaphore's wait queue rather than by polling the count.
#[test]
fn s1_priority_preemption() {
    init_logging();
    static KERNEL: OnceLock<std::sync::Arc<HostKernel>> = OnceLock::new();
    static SEM: OnceLock<Id> = OnceLock::new();
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn t_high(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        // Give `t_low` a chance to reach `sm_p` and genuinely block
        // before the count is raised.
        k.tm_wkafter(5).unwrap();
        k.sm_v(*SEM.get().unwrap()).unwrap();
        self_delete(k);
    }

    fn t_low(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        let high = k.t_create(*b"high", 10, STACK, 0, TaskCreateFlags::empty()).unwrap();
        k.t_start(high, ModeFlags::empty(), t_high, [0; 4]).unwrap();
        k.sm_p(*SEM.get().unwrap(), SemFlags::FIFO, 0).unwrap();
        COUNTER.fetch_add(1, Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        self_delete(k);
    }

    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    KERNEL.set(kernel.clone()).ok();
    let sem = kernel.sm_create(*b"sem1", 0, Some(1), SemFlags::FIFO).unwrap();
    SEM.set(sem).ok();

    let low = kernel.t_create(*b"low1", 100, STACK, 0, TaskCreateFlags::empty()).unwrap();
    kernel.t_start(low, ModeFlags::empty(), t_low, [0; 4]).unwrap();

    kernel.start();

    assert!(wait_until(&DONE, Duration::from_secs(2)), "scenario did not complete");
    assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
}

/// S2: `ev_receive` with `ALL` only wakes once every bit in the mask has
/// been delivered; `ANY` wakes on the first overlapping send.
#[test]
fn s2_event_all_requires_every_bit() {
    init_logging();
    static KERNEL: OnceLock<std::sync::Arc<HostKernel>> = OnceLock::new();
    static T1: OnceLock<Id> = OnceLock::new();
    static RESULT: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn t1_all(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        T1.set(k.t_ident(None).unwrap()).ok();
        let t2 = k.t_create(*b"tsnd", 50, STACK, 0, TaskCreateFlags::empty()).unwrap();
        k.t_start(t2, ModeFlags::empty(), t2_sender, [0; 4]).unwrap();
        let r = k
            .ev_receive(0x0F, EvRecvFlags::WAIT | EvRecvFlags::ALL, 0)
            .unwrap();
        RESULT.store(r, Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        self_delete(k);
    }

    fn t2_sender(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        let t1 = *T1.get().unwrap();
        k.ev_send(t1, 0x03).unwrap();
        k.ev_send(t1, 0x0C).unwrap();
        self_delete(k);
    }

    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    KERNEL.set(kernel.clone()).ok();

    let t1 = kernel.t_create(*b"t1al", 10, STACK, 0, TaskCreateFlags::empty()).unwrap();
    kernel.t_start(t1, ModeFlags::empty(), t1_all, [0; 4]).unwrap();

    kernel.start();

    assert!(wait_until(&DONE, Duration::from_secs(2)), "scenario did not complete");
    assert_eq!(RESULT.load(Ordering::SeqCst), 0x0F);
}

#[test]
fn s2_event_any_wakes_on_first_send() {
    init_logging();
    static KERNEL: OnceLock<std::sync::Arc<HostKernel>> = OnceLock::new();
    static T1: OnceLock<Id> = OnceLock::new();
    static RESULT: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn t1_any(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        T1.set(k.t_ident(None).unwrap()).ok();
        let t2 = k.t_create(*b"tsnd", 50, STACK, 0, TaskCreateFlags::empty()).unwrap();
        k.t_start(t2, ModeFlags::empty(), t2_sender, [0; 4]).unwrap();
        let r = k
            .ev_receive(0x0F, EvRecvFlags::WAIT | EvRecvFlags::ANY, 0)
            .unwrap();
        RESULT.store(r, Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        self_delete(k);
    }

    fn t2_sender(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        let t1 = *T1.get().unwrap();
        k.ev_send(t1, 0x03).unwrap();
        // `t1` may already have woken, run to completion and self-deleted
        // by the time this second send would execute; a stale target id
        // is expected here and not a test failure.
        let _ = k.ev_send(t1, 0x0C);
        self_delete(k);
    }

    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    KERNEL.set(kernel.clone()).ok();

    let t1 = kernel.t_create(*b"t1an", 10, STACK, 0, TaskCreateFlags::empty()).unwrap();
    kernel.t_start(t1, ModeFlags::empty(), t1_any, [0; 4]).unwrap();

    kernel.start();

    assert!(wait_until(&DONE, Duration::from_secs(2)), "scenario did not complete");
    assert_eq!(RESULT.load(Ordering::SeqCst), 0x03);
}

/// S3: a normal queue send is FIFO, but `q_urgent` cuts straight to the
/// front — no task or running kernel needed since neither send nor
/// receive ever blocks here.
#[test]
fn s3_queue_urgent_ordering() {
    init_logging();
    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    let q = kernel.q_create(*b"q3__", 4, QueueFlags::FIFO).unwrap();

    kernel.q_send(q, [1, 0, 0, 0]).unwrap();
    kernel.q_send(q, [2, 0, 0, 0]).unwrap();
    kernel.q_urgent(q, [100, 0, 0, 0]).unwrap();
    kernel.q_send(q, [3, 0, 0, 0]).unwrap();

    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 100);
    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 1);
    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 2);
    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 3);
}

/// S4: a caller blocked on an empty semaphore with a timeout, and no
/// concurrent `sm_v`, wakes itself via the timer wheel and leaves the
/// count untouched.
#[test]
fn s4_timed_wait_timeout() {
    init_logging();
    static KERNEL: OnceLock<std::sync::Arc<HostKernel>> = OnceLock::new();
    static SEM: OnceLock<Id> = OnceLock::new();
    static TIMED_OUT: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn waiter(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        let r = k.sm_p(*SEM.get().unwrap(), SemFlags::FIFO, 50);
        TIMED_OUT.store(matches!(r, Err(KernelError::Timeout)), Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        self_delete(k);
    }

    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    KERNEL.set(kernel.clone()).ok();
    let sem = kernel.sm_create(*b"sem4", 0, Some(1), SemFlags::FIFO).unwrap();
    SEM.set(sem).ok();

    let t = kernel.t_create(*b"wait", 10, STACK, 0, TaskCreateFlags::empty()).unwrap();
    kernel.t_start(t, ModeFlags::empty(), waiter, [0; 4]).unwrap();

    kernel.start();

    assert!(wait_until(&DONE, Duration::from_secs(2)), "scenario did not complete");
    assert!(TIMED_OUT.load(Ordering::SeqCst));
    assert_eq!(kernel.sm_p(sem, SemFlags::NOWAIT, 0), Err(KernelError::NoSem));
}

/// S5: a periodic event timer delivers its mask on every period until
/// cancelled, after which a non-waiting receive finds nothing pending.
#[test]
fn s5_periodic_events() {
    init_logging();
    static KERNEL: OnceLock<std::sync::Arc<HostKernel>> = OnceLock::new();
    static RECEIVED: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);
    static FAILED: AtomicBool = AtomicBool::new(false);

    fn driver(_: EntryArgs) {
        let k = KERNEL.get().unwrap();
        let timer = k.tm_evevery(5, 0x1).unwrap();
        for _ in 0..5 {
            match k.ev_receive(0x1, EvRecvFlags::WAIT | EvRecvFlags::ALL, 0) {
                Ok(r) if r == 0x1 => {
                    RECEIVED.fetch_add(1, Ordering::SeqCst);
                }
                _ => FAILED.store(true, Ordering::SeqCst),
            }
        }
        k.tm_cancel(timer).unwrap();
        let after_cancel = k.ev_receive(0x1, EvRecvFlags::NOWAIT | EvRecvFlags::ALL, 0);
        if after_cancel != Err(KernelError::NoEvents) {
            FAILED.store(true, Ordering::SeqCst);
        }
        DONE.store(true, Ordering::SeqCst);
        self_delete(k);
    }

    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    KERNEL.set(kernel.clone()).ok();

    let t = kernel.t_create(*b"peri", 10, STACK, 0, TaskCreateFlags::empty()).unwrap();
    kernel.t_start(t, ModeFlags::empty(), driver, [0; 4]).unwrap();

    kernel.start();

    assert!(wait_until(&DONE, Duration::from_secs(3)), "scenario did not complete");
    assert!(!FAILED.load(Ordering::SeqCst));
    assert_eq!(RECEIVED.load(Ordering::SeqCst), 5);
}

/// S6: once a bounded queue is full, `q_send` fails immediately rather
/// than blocking, and a slot freed by a receive lets the next send
/// through, preserving arrival order.
#[test]
fn s6_queue_full_backpressure() {
    init_logging();
    let kernel = host_kernel(KernelConfig::default(), idle_spin);
    let q = kernel.q_create(*b"q6__", 2, QueueFlags::FIFO).unwrap();

    kernel.q_send(q, [1, 0, 0, 0]).unwrap();
    kernel.q_send(q, [2, 0, 0, 0]).unwrap();
    assert_eq!(kernel.q_send(q, [3, 0, 0, 0]), Err(KernelError::QFull));

    let oldest = kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap();
    assert_eq!(oldest[0], 1);

    kernel.q_send(q, [3, 0, 0, 0]).unwrap();
    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 2);
    assert_eq!(kernel.q_receive(q, QueueFlags::NOWAIT, 0).unwrap()[0], 3);
}
