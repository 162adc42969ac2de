//! Host `Hal`: one native OS thread per task, a recursive lock standing in
//! for the embedded critical section, and a dedicated timer thread driving
//! the tick source at real wall-clock intervals.
//!
//! Grounded on `r3_port_std`'s thread-per-task model (its `threading_unix`/
//! `threading_windows` back a cooperative scheduler with real OS threads
//! parked via a custom park/unpark primitive); this port is far simpler
//! because the kernel core here never needs to single-step a task (no UMS
//! fiber layer), so a plain per-task `Condvar` handoff suffices.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nimbus_hal::{EntryArgs, Hal, TaskEntry};

/// Recursive lock standing in for the embedded port's PRIMASK-based
/// critical section. Ordinary `enter`/`exit` just track a depth counter
/// against the current thread; [`CriticalSection::release_for_switch`] and
/// [`CriticalSection::reacquire_after_switch`] additionally let
/// [`StdHal::context_switch`] drop the section entirely while the calling
/// thread is parked, so the tick thread (or whichever thread resumes next)
/// can make progress in the meantime.
struct CriticalSection {
    state: Mutex<CritState>,
    free: Condvar,
}

struct CritState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl CriticalSection {
    fn new() -> Self {
        Self {
            state: Mutex::new(CritState { owner: None, depth: 0 }),
            free: Condvar::new(),
        }
    }

    fn enter(&self) {
        let me = thread::current().id();
        let mut g = self.state.lock().unwrap();
        loop {
            match g.owner {
                Some(owner) if owner == me => {
                    g.depth += 1;
                    return;
                }
                None => {
                    g.owner = Some(me);
                    g.depth = 1;
                    return;
                }
                Some(_) => g = self.free.wait(g).unwrap(),
            }
        }
    }

    fn exit(&self) {
        let mut g = self.state.lock().unwrap();
        debug_assert_eq!(g.owner, Some(thread::current().id()), "critical_exit without a matching critical_enter");
        g.depth -= 1;
        if g.depth == 0 {
            g.owner = None;
            self.free.notify_all();
        }
    }

    /// Drop the section unconditionally (regardless of nesting depth),
    /// returning the depth to restore once this thread is dispatched
    /// again.
    fn release_for_switch(&self) -> u32 {
        let mut g = self.state.lock().unwrap();
        let depth = g.depth;
        g.owner = None;
        g.depth = 0;
        self.free.notify_all();
        depth
    }

    fn reacquire_after_switch(&self, depth: u32) {
        let me = thread::current().id();
        let mut g = self.state.lock().unwrap();
        while g.owner.is_some() {
            g = self.free.wait(g).unwrap();
        }
        g.owner = Some(me);
        g.depth = depth;
    }
}

/// The run/park flag backing one task's dedicated thread. `run` is
/// consumed (reset to `false`) by the thread itself on waking, matching a
/// binary semaphore rather than a sticky event — a context is dispatched
/// at most once per [`StdHal::context_switch`] call naming it.
struct TaskHandle {
    run: Mutex<bool>,
    woken: Condvar,
    join: Mutex<Option<thread::JoinHandle<()>>>,
    /// Set by [`StdHal::context_destroy`] before its final wake, so the
    /// parked thread breaks out of [`task_thread_body`]'s loop and returns
    /// instead of re-parking, guaranteeing the subsequent `join()` completes.
    terminate: AtomicBool,
}

impl TaskHandle {
    /// Blocks until woken. Returns `false` if the wake was a termination
    /// request (the caller must stop dispatching and let its thread exit),
    /// `true` for an ordinary dispatch.
    fn park_until_run(&self) -> bool {
        let mut run = self.run.lock().unwrap();
        while !*run {
            run = self.woken.wait(run).unwrap();
        }
        *run = false;
        !self.terminate.load(Ordering::Acquire)
    }

    fn signal_run(&self) {
        let mut run = self.run.lock().unwrap();
        *run = true;
        self.woken.notify_all();
    }

    fn signal_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.signal_run();
    }
}

/// A task's execution context on the host backend: its dedicated thread's
/// run/park flag plus a slot for the `JoinHandle` so [`StdHal::context_destroy`]
/// can reclaim it. `Clone` just bumps the `Arc`, matching [`Hal::Context`]'s
/// requirement — the kernel copies a context handle out of the task pool
/// before every [`Hal::context_switch`] rather than holding a pool borrow
/// across it.
#[derive(Clone)]
pub struct StdContext(Arc<TaskHandle>);

/// `Hal` implementation for development and test builds: every task is a
/// real `std::thread`, mutual exclusion is a recursive lock rather than
/// disabled interrupts, and the tick source is a thread sleeping in a loop
/// rather than a hardware timer.
pub struct StdHal {
    crit: CriticalSection,
}

impl StdHal {
    pub fn new() -> Self {
        Self {
            crit: CriticalSection::new(),
        }
    }
}

impl Default for StdHal {
    fn default() -> Self {
        Self::new()
    }
}

fn task_thread_body(handle: Arc<TaskHandle>, entry: TaskEntry, args: EntryArgs) {
    if !handle.park_until_run() {
        return;
    }
    entry(args);
    // The original pSOS convention has a task end its own life via
    // `t_delete(SELF)`, never by returning from its entry function, so
    // falling off the end here has no syscall-level meaning. Park until
    // `context_destroy` either deletes this task (terminate) or, in
    // principle, redispatches it again.
    loop {
        if !handle.park_until_run() {
            return;
        }
    }
}

impl Hal for StdHal {
    type Context = StdContext;

    fn critical_enter(&self) {
        self.crit.enter();
    }

    fn critical_exit(&self) {
        self.crit.exit();
    }

    fn tick_source_start(&self, rate_hz: u32, on_tick: Arc<dyn Fn() + Send + Sync>) {
        log::debug!("starting tick thread at {rate_hz} Hz");
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64);
        thread::Builder::new()
            .name("nimbus-tick".into())
            .spawn(move || loop {
                thread::sleep(period);
                on_tick();
            })
            .expect("spawning the tick thread");
    }

    /// The host backend's tick thread already runs at a fixed real-time
    /// period regardless of whether anything is due, so there is no
    /// hardware one-shot to arm or disarm here; `tm_tick` scanning the
    /// timer list every period is cheap enough for a dev/test backend.
    /// The embedded backend is where `alarm_set`/`alarm_clear` earn their
    /// keep.
    fn alarm_set(&self, _abs_tick: u64) {}

    fn alarm_clear(&self) {}

    fn context_create(&self, stack_size: usize, entry: TaskEntry, args: EntryArgs) -> Self::Context {
        let handle = Arc::new(TaskHandle {
            run: Mutex::new(false),
            woken: Condvar::new(),
            join: Mutex::new(None),
            terminate: AtomicBool::new(false),
        });
        let thread_handle = handle.clone();
        let join = thread::Builder::new()
            .stack_size(stack_size.max(16 * 1024))
            .spawn(move || task_thread_body(thread_handle, entry, args))
            .expect("spawning a task thread");
        *handle.join.lock().unwrap() = Some(join);
        StdContext(handle)
    }

    fn context_switch(&self, prev: Option<&Self::Context>, next: &Self::Context) {
        let depth = self.crit.release_for_switch();
        next.0.signal_run();
        if let Some(prev) = prev {
            // An ordinary redispatch never sets `terminate`, only
            // `context_destroy` does, and it's never called on a context
            // that's still the running `prev` of a switch — so this wake
            // is always a real dispatch, not a termination request.
            prev.0.park_until_run();
        }
        self.crit.reacquire_after_switch(depth);
    }

    fn context_destroy(&self, ctx: Self::Context) {
        let join = ctx.0.join.lock().unwrap().take();
        if let Some(join) = join {
            if join.thread().id() == thread::current().id() {
                // A task can't join its own backing thread; `t_delete`'s
                // self-deletion path never calls this for its own
                // context, but guard against it anyway rather than
                // deadlock if a future caller ever does.
                return;
            }
            // The thread may still be parked waiting to be dispatched one
            // more time (a task deleted by another task, never having run
            // again since); wake it with the terminate flag set so it
            // breaks out of its park loop and returns instead of
            // re-parking, guaranteeing the join below doesn't hang.
            ctx.0.signal_terminate();
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn noop_task(_: EntryArgs) {}

    /// A task whose thread has already run `entry` to completion and is
    /// parked forever in `task_thread_body`'s tail loop (the pre-fix
    /// deadlock: `context_destroy`'s `join()` never returned for this
    /// case) must still be joinable once terminated.
    #[test]
    fn terminated_thread_exits_after_entry_returns() {
        let _ = env_logger::try_init();
        let handle = Arc::new(TaskHandle {
            run: Mutex::new(false),
            woken: Condvar::new(),
            join: Mutex::new(None),
            terminate: AtomicBool::new(false),
        });
        let thread_handle = handle.clone();
        let join = thread::spawn(move || task_thread_body(thread_handle, noop_task, [0; 4]));
        handle.signal_run();
        // Give the thread a chance to run `noop_task` to completion and
        // re-park in the tail loop before terminating it.
        thread::sleep(Duration::from_millis(20));
        handle.signal_terminate();
        join.join().expect("thread must exit instead of re-parking forever");
    }

    /// A task whose thread has never been dispatched at all (parked in
    /// `task_thread_body`'s very first `park_until_run`) must also exit
    /// cleanly rather than requiring a dispatch first.
    #[test]
    fn terminated_thread_exits_before_first_dispatch() {
        let _ = env_logger::try_init();
        let handle = Arc::new(TaskHandle {
            run: Mutex::new(false),
            woken: Condvar::new(),
            join: Mutex::new(None),
            terminate: AtomicBool::new(false),
        });
        let thread_handle = handle.clone();
        let join = thread::spawn(move || task_thread_body(thread_handle, noop_task, [0; 4]));
        handle.signal_terminate();
        join.join().expect("thread must exit instead of running entry");
    }

    #[test]
    fn critical_section_nests_on_the_same_thread() {
        let crit = CriticalSection::new();
        crit.enter();
        crit.enter();
        crit.exit();
        assert_eq!(crit.state.lock().unwrap().depth, 1);
        crit.exit();
        assert!(crit.state.lock().unwrap().owner.is_none());
    }

    #[test]
    fn critical_section_excludes_other_threads() {
        let crit = Arc::new(CriticalSection::new());
        crit.enter();
        let counter = Arc::new(AtomicU32::new(0));
        let crit2 = crit.clone();
        let counter2 = counter.clone();
        let other = thread::spawn(move || {
            crit2.enter();
            counter2.fetch_add(1, Ordering::SeqCst);
            crit2.exit();
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "other thread must not have entered yet");
        crit.exit();
        other.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
