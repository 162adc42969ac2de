//! Fixed-capacity message queues (C5): per-queue ring buffers carved out
//! of one shared slot arena, plus a FIFO-or-priority wait list of
//! blocked receivers.
//!
//! Grounded on `r3_kernel`'s message-queue-as-thin-wrapper-over-a-slab
//! pattern (the teacher itself has no variable-length queue type; this
//! module's `q_v*` forwarders follow the spec's Non-goals note that
//! variable-length queues are out of scope beyond a thin forward to the
//! fixed 16-byte path).
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use nimbus_hal::{Hal, Id, KernelError, Result};

use crate::wait::{WaitOrder, WaitQueue, WakeReason};
use crate::{KState, Step};

/// A fixed 16-byte message: four 32-bit words (spec §3: "fixed 16-byte
/// (four 32-bit words) messages").
pub type Message = [u32; 4];

bitflags! {
    /// Shared namespace between `q_create`'s ordering bit and
    /// `q_receive`'s wait bit, matching the original header's flag
    /// reuse (same layout as [`crate::semaphore::SemFlags`]).
    pub struct QueueFlags: u32 {
        const FIFO = 0;
        const PRIOR = 0x02;
        const NOWAIT = 0x01;
    }
}

impl QueueFlags {
    pub fn order(self) -> WaitOrder {
        if self.contains(QueueFlags::PRIOR) {
            WaitOrder::Priority
        } else {
            WaitOrder::Fifo
        }
    }

    pub fn no_wait(self) -> bool {
        self.contains(QueueFlags::NOWAIT)
    }
}

/// Bump-then-free-list allocator over one process-wide slot arena
/// (spec §4.5: "a slab allocator with bump+free-list suffices because
/// queues are rarely created/destroyed after init").
pub(crate) struct MsgArena {
    storage: Vec<Message>,
    capacity: usize,
    bump: usize,
    free: Vec<(usize, usize)>,
}

impl MsgArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![[0; 4]; capacity],
            capacity,
            bump: 0,
            free: Vec::new(),
        }
    }

    /// Reserve `len` contiguous slots, first-fit against freed ranges
    /// before extending the bump pointer.
    fn alloc(&mut self, len: usize) -> Option<usize> {
        if let Some(pos) = self.free.iter().position(|&(_, l)| l >= len) {
            let (offset, range_len) = self.free.remove(pos);
            if range_len > len {
                self.free.push((offset + len, range_len - len));
            }
            return Some(offset);
        }
        if self.bump + len <= self.capacity {
            let offset = self.bump;
            self.bump += len;
            Some(offset)
        } else {
            None
        }
    }

    fn free_range(&mut self, offset: usize, len: usize) {
        self.free.push((offset, len));
    }

    fn slot(&self, offset: usize, index: usize, capacity: usize) -> Message {
        self.storage[offset + index % capacity]
    }

    fn set_slot(&mut self, offset: usize, index: usize, capacity: usize, msg: Message) {
        self.storage[offset + index % capacity] = msg;
    }
}

pub(crate) struct Queue {
    pub name: [u8; 4],
    offset: usize,
    capacity: usize,
    head: usize,
    tail: usize,
    depth: usize,
    pub high_water: usize,
    pub waiters: WaitQueue,
}

pub(crate) fn remove_waiter<H: Hal>(st: &mut KState<H>, q: Id, task: Id) {
    if let Some(q) = st.queues.get_mut(q) {
        q.waiters.remove(&mut st.tasks, task);
    }
}

/// Attempt to dequeue one message without blocking. Shared by
/// `q_receive`'s immediate-success path and its retry-on-wake path (spec
/// §4.5: "on wake, retry").
fn try_dequeue<H: Hal>(st: &mut KState<H>, id: Id) -> Option<Message> {
    let q = st.queues.get_mut(id)?;
    if q.depth == 0 {
        return None;
    }
    let msg = st.msg_arena.slot(q.offset, q.head, q.capacity);
    q.head = (q.head + 1) % q.capacity;
    q.depth -= 1;
    Some(msg)
}

impl<H: Hal> crate::Kernel<H> {
    pub fn q_create(&self, name: [u8; 4], capacity: usize, flags: QueueFlags) -> Result<Id> {
        self.run(move |_k, st| {
            if capacity == 0 {
                return Step::Done(Err(KernelError::NoMsgBuf));
            }
            let Some(offset) = st.msg_arena.alloc(capacity) else {
                return Step::Done(Err(KernelError::NoMsgBuf));
            };
            let queue = Queue {
                name,
                offset,
                capacity,
                head: 0,
                tail: 0,
                depth: 0,
                high_water: 0,
                waiters: WaitQueue::new(flags.order()),
            };
            match st.queues.insert(queue) {
                Some(id) => Step::Done(Ok(id)),
                None => {
                    st.msg_arena.free_range(offset, capacity);
                    Step::Done(Err(KernelError::NoQcb))
                }
            }
        })
    }

    pub fn q_delete(&self, id: Id) -> Result<()> {
        self.run(move |_k, st| {
            let Some(q) = st.queues.get_mut(id) else {
                return Step::Done(Err(KernelError::ObjId));
            };
            let waiters = q.waiters.drain(&mut st.tasks);
            let (offset, capacity) = (q.offset, q.capacity);
            st.queues.remove(id);
            st.msg_arena.free_range(offset, capacity);
            for w in waiters {
                crate::task::wake_task(st, w, WakeReason::ObjectDeleted);
            }
            st.preempt_pending = true;
            Step::Done(Ok(()))
        })
    }

    pub fn q_ident(&self, name: [u8; 4]) -> Result<Id> {
        self.run(move |_k, st| {
            for (id, q) in st.queues.iter() {
                if q.name == name {
                    return Step::Done(Ok(id));
                }
            }
            Step::Done(Err(KernelError::ObjNotFound))
        })
    }

    fn enqueue_at(&self, st: &mut KState<H>, id: Id, msg: Message, urgent: bool) -> Result<()> {
        let Some(q) = st.queues.get_mut(id) else {
            return Err(KernelError::ObjId);
        };
        if q.depth == q.capacity {
            return Err(KernelError::QFull);
        }
        let (offset, capacity) = (q.offset, q.capacity);
        if urgent {
            q.head = (q.head + capacity - 1) % capacity;
            let head = q.head;
            st.msg_arena.set_slot(offset, head, capacity, msg);
        } else {
            let tail = q.tail;
            st.msg_arena.set_slot(offset, tail, capacity, msg);
            q.tail = (q.tail + 1) % capacity;
        }
        q.depth += 1;
        q.high_water = q.high_water.max(q.depth);
        if let Some(waiter) = q.waiters.pop_front(&mut st.tasks) {
            crate::task::wake_task(st, waiter, WakeReason::Granted);
        }
        st.preempt_pending = true;
        Ok(())
    }

    pub fn q_send(&self, id: Id, msg: Message) -> Result<()> {
        self.run(move |k, st| Step::Done(k.enqueue_at(st, id, msg, false)))
    }

    /// Insert immediately before `head` instead of after `tail`, so the
    /// next receive sees it ahead of everything already queued (spec
    /// §4.5: "insert before head (ring wraps backwards)").
    pub fn q_urgent(&self, id: Id, msg: Message) -> Result<()> {
        self.run(move |k, st| Step::Done(k.enqueue_at(st, id, msg, true)))
    }

    /// Deliver `msg` directly to every currently waiting receiver
    /// without ever entering the ring buffer. Returns the number of
    /// receivers actually woken; `0` if there were none (spec §4.5: "the
    /// message is dropped").
    pub fn q_broadcast(&self, id: Id, msg: Message) -> Result<usize> {
        self.run(move |_k, st| {
            let Some(q) = st.queues.get_mut(id) else {
                return Step::Done(Err(KernelError::ObjId));
            };
            let waiters = q.waiters.drain(&mut st.tasks);
            let count = waiters.len();
            for w in &waiters {
                st.tasks.get_mut(*w).unwrap().broadcast_msg = Some(msg);
                crate::task::wake_task(st, *w, WakeReason::Granted);
            }
            if count > 0 {
                st.preempt_pending = true;
            }
            Step::Done(Ok(count))
        })
    }

    pub fn q_receive(&self, id: Id, flags: QueueFlags, timeout: u32) -> Result<Message> {
        self.run(move |k, st| {
            if st.queues.get(id).is_none() {
                return Step::Done(Err(KernelError::ObjId));
            }
            if let Some(msg) = try_dequeue(st, id) {
                return Step::Done(Ok(msg));
            }
            if flags.no_wait() {
                return Step::Done(Err(KernelError::NoMsg));
            }
            let running = st.running.unwrap();
            let priority = st.tasks.get(running).unwrap().priority;
            let q = st.queues.get_mut(id).unwrap();
            q.waiters.enqueue(&mut st.tasks, running, priority);
            crate::task::block_current(
                k,
                st,
                crate::wait::WaitingOn::Queue(id),
                timeout as u64,
                move |st, reason| match reason {
                    WakeReason::Granted => {
                        // `q_broadcast` delivers directly into
                        // `broadcast_msg`, bypassing the ring; every other
                        // wake path (ordinary send/urgent) left exactly one
                        // message in the ring for this receiver to retry for.
                        let task = st.tasks.get_mut(running).unwrap();
                        match task.broadcast_msg.take() {
                            Some(msg) => Ok(msg),
                            None => try_dequeue(st, id).ok_or(KernelError::NoMsg),
                        }
                    }
                    WakeReason::TimedOut => Err(KernelError::Timeout),
                    WakeReason::ObjectDeleted => Err(KernelError::ObjDeleted),
                },
            )
        })
    }

    /// Variable-length forwarders (spec Non-goals: "variable-length is a
    /// thin forwarder to [the fixed path]"). `len` is accepted and
    /// validated against the 16-byte fixed size but otherwise unused.
    pub fn q_vsend(&self, id: Id, msg: Message, len: usize) -> Result<()> {
        if len > core::mem::size_of::<Message>() {
            return Err(KernelError::QFull);
        }
        self.q_send(id, msg)
    }

    pub fn q_vurgent(&self, id: Id, msg: Message, len: usize) -> Result<()> {
        if len > core::mem::size_of::<Message>() {
            return Err(KernelError::QFull);
        }
        self.q_urgent(id, msg)
    }

    pub fn q_vreceive(&self, id: Id, flags: QueueFlags, timeout: u32) -> Result<(Message, usize)> {
        let msg = self.q_receive(id, flags, timeout)?;
        Ok((msg, core::mem::size_of::<Message>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_freed_range_before_bumping() {
        let mut arena = MsgArena::new(8);
        let a = arena.alloc(4).unwrap();
        let b = arena.alloc(4).unwrap();
        assert_eq!((a, b), (0, 4));
        assert!(arena.alloc(1).is_none());
        arena.free_range(a, 4);
        let c = arena.alloc(4).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn arena_exhausts_at_capacity() {
        let mut arena = MsgArena::new(4);
        assert!(arena.alloc(4).is_some());
        assert!(arena.alloc(1).is_none());
    }

    #[derive(Debug)]
    enum RingCmd {
        PushBack(u32),
        PushFront(u32),
        Pop,
    }

    fn interpret_ring_cmds(bytecode: &[u8]) -> impl Iterator<Item = RingCmd> + '_ {
        let mut i = 0;
        std::iter::from_fn(move || {
            let instr = bytecode.get(i..i + 5)?;
            i += 5;
            let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]);
            Some(match instr[0] % 3 {
                0 => RingCmd::PushBack(value),
                1 => RingCmd::PushFront(value),
                _ => RingCmd::Pop,
            })
        })
    }

    /// Drives one queue's ring span (`slot`/`set_slot` over a fixed
    /// `offset..offset+capacity` window, mirroring `enqueue_at`/
    /// `try_dequeue`'s own indexing) against a `VecDeque` reference model,
    /// checking the dequeued order matches after every step.
    #[quickcheck_macros::quickcheck]
    fn ring_matches_reference(bytecode: Vec<u8>) {
        const CAPACITY: usize = 8;
        let mut arena = MsgArena::new(CAPACITY);
        let offset = arena.alloc(CAPACITY).unwrap();
        let mut head = 0usize;
        let mut tail = 0usize;
        let mut depth = 0usize;
        let mut model = std::collections::VecDeque::new();

        for cmd in interpret_ring_cmds(&bytecode) {
            match cmd {
                RingCmd::PushBack(v) if depth < CAPACITY => {
                    arena.set_slot(offset, tail, CAPACITY, [v; 4]);
                    tail = (tail + 1) % CAPACITY;
                    depth += 1;
                    model.push_back([v; 4]);
                }
                RingCmd::PushFront(v) if depth < CAPACITY => {
                    head = (head + CAPACITY - 1) % CAPACITY;
                    arena.set_slot(offset, head, CAPACITY, [v; 4]);
                    depth += 1;
                    model.push_front([v; 4]);
                }
                RingCmd::Pop if depth > 0 => {
                    let got = arena.slot(offset, head, CAPACITY);
                    head = (head + 1) % CAPACITY;
                    depth -= 1;
                    assert_eq!(Some(got), model.pop_front());
                }
                _ => {}
            }
        }
    }
}
